//! Failure quarantine for a running workload.
//!
//! A [`RunQuarantine`] wraps the body of a run. If the body returns an error,
//! panics, or the guard is dropped without [`RunQuarantine::complete`], the run
//! directory is renamed into `fails/`, its index entry and every mark pointing
//! into it are removed and `fails/<run-name>/traceback.txt` is written. This
//! happens exactly once.

use crate::error::{Interrupted, IoContext, Result};
use crate::index;
use crate::layout::{DirectoryLayout, Location, OpenMode};
use crate::links::{remove_link, remove_links_into};
use crate::params::parse_bool;
use crate::record::Record;
use crate::run::RunDirectory;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

pub const TRACEBACK_FILE: &str = "traceback.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantinePolicy {
    /// Ask on the terminal before moving a failed run.
    pub interactive: bool,
    pub prompt_timeout_secs: u64,
    /// Answer used when the prompt times out or stdin is unusable.
    pub default_quarantine: bool,
    /// Operator interrupts are only logged unless this is set.
    pub quarantine_interrupts: bool,
    /// Return [`RunOutcome::Suppressed`] instead of an error for failures
    /// that were not quarantined (interrupts, declined prompts).
    pub suppress_noncritical: bool,
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        Self {
            interactive: false,
            prompt_timeout_secs: 10,
            default_quarantine: true,
            quarantine_interrupts: false,
            suppress_noncritical: false,
        }
    }
}

impl QuarantinePolicy {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Panic,
    Interrupted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

/// Why a guarded run ended abnormally, with the text written to the trace file.
#[derive(Debug)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
    pub error: Option<anyhow::Error>,
}

impl RunFailure {
    pub fn from_error(error: anyhow::Error) -> Self {
        let kind = if is_interrupt(&error) {
            FailureKind::Interrupted
        } else {
            FailureKind::Error
        };
        Self {
            kind,
            message: error.to_string(),
            trace: format!("{:?}", error),
            error: Some(error),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            kind: FailureKind::Panic,
            trace: format!("panicked: {}", message),
            message,
            error: None,
        }
    }

    fn dropped(panicking: bool) -> Self {
        let message = if panicking {
            "thread panicked while the run was in progress".to_string()
        } else {
            "run guard dropped before the run completed".to_string()
        };
        Self {
            kind: if panicking {
                FailureKind::Panic
            } else {
                FailureKind::Error
            },
            trace: message.clone(),
            message,
            error: None,
        }
    }

    fn render(&self, run: &RunDirectory) -> String {
        format!(
            "run: {}\nkind: {}\nquarantined_at: {}\n\n{}\n",
            run.name,
            self.kind.as_str(),
            Local::now().format("%Y-%m-%dT%H:%M:%S"),
            self.trace
        )
    }
}

/// True for [`Interrupted`] or an interrupted `io::Error` anywhere in the chain.
pub fn is_interrupt(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<Interrupted>().is_some()
            || cause
                .downcast_ref::<std::io::Error>()
                .map(|e| e.kind() == std::io::ErrorKind::Interrupted)
                .unwrap_or(false)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The run now lives at this path under `fails/`.
    Quarantined(PathBuf),
    /// Left where it was, by policy or by the operator's answer.
    Kept,
    /// Quarantine was attempted but could not finish.
    Unsettled(String),
}

#[derive(Debug, thiserror::Error)]
#[error("run {run} failed ({}): {}", .failure.kind.as_str(), .failure.message)]
pub struct RunError {
    pub run: String,
    pub failure: RunFailure,
    pub disposition: Disposition,
}

#[derive(Debug)]
pub enum RunOutcome<T> {
    Completed(T),
    Suppressed {
        failure: RunFailure,
        disposition: Disposition,
    },
}

/// Yes/no question with a bounded wait.
pub trait Confirm {
    fn confirm(&mut self, question: &str, timeout: Duration, default: bool) -> bool;
}

/// Prompts on stderr and reads one line from stdin on a helper thread.
///
/// On timeout the helper stays blocked on stdin; it is detached and ends with
/// the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str, timeout: Duration, default: bool) -> bool {
        eprint!(
            "{} [{}] (defaults to {} in {}s): ",
            question,
            if default { "Y/n" } else { "y/N" },
            if default { "yes" } else { "no" },
            timeout.as_secs()
        );
        read_answer(|line| std::io::stdin().read_line(line), timeout, default)
    }
}

/// Runs `read_line` on a helper thread and turns the line into an answer.
/// EOF, an empty line, a read error or no line within `timeout` all give `default`.
fn read_answer<F>(read_line: F, timeout: Duration, default: bool) -> bool
where
    F: FnOnce(&mut String) -> std::io::Result<usize> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let read = read_line(&mut line).map(|n| (n, line));
        let _ = tx.send(read);
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok((0, _))) => default,
        Ok(Ok((_, line))) => {
            let answer = line.trim();
            if answer.is_empty() {
                default
            } else {
                parse_bool(answer).unwrap_or_else(|| {
                    tracing::warn!(answer, "unrecognised answer, using default");
                    default
                })
            }
        }
        Ok(Err(e)) => {
            tracing::warn!("cannot read answer: {e}");
            default
        }
        Err(_) => {
            eprintln!();
            tracing::warn!(timeout_secs = timeout.as_secs(), "no answer, using default");
            default
        }
    }
}

/// Fixed answer; `None` behaves like a timeout.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub Option<bool>);

impl Confirm for FixedAnswer {
    fn confirm(&mut self, _question: &str, _timeout: Duration, default: bool) -> bool {
        self.0.unwrap_or(default)
    }
}

pub struct RunQuarantine {
    layout: DirectoryLayout,
    run: RunDirectory,
    links: Vec<PathBuf>,
    policy: QuarantinePolicy,
    confirm: Box<dyn Confirm + Send>,
    settled: bool,
}

impl std::fmt::Debug for RunQuarantine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQuarantine")
            .field("run", &self.run.name.as_str())
            .field("links", &self.links)
            .field("policy", &self.policy)
            .field("settled", &self.settled)
            .finish()
    }
}

impl RunQuarantine {
    /// Reopens `root` in validate mode; a guard never creates layout.
    pub fn new(
        root: &Path,
        run: RunDirectory,
        links: Vec<PathBuf>,
        policy: QuarantinePolicy,
    ) -> Result<Self> {
        let layout = DirectoryLayout::open(root, OpenMode::Validate)?;
        Ok(Self {
            layout,
            run,
            links,
            policy,
            confirm: Box::new(StdinConfirm),
            settled: false,
        })
    }

    pub fn with_confirm(mut self, confirm: impl Confirm + Send + 'static) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    pub fn run(&self) -> &RunDirectory {
        &self.run
    }

    pub fn links(&self) -> &[PathBuf] {
        &self.links
    }

    /// Registers a symlink created after the guard, e.g. a later manual mark.
    pub fn track_link(&mut self, link: PathBuf) {
        self.links.push(link);
    }

    /// Normal exit: the run and its links stay as they are.
    pub fn complete(mut self) -> RunDirectory {
        self.settled = true;
        self.run.clone()
    }

    /// Abnormal exit reported by the caller.
    pub fn fail(mut self, failure: &RunFailure) -> Result<Disposition> {
        self.settle(failure)
    }

    /// Runs `body`, catching errors and panics. After a failure the quarantine
    /// bookkeeping is finished before the failure is returned.
    pub fn execute<T, F>(mut self, body: F) -> std::result::Result<RunOutcome<T>, RunError>
    where
        F: FnOnce(&RunDirectory) -> anyhow::Result<T>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&self.run)));
        let failure = match outcome {
            Ok(Ok(value)) => {
                self.complete();
                return Ok(RunOutcome::Completed(value));
            }
            Ok(Err(error)) => RunFailure::from_error(error),
            Err(payload) => RunFailure::from_panic(payload),
        };
        let disposition = match self.settle(&failure) {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::error!(run = %self.run.name, "quarantine failed: {e}");
                Disposition::Unsettled(e.to_string())
            }
        };
        let noncritical = matches!(disposition, Disposition::Kept);
        if noncritical && self.policy.suppress_noncritical {
            return Ok(RunOutcome::Suppressed {
                failure,
                disposition,
            });
        }
        Err(RunError {
            run: self.run.name.to_string(),
            failure,
            disposition,
        })
    }

    fn settle(&mut self, failure: &RunFailure) -> Result<Disposition> {
        if self.settled {
            return Ok(Disposition::Kept);
        }
        self.settled = true;

        if failure.kind == FailureKind::Interrupted && !self.policy.quarantine_interrupts {
            tracing::warn!(
                run = %self.run.name,
                "run interrupted: {}; leaving it in place",
                failure.message
            );
            return Ok(Disposition::Kept);
        }
        if self.policy.interactive {
            let question = format!(
                "run {} failed ({}). Move it to {}?",
                self.run.name,
                failure.message,
                Location::Fails.dir_name()
            );
            let timeout = self.policy.prompt_timeout();
            let default = self.policy.default_quarantine;
            if !self.confirm.confirm(&question, timeout, default) {
                tracing::warn!(run = %self.run.name, "quarantine declined; run left in place");
                return Ok(Disposition::Kept);
            }
        }
        self.quarantine(failure).map(Disposition::Quarantined)
    }

    fn quarantine(&mut self, failure: &RunFailure) -> Result<PathBuf> {
        let previous = self.run.path.clone();
        let dest = self.layout.fails().join(self.run.name.as_str());
        if self.run.location != Location::Fails {
            // Same root, so normally the same filesystem and an atomic rename.
            // Across devices rename fails and the run stays where it was.
            fs::rename(&self.run.path, &dest).at(&self.run.path)?;
        }
        let from = self.run.location;
        self.run = RunDirectory::new(&self.layout, self.run.name.clone(), Location::Fails);

        for link in self.links.drain(..) {
            if let Err(e) = remove_link(&link) {
                tracing::warn!(link = %link.display(), "failed to remove link: {e}");
            }
        }
        // Marks made while the run was going were never handed to the guard.
        match remove_links_into(&self.layout.marked(), &[previous]) {
            Ok(removed) if !removed.is_empty() => {
                tracing::debug!(run = %self.run.name, count = removed.len(), "removed marks");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(run = %self.run.name, "failed to sweep marks: {e}"),
        }
        if let Err(e) = index::unpublish(&self.layout, &self.run.name) {
            tracing::warn!(run = %self.run.name, "failed to remove index entry: {e}");
        }

        let record_path = self.run.record_path();
        if record_path.is_file() {
            let relocated = Record::load(&record_path).and_then(|mut record| {
                record.set_root(&self.run.root_relative());
                record.write(&record_path)
            });
            if let Err(e) = relocated {
                tracing::warn!(record = %record_path.display(), "failed to update record root: {e}");
            }
        }

        let trace_path = dest.join(TRACEBACK_FILE);
        fs::write(&trace_path, failure.render(&self.run)).at(&trace_path)?;
        tracing::info!(
            run = %self.run.name,
            from = from.dir_name(),
            trace = %trace_path.display(),
            "quarantined failed run"
        );
        Ok(dest)
    }
}

impl Drop for RunQuarantine {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let failure = RunFailure::dropped(std::thread::panicking());
        if let Err(e) = self.settle(&failure) {
            tracing::error!(run = %self.run.name, "quarantine on drop failed: {e}");
        }
    }
}
