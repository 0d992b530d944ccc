//! Experiment directory management.
//!
//! Every invocation gets a unique, increasing numeric id and its own
//! directory under `<root>/runs`, allocated safely across processes that share
//! the root. Runs are linked into a flat `index/` and optionally into a
//! `marked/` tree; a run that fails is moved into `fails/` with a trace.

pub mod alloc;
pub mod config;
pub mod delete;
pub mod error;
pub mod ids;
pub mod index;
pub mod layout;
pub mod links;
pub mod lock;
pub mod mark;
pub mod params;
pub mod quarantine;
pub mod query;
pub mod record;
pub mod run;

pub use alloc::AllocationRequest;
pub use config::ExperimentOptions;
pub use delete::DeleteReport;
pub use error::{Error, Interrupted, Result};
pub use layout::{DirectoryLayout, Location, OpenMode, RESERVED_DIRS};
pub use mark::MarkReport;
pub use params::{parse_assignment, parse_bool, Check, Params, Validators};
pub use quarantine::{
    Confirm, Disposition, FailureKind, FixedAnswer, QuarantinePolicy, RunError, RunFailure,
    RunOutcome, RunQuarantine, StdinConfirm,
};
pub use query::RecordEntry;
pub use record::Record;
pub use run::{RunDirectory, RunName};

use lock::RootLock;
use std::path::{Path, PathBuf};

/// A freshly created run: directory, written record, and the links made for it.
#[derive(Debug, Clone)]
pub struct StartedRun {
    pub run: RunDirectory,
    pub record: Record,
    pub links: Vec<PathBuf>,
}

/// Entry point tying the layout, allocation, publishing and quarantine together.
#[derive(Debug)]
pub struct Experiments {
    layout: DirectoryLayout,
    options: ExperimentOptions,
    validators: Validators,
}

impl Experiments {
    /// Opens (creating if needed) an absolute root.
    pub fn open(root: &Path, options: ExperimentOptions) -> Result<Self> {
        options.validate()?;
        let layout = DirectoryLayout::open(root, OpenMode::Create)?;
        Ok(Self {
            layout,
            options,
            validators: Validators::new(),
        })
    }

    /// Creates the layout if needed, then reads `<root>/exdir.yaml` and env overrides.
    pub fn init(root: &Path) -> Result<Self> {
        Self::load(DirectoryLayout::open(root, OpenMode::Create)?)
    }

    /// Like [`Experiments::init`], but the layout must already exist.
    pub fn open_existing(root: &Path) -> Result<Self> {
        Self::load(DirectoryLayout::open(root, OpenMode::Validate)?)
    }

    fn load(layout: DirectoryLayout) -> Result<Self> {
        let options = ExperimentOptions::load(&layout.config_path())?;
        Ok(Self {
            layout,
            options,
            validators: Validators::new(),
        })
    }

    /// Applies overrides (e.g. command line flags) on top of the loaded options.
    pub fn configure(&mut self, f: impl FnOnce(&mut ExperimentOptions)) -> Result<()> {
        let mut options = self.options.clone();
        f(&mut options);
        options.validate()?;
        self.options = options;
        Ok(())
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn options(&self) -> &ExperimentOptions {
        &self.options
    }

    pub fn validators_mut(&mut self) -> &mut Validators {
        &mut self.validators
    }

    /// Validates `params`, allocates a run directory, writes its record and
    /// publishes it. Temporary runs are neither indexed nor marked.
    pub fn start(&self, params: &Params, request: &AllocationRequest) -> Result<StartedRun> {
        self.validators.check(params)?;
        let run = alloc::allocate(&self.layout, request, self.options.zfill)?;
        let persisted = params.persisted();
        let record = Record::for_run(&run, persisted);
        record.write(&run.record_path())?;

        let mut links = Vec::new();
        if !run.is_tmp() {
            links.push(index::publish(&self.layout, &run)?);
            if !self.options.automark.is_empty() {
                // Volatile values still drive the mark path.
                links.push(mark::publish_automatic(
                    &self.layout,
                    &self.options.automark,
                    &run,
                    params.values(),
                )?);
            }
        }
        tracing::info!(run = %run.name, location = run.location.dir_name(), "started run");
        Ok(StartedRun { run, record, links })
    }

    /// Guard for a started run, configured with this root's quarantine policy.
    pub fn guard(&self, started: &StartedRun) -> Result<RunQuarantine> {
        RunQuarantine::new(
            self.layout.root(),
            started.run.clone(),
            started.links.clone(),
            self.options.quarantine.clone(),
        )
    }

    pub fn mark(&self, tag: &str, ids: &[u64]) -> Result<MarkReport> {
        mark::publish_manual(&self.layout, tag, ids)
    }

    pub fn delete(&self, ids: &[u64], all: bool) -> Result<DeleteReport> {
        delete::delete(&self.layout, ids, all)
    }

    pub fn records(&self, source: Option<&str>) -> Result<Vec<RecordEntry>> {
        query::records(&self.layout, source)
    }

    /// The id the next allocation would receive right now.
    pub fn next_id(&self) -> Result<u64> {
        let lock = RootLock::acquire(&self.layout)?;
        ids::next_id(&self.layout, &lock)
    }

    pub fn run_count(&self) -> Result<usize> {
        ids::count_runs(&self.layout)
    }
}
