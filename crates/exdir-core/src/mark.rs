//! Hierarchical `marked/` view.
//!
//! Manual marks link records: `marked/<tag>/<run-name>.yaml -> runs/<run>/params.yaml`.
//! Automatic marks link whole run directories, under a path built from
//! parameter values: `marked/<k1>/<v1>/<k2>/<v2>/<run-name> -> runs/<run>`.

use crate::error::{Error, IoContext, Result};
use crate::ids::scan_run_names;
use crate::layout::{is_reserved, DirectoryLayout, Location};
use crate::links::link_relative;
use crate::run::RunDirectory;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkReport {
    pub created: Vec<PathBuf>,
    /// Requested ids with no matching run in `runs/`.
    pub missing: BTreeSet<u64>,
}

impl MarkReport {
    pub fn missing_message(&self) -> Option<String> {
        missing_runs_message(&self.missing)
    }
}

/// `runs {2, 5} were not found`
pub fn missing_runs_message(missing: &BTreeSet<u64>) -> Option<String> {
    if missing.is_empty() {
        return None;
    }
    let list = missing
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("runs {{{}}} were not found", list))
}

/// A path segment chosen by the user: a manual tag component or an automark key.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(Error::MarkInput(format!("invalid mark segment '{}'", segment)));
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::MarkInput(format!(
            "mark segment '{}' must not be purely numeric",
            segment
        )));
    }
    if is_reserved(segment) {
        return Err(Error::MarkInput(format!(
            "mark segment '{}' is a reserved directory name",
            segment
        )));
    }
    Ok(())
}

/// Splits a path-like tag (`group/sub`) and validates every component.
pub fn parse_tag(tag: &str) -> Result<Vec<String>> {
    let trimmed = tag.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::MarkInput("mark tag is empty".to_string()));
    }
    let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
    for segment in &segments {
        validate_segment(segment)?;
    }
    Ok(segments)
}

pub fn mark_dir(layout: &DirectoryLayout, segments: &[String]) -> PathBuf {
    segments
        .iter()
        .fold(layout.marked(), |dir, segment| dir.join(segment))
}

/// Links the records of the requested runs under `marked/<tag>/`.
///
/// Input is validated before anything touches the disk. Ids that do not
/// match a run in `runs/` are collected into the report instead of failing.
pub fn publish_manual(layout: &DirectoryLayout, tag: &str, ids: &[u64]) -> Result<MarkReport> {
    let segments = parse_tag(tag)?;
    if ids.is_empty() {
        return Err(Error::MarkInput("no run ids given".to_string()));
    }
    let requested: BTreeSet<u64> = ids.iter().copied().collect();
    let matches: Vec<RunDirectory> = scan_run_names(&layout.runs())?
        .into_iter()
        .filter(|name| requested.contains(&name.id))
        .map(|name| RunDirectory::new(layout, name, Location::Runs))
        .collect();

    let mut report = MarkReport::default();
    if !matches.is_empty() {
        let dir = mark_dir(layout, &segments);
        fs::create_dir_all(&dir).at(&dir)?;
        for run in &matches {
            let link = dir.join(run.name.record_link_name());
            report.created.push(link_relative(&run.record_path(), &link)?);
        }
    }
    let found: BTreeSet<u64> = matches.iter().map(RunDirectory::id).collect();
    report.missing = requested.difference(&found).copied().collect();
    if let Some(message) = report.missing_message() {
        tracing::warn!(tag, missing = ?report.missing, "{}", message);
    }
    tracing::info!(tag, created = report.created.len(), "marked runs");
    Ok(report)
}

/// Path segment for a parameter value. Values are exempt from the manual
/// naming rules (`9` or `runs` are legitimate values); only separators and
/// dot-only names are rewritten.
pub fn value_segment(value: Option<&Value>) -> String {
    let raw = match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let cleaned = raw.replace(['/', '\\'], "_");
    if cleaned.is_empty() {
        "_".to_string()
    } else if cleaned == "." || cleaned == ".." {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

/// Builds `marked/<k1>/<v1>/.../` from `keys` and links the run directory there.
pub fn automatic_mark_path(
    layout: &DirectoryLayout,
    keys: &[String],
    run: &RunDirectory,
    params: &BTreeMap<String, Value>,
) -> Result<PathBuf> {
    if keys.is_empty() {
        return Err(Error::MarkInput("no automark keys configured".to_string()));
    }
    let mut dir = layout.marked();
    for key in keys {
        validate_segment(key)?;
        dir.push(key);
        dir.push(value_segment(params.get(key)));
    }
    Ok(dir.join(run.name.as_str()))
}

pub fn publish_automatic(
    layout: &DirectoryLayout,
    keys: &[String],
    run: &RunDirectory,
    params: &BTreeMap<String, Value>,
) -> Result<PathBuf> {
    let link = automatic_mark_path(layout, keys, run, params)?;
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    link_relative(&run.path, &link)?;
    tracing::debug!(run = %run.name, link = %link.display(), "published automatic mark");
    Ok(link)
}
