use crate::error::{Error, IoContext, Result};
use crate::layout::{DirectoryLayout, Location};
use crate::lock::RootLock;
use crate::run::RunName;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Highest id present in `runs`, `tmp` and `fails`, re-read from disk each call.
///
/// Callers that go on to create a directory must hold the [`RootLock`];
/// otherwise two processes can compute the same id.
pub fn max_id(layout: &DirectoryLayout) -> Result<u64> {
    let mut max = 0;
    for location in Location::ALL {
        for name in scan_run_names(&layout.location_dir(location))? {
            max = max.max(name.id);
        }
    }
    Ok(max)
}

pub fn next_id(layout: &DirectoryLayout, _lock: &RootLock) -> Result<u64> {
    let max = max_id(layout)?;
    max.checked_add(1).ok_or_else(|| {
        Error::invalid_root(layout.root(), format!("run id {} leaves no id to allocate", max))
    })
}

/// Run names directly under `dir`; entries that do not look like runs are skipped.
pub fn scan_run_names(dir: &Path) -> Result<Vec<RunName>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).at(dir),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.at(dir)?;
        let file_name = entry.file_name();
        let Some(raw) = file_name.to_str() else {
            continue;
        };
        match RunName::parse(raw) {
            Some(name) => names.push(name),
            None => tracing::trace!(entry = raw, dir = %dir.display(), "skipping non-run entry"),
        }
    }
    names.sort_by_key(|n| n.id);
    Ok(names)
}

/// Number of runs currently in `runs/`.
pub fn count_runs(layout: &DirectoryLayout) -> Result<usize> {
    Ok(scan_run_names(&layout.runs())?.len())
}
