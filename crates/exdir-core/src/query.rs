use crate::error::{Error, Result};
use crate::layout::DirectoryLayout;
use crate::record::Record;
use crate::run::{RunName, RECORD_EXT, RECORD_FILE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub record: Record,
    /// Absolute path of the run directory, from the record's `root`.
    pub run_dir: PathBuf,
    /// Where the record was found (index entry, mark link or file).
    pub source: PathBuf,
}

/// Records reachable from `index/` (`source = None`) or from `marked/<source>`.
/// Sorted by id; each run appears once.
pub fn records(layout: &DirectoryLayout, source: Option<&str>) -> Result<Vec<RecordEntry>> {
    let base = match source {
        None => layout.index(),
        Some(tag) => {
            let dir = mark_source_dir(layout, tag)?;
            if !dir.exists() {
                return Err(Error::MarkInput(format!("unknown mark '{}'", tag)));
            }
            dir
        }
    };

    let mut by_id: BTreeMap<u64, RecordEntry> = BTreeMap::new();
    for entry in walkdir::WalkDir::new(&base).follow_links(true).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(base = %base.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_record_name(entry.path()) {
            continue;
        }
        let record = match Record::load(entry.path()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("skipping record: {e}");
                continue;
            }
        };
        let Some(id) = record.id() else {
            continue;
        };
        let run_dir = match record.root() {
            Some(rel) => layout.root().join(rel),
            None => continue,
        };
        by_id.entry(id).or_insert(RecordEntry {
            record,
            run_dir,
            source: entry.path().to_path_buf(),
        });
    }
    Ok(by_id.into_values().collect())
}

/// Mark paths may include automark values (`k/9`), so only traversal is refused.
fn mark_source_dir(layout: &DirectoryLayout, source: &str) -> Result<PathBuf> {
    let trimmed = source.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::MarkInput("mark path is empty".to_string()));
    }
    let mut dir = layout.marked();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::MarkInput(format!("invalid mark path '{}'", source)));
        }
        dir.push(segment);
    }
    Ok(dir)
}

fn is_record_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    if name == RECORD_FILE {
        return true;
    }
    name.strip_suffix(RECORD_EXT)
        .and_then(|stem| stem.strip_suffix('.'))
        .and_then(RunName::parse)
        .is_some()
}
