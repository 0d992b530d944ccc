use crate::error::{Error, IoContext, Result};
use crate::ids::scan_run_names;
use crate::index::unpublish;
use crate::layout::{DirectoryLayout, Location};
use crate::links::remove_links_into;
use crate::mark::missing_runs_message;
use crate::run::RunDirectory;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Runs whose index entry was removed.
    pub unindexed: Vec<String>,
    /// Run directories removed (only with `all`).
    pub removed: Vec<PathBuf>,
    /// Mark links removed (only with `all`).
    pub unmarked: Vec<PathBuf>,
    pub missing: BTreeSet<u64>,
}

impl DeleteReport {
    pub fn missing_message(&self) -> Option<String> {
        missing_runs_message(&self.missing)
    }
}

/// Drops runs from the index; with `all`, also their marks and directories.
pub fn delete(layout: &DirectoryLayout, ids: &[u64], all: bool) -> Result<DeleteReport> {
    if ids.is_empty() {
        return Err(Error::MarkInput("no run ids given".to_string()));
    }
    let requested: BTreeSet<u64> = ids.iter().copied().collect();
    let matches: Vec<RunDirectory> = scan_run_names(&layout.runs())?
        .into_iter()
        .filter(|name| requested.contains(&name.id))
        .map(|name| RunDirectory::new(layout, name, Location::Runs))
        .collect();

    let mut report = DeleteReport::default();
    for run in &matches {
        if unpublish(layout, &run.name)? {
            report.unindexed.push(run.name.to_string());
        }
    }
    if all {
        let targets: Vec<PathBuf> = matches.iter().map(|r| r.path.clone()).collect();
        report.unmarked = remove_links_into(&layout.marked(), &targets)?;
        for run in &matches {
            fs::remove_dir_all(&run.path).at(&run.path)?;
            tracing::info!(run = %run.name, "deleted run directory");
            report.removed.push(run.path.clone());
        }
    }

    let found: BTreeSet<u64> = matches.iter().map(RunDirectory::id).collect();
    report.missing = requested.difference(&found).copied().collect();
    if let Some(message) = report.missing_message() {
        tracing::warn!(missing = ?report.missing, "{}", message);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{allocate, AllocationRequest};
    use crate::index::{index_entry_path, publish};
    use crate::layout::OpenMode;
    use crate::links::is_link;
    use crate::mark::{publish_automatic, publish_manual};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn delete_unindexes_and_with_all_removes_everything() {
        let root = std::env::temp_dir().join(format!(
            "exdir_delete_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = DirectoryLayout::open(&root, OpenMode::Create).expect("layout");
        let run = allocate(&layout, &AllocationRequest::default(), 6).expect("run");
        fs::write(run.record_path(), "id: 1\n").expect("record");
        publish(&layout, &run).expect("index");
        let params = BTreeMap::from([("k".to_string(), json!("a"))]);
        let auto = publish_automatic(&layout, &["k".to_string()], &run, &params).expect("auto");
        let manual = publish_manual(&layout, "keep", &[1]).expect("manual");

        let report = delete(&layout, &[1, 2], false).expect("delete");
        assert_eq!(report.missing, BTreeSet::from([2]));
        assert_eq!(report.unindexed.len(), 1);
        assert!(!is_link(&index_entry_path(&layout, &run.name)));
        assert!(run.path.is_dir());

        let report = delete(&layout, &[1, 2], true).expect("delete all");
        assert_eq!(report.missing_message().as_deref(), Some("runs {2} were not found"));
        assert!(!run.path.exists());
        assert!(!is_link(&auto));
        assert!(!is_link(&manual.created[0]));
        assert_eq!(report.unmarked.len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn delete_all_clears_marks_under_a_root_spelled_with_dot_segments() {
        let base = std::env::temp_dir().join(format!(
            "exdir_delete_dotted_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(base.join("sub")).expect("sub");
        let dotted = base.join("sub").join("..").join("root");
        let layout = DirectoryLayout::open(&dotted, OpenMode::Create).expect("layout");
        let run = allocate(&layout, &AllocationRequest::default(), 6).expect("run");
        fs::write(run.record_path(), "id: 1\n").expect("record");
        let manual = publish_manual(&layout, "best", &[1]).expect("manual");

        let report = delete(&layout, &[1], true).expect("delete all");
        assert!(!is_link(&manual.created[0]));
        assert_eq!(report.unmarked.len(), 1);
        assert!(!run.path.exists());
        let _ = fs::remove_dir_all(base);
    }
}
