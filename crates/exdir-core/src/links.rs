//! Relative symlink helpers shared by the index and the marks tree.

use crate::error::{Error, IoContext, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Path to use as the symlink target so that `link` resolves to `target`
/// even after the whole root is moved.
pub fn relative_target(target: &Path, link: &Path) -> Result<PathBuf> {
    let link_dir = link
        .parent()
        .ok_or_else(|| Error::invalid_root(link, "symlink has no parent directory"))?;
    pathdiff::diff_paths(target, link_dir)
        .ok_or_else(|| Error::invalid_root(target, "cannot express target relative to link"))
}

/// Creates `link -> target` (relative). Re-linking the same pair is a no-op;
/// a stale link with another target is replaced.
pub fn link_relative(target: &Path, link: &Path) -> Result<PathBuf> {
    let relative = relative_target(target, link)?;
    loop {
        match make_symlink(&relative, target, link) {
            Ok(()) => return Ok(link.to_path_buf()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if fs::read_link(link).ok().as_deref() == Some(relative.as_path()) {
                    return Ok(link.to_path_buf());
                }
                tracing::debug!(link = %link.display(), "replacing stale link");
                remove_link(link)?;
            }
            Err(e) => return Err(e).at(link),
        }
    }
}

/// Removes a symlink. Returns `false` when there was nothing to remove.
pub fn remove_link(link: &Path) -> Result<bool> {
    match fs::remove_file(link) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).at(link),
    }
}

/// Removes every symlink under `dir` that resolves to one of `targets` or to
/// a file inside them. Both sides are compared after lexical normalization.
pub fn remove_links_into(dir: &Path, targets: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if targets.is_empty() || !dir.is_dir() {
        return Ok(removed);
    }
    let targets: Vec<PathBuf> = targets.iter().map(|t| normalize(t)).collect();
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("skipping unreadable link entry: {e}");
                continue;
            }
        };
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(link_target) = fs::read_link(entry.path()) else {
            continue;
        };
        let resolved = match entry.path().parent() {
            Some(parent) => normalize(&parent.join(link_target)),
            None => continue,
        };
        if targets.iter().any(|t| resolved.starts_with(t)) && remove_link(entry.path())? {
            removed.push(entry.path().to_path_buf());
        }
    }
    Ok(removed)
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` is a symlink, whether or not its target exists.
pub fn is_link(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

#[cfg(unix)]
fn make_symlink(relative: &Path, _target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(relative, link)
}

#[cfg(windows)]
fn make_symlink(relative: &Path, target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(relative, link)
    } else {
        std::os::windows::fs::symlink_file(relative, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "exdir_links_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch");
        dir
    }

    #[test]
    fn links_are_relative_and_idempotent() {
        let dir = scratch("relative");
        let target = dir.join("runs").join("r1").join("params.yaml");
        fs::create_dir_all(target.parent().expect("parent")).expect("run dir");
        fs::write(&target, "id: 1\n").expect("target");
        fs::create_dir_all(dir.join("index")).expect("index");
        let link = dir.join("index").join("r1.yaml");

        link_relative(&target, &link).expect("first link");
        link_relative(&target, &link).expect("second link");
        assert_eq!(
            fs::read_link(&link).expect("read link"),
            PathBuf::from("../runs/r1/params.yaml")
        );
        assert_eq!(fs::read_to_string(&link).expect("follow"), "id: 1\n");

        assert!(remove_link(&link).expect("remove"));
        assert!(!remove_link(&link).expect("remove again"));
        assert!(!is_link(&link));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stale_link_is_replaced() {
        let dir = scratch("stale");
        fs::write(dir.join("a"), "a").expect("a");
        fs::write(dir.join("b"), "b").expect("b");
        let link = dir.join("current");
        link_relative(&dir.join("a"), &link).expect("link a");
        link_relative(&dir.join("b"), &link).expect("link b");
        assert_eq!(fs::read_to_string(&link).expect("follow"), "b");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn normalize_folds_dot_segments() {
        assert_eq!(
            normalize(Path::new("/base/sub/../root/./marked/../runs")),
            PathBuf::from("/base/root/runs")
        );
    }

    #[test]
    fn remove_links_into_matches_targets_spelled_with_dot_segments() {
        let dir = scratch("sweep");
        let run = dir.join("runs").join("r1");
        fs::create_dir_all(&run).expect("run dir");
        fs::write(run.join("params.yaml"), "id: 1\n").expect("record");
        let other = dir.join("runs").join("r2");
        fs::create_dir_all(&other).expect("other dir");
        let marks = dir.join("marked").join("best");
        fs::create_dir_all(&marks).expect("marks");
        let into_run =
            link_relative(&run.join("params.yaml"), &marks.join("r1.yaml")).expect("r1");
        let into_other = link_relative(&other, &marks.join("r2")).expect("r2");

        let spelled = dir.join("runs").join("..").join("runs").join("r1");
        let removed = remove_links_into(&dir.join("marked"), &[spelled]).expect("sweep");
        assert_eq!(removed, vec![into_run.clone()]);
        assert!(!is_link(&into_run));
        assert!(is_link(&into_other));
        let _ = fs::remove_dir_all(dir);
    }
}
