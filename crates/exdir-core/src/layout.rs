//! Fixed on-disk layout of an experiment root.
//!
//! ```text
//! root +- runs   +- 000001-2018-06-27-14-36-21/params.yaml
//!      |         |- 000002-2018-06-27-14-36-23/params.yaml
//!      |- tmp    +- runs created with `tmp`, never indexed
//!      |- fails  +- quarantined runs, each with traceback.txt
//!      |- index  +- 000001-2018-06-27-14-36-21.yaml -> ../runs/.../params.yaml
//!      |- marked +- <tag>/.../<run-name>[.yaml] -> run or record
//! ```

use crate::error::{Error, IoContext, Result};
use crate::links::normalize;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUNS_DIR: &str = "runs";
pub const TMP_DIR: &str = "tmp";
pub const FAILS_DIR: &str = "fails";
pub const INDEX_DIR: &str = "index";
pub const MARKED_DIR: &str = "marked";

/// Directories that must exist for a root to be valid.
pub const REQUIRED_DIRS: [&str; 4] = [RUNS_DIR, TMP_DIR, FAILS_DIR, INDEX_DIR];

/// Every name the layout owns at the top of a root. Mark tags may not use these.
pub const RESERVED_DIRS: [&str; 5] = [RUNS_DIR, TMP_DIR, FAILS_DIR, INDEX_DIR, MARKED_DIR];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_DIRS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the root and any missing reserved directories.
    Create,
    /// Require everything to exist already; never touch the filesystem.
    Validate,
}

/// Where a run directory currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Runs,
    Tmp,
    Fails,
}

impl Location {
    pub const ALL: [Location; 3] = [Location::Runs, Location::Tmp, Location::Fails];

    pub fn dir_name(self) -> &'static str {
        match self {
            Location::Runs => RUNS_DIR,
            Location::Tmp => TMP_DIR,
            Location::Fails => FAILS_DIR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryLayout {
    root: PathBuf,
}

impl DirectoryLayout {
    /// `root` is stored with `.` and `..` folded away, so every path handed
    /// out by the layout compares equal to what a symlink resolves to.
    pub fn open(root: &Path, mode: OpenMode) -> Result<Self> {
        if !root.is_absolute() {
            return Err(Error::invalid_root(root, "root directory is not an absolute path"));
        }
        let normalized = normalize(root);
        let root = normalized.as_path();
        match mode {
            OpenMode::Create => {
                fs::create_dir_all(root).at(root)?;
                for name in RESERVED_DIRS {
                    let dir = root.join(name);
                    fs::create_dir_all(&dir).at(&dir)?;
                }
            }
            OpenMode::Validate => {
                if !root.is_dir() {
                    return Err(Error::invalid_root(root, "root directory does not exist"));
                }
                let missing: Vec<&str> = REQUIRED_DIRS
                    .iter()
                    .copied()
                    .filter(|name| !root.join(name).is_dir())
                    .collect();
                if !missing.is_empty() {
                    return Err(Error::invalid_root(
                        root,
                        format!("missing reserved directories: {}", missing.join(", ")),
                    ));
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn fails(&self) -> PathBuf {
        self.root.join(FAILS_DIR)
    }

    pub fn index(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    /// `marked/` is optional in validate mode; callers that write into it
    /// create it on demand.
    pub fn marked(&self) -> PathBuf {
        self.root.join(MARKED_DIR)
    }

    pub fn location_dir(&self, location: Location) -> PathBuf {
        self.root.join(location.dir_name())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".exdir.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("exdir.yaml")
    }
}
