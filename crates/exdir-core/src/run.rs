use crate::layout::{DirectoryLayout, Location};
use chrono::NaiveDateTime;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Timestamp format embedded in run directory names.
pub const DIR_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Fixed name of the record file inside every run directory.
pub const RECORD_FILE: &str = "params.yaml";
pub const RECORD_EXT: &str = "yaml";

pub const DEFAULT_ZFILL: usize = 6;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)-(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})(?:-(.+))?$")
            .expect("run name pattern is a valid regex")
    })
}

/// `<zero-padded id>-<timestamp>[-<tag>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunName {
    pub id: u64,
    pub timestamp: NaiveDateTime,
    pub tag: Option<String>,
    formatted: String,
}

impl RunName {
    pub fn new(id: u64, timestamp: NaiveDateTime, tag: Option<&str>, zfill: usize) -> Self {
        let tag = tag
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.replace(std::path::MAIN_SEPARATOR, "_").replace('/', "_"));
        let mut formatted = format!(
            "{:0width$}-{}",
            id,
            timestamp.format(DIR_TIME_FORMAT),
            width = zfill
        );
        if let Some(tag) = &tag {
            formatted.push('-');
            formatted.push_str(tag);
        }
        Self {
            id,
            timestamp,
            tag,
            formatted,
        }
    }

    /// Returns `None` for anything that is not a run directory name, so stray
    /// files in the layout are skipped instead of failing a scan.
    pub fn parse(name: &str) -> Option<Self> {
        let caps = name_pattern().captures(name)?;
        let id = caps.get(1)?.as_str().parse::<u64>().ok()?;
        let timestamp =
            NaiveDateTime::parse_from_str(caps.get(2)?.as_str(), DIR_TIME_FORMAT).ok()?;
        Some(Self {
            id,
            timestamp,
            tag: caps.get(3).map(|m| m.as_str().to_string()),
            formatted: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.formatted
    }

    /// Name of this run's entry in `index/` and in manual marks.
    pub fn record_link_name(&self) -> String {
        format!("{}.{}", self.formatted, RECORD_EXT)
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    pub name: RunName,
    pub location: Location,
    pub path: PathBuf,
}

impl RunDirectory {
    pub fn new(layout: &DirectoryLayout, name: RunName, location: Location) -> Self {
        let path = layout.location_dir(location).join(name.as_str());
        Self {
            name,
            location,
            path,
        }
    }

    pub fn id(&self) -> u64 {
        self.name.id
    }

    pub fn record_path(&self) -> PathBuf {
        self.path.join(RECORD_FILE)
    }

    /// `runs/<name>` style path, relative to the experiment root.
    pub fn root_relative(&self) -> PathBuf {
        Path::new(self.location.dir_name()).join(self.name.as_str())
    }

    pub fn is_tmp(&self) -> bool {
        self.location == Location::Tmp
    }
}
