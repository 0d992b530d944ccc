use crate::error::{Error, IoContext, Result};
use crate::run::RunDirectory;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Timestamp format stored under the `time` key.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub const KEY_ID: &str = "id";
pub const KEY_TIME: &str = "time";
pub const KEY_ROOT: &str = "root";

/// Keys owned by the run bookkeeping; user parameters may never use them.
pub const RESERVED_KEYS: [&str; 3] = [KEY_ID, KEY_TIME, KEY_ROOT];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Flat key/value document stored as `params.yaml` in a run directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn for_run(run: &RunDirectory, params: BTreeMap<String, Value>) -> Self {
        let mut values = params;
        values.insert(KEY_ID.to_string(), Value::from(run.id()));
        values.insert(
            KEY_TIME.to_string(),
            Value::String(run.name.timestamp.format(TIME_FORMAT).to_string()),
        );
        values.insert(KEY_ROOT.to_string(), Value::String(root_string(&run.root_relative())));
        Self { values }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at(path)?;
        let values: BTreeMap<String, Value> =
            serde_yaml::from_str(&raw).map_err(|e| Error::record(path, e))?;
        let record = Self { values };
        record.check_reserved(path)?;
        Ok(record)
    }

    /// Writes via a temp file and rename so readers never see a half record.
    pub fn write(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.values).map_err(|e| Error::record(path, e))?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("record");
        let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
        let mut file = fs::File::create(&tmp).at(&tmp)?;
        file.write_all(yaml.as_bytes()).at(&tmp)?;
        file.sync_all().at(&tmp)?;
        fs::rename(&tmp, path).at(path)?;
        Ok(())
    }

    fn check_reserved(&self, path: &Path) -> Result<()> {
        let missing: Vec<&str> = RESERVED_KEYS
            .iter()
            .copied()
            .filter(|k| !self.values.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(Error::record(
                path,
                format!("missing reserved keys: {}", missing.join(", ")),
            ));
        }
        if self.id().is_none() {
            return Err(Error::record(path, "'id' is not a positive integer"));
        }
        Ok(())
    }

    pub fn id(&self) -> Option<u64> {
        self.values.get(KEY_ID).and_then(Value::as_u64)
    }

    pub fn time(&self) -> Option<NaiveDateTime> {
        self.values
            .get(KEY_TIME)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIME_FORMAT).ok())
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.values.get(KEY_ROOT).and_then(Value::as_str).map(PathBuf::from)
    }

    pub fn set_root(&mut self, relative: &Path) {
        self.values
            .insert(KEY_ROOT.to_string(), Value::String(root_string(relative)));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Every non-reserved entry.
    pub fn params(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(k, _)| !is_reserved_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }
}

fn root_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
