use crate::error::{Error, Result};
use crate::mark::validate_segment;
use crate::params::parse_bool;
use crate::quarantine::QuarantinePolicy;
use crate::run::DEFAULT_ZFILL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const ENV_ZFILL: &str = "EXDIR_ZFILL";
pub const ENV_AUTOMARK: &str = "EXDIR_AUTOMARK";
pub const ENV_INTERACTIVE: &str = "EXDIR_INTERACTIVE";

/// Per-root settings, read from `<root>/exdir.yaml` when present.
///
/// ```yaml
/// zfill: 6
/// automark: [model, lr]
/// quarantine:
///   interactive: false
///   prompt_timeout_secs: 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentOptions {
    pub zfill: usize,
    pub automark: Vec<String>,
    pub quarantine: QuarantinePolicy,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            zfill: DEFAULT_ZFILL,
            automark: Vec::new(),
            quarantine: QuarantinePolicy::default(),
        }
    }
}

impl ExperimentOptions {
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
        let options: Self = serde_yaml::from_str(&contents).map_err(|e| config_error(path, e))?;
        options.validate().map_err(|e| config_error(path, e))?;
        Ok(Some(options))
    }

    /// File settings (if any) with environment overrides applied.
    pub fn load(path: &Path) -> Result<Self> {
        let mut options = Self::load_file(path)?.unwrap_or_default();
        options.apply_env_overrides();
        options.validate()?;
        Ok(options)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_ZFILL) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                match trimmed.parse::<usize>() {
                    Ok(value) => self.zfill = value,
                    Err(err) => tracing::warn!("invalid {ENV_ZFILL}, ignoring: {err}"),
                }
            }
        }

        if let Ok(raw) = std::env::var(ENV_AUTOMARK) {
            let keys: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !keys.is_empty() {
                self.automark = keys;
            }
        }

        if let Ok(raw) = std::env::var(ENV_INTERACTIVE) {
            match parse_bool(&raw) {
                Some(value) => self.quarantine.interactive = value,
                None => tracing::warn!("invalid {ENV_INTERACTIVE}, ignoring: {raw}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.zfill == 0 {
            return Err(Error::Validation("zfill must be at least 1".to_string()));
        }
        for key in &self.automark {
            validate_segment(key)?;
        }
        Ok(())
    }
}

fn config_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::Config {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "exdir_config_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        dir
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = scratch();
        assert!(ExperimentOptions::load_file(&dir.join("exdir.yaml"))
            .expect("load")
            .is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = scratch();
        let path = dir.join("exdir.yaml");
        fs::write(&path, "zfill: 4\nautomark: [model]\nquarantine:\n  interactive: true\n")
            .expect("write");
        let options = ExperimentOptions::load_file(&path).expect("load").expect("some");
        assert_eq!(options.zfill, 4);
        assert_eq!(options.automark, vec!["model".to_string()]);
        assert!(options.quarantine.interactive);
        assert_eq!(options.quarantine.prompt_timeout_secs, 10);
        assert!(options.quarantine.default_quarantine);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reserved_automark_key_is_a_config_error() {
        let dir = scratch();
        let path = dir.join("exdir.yaml");
        fs::write(&path, "automark: [runs]\n").expect("write");
        let err = ExperimentOptions::load_file(&path).expect_err("reserved key");
        assert!(matches!(err, Error::Config { .. }), "unexpected: {}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_zfill_is_rejected() {
        let options = ExperimentOptions {
            zfill: 0,
            ..ExperimentOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
