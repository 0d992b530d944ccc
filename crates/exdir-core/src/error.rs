use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid root {}: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("invalid mark request: {0}")]
    MarkInput(String),

    #[error("parameter '{0}' is reserved and cannot be set")]
    ReservedParam(String),

    #[error("parameter validation failed: {0}")]
    Validation(String),

    #[error("bad record {}: {reason}", path.display())]
    Record { path: PathBuf, reason: String },

    #[error("bad config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_root(path: &Path, reason: impl Into<String>) -> Self {
        Error::InvalidRoot {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn record(path: &Path, reason: impl std::fmt::Display) -> Self {
        Error::Record {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Attaches the failing path to an `io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Marker error for a workload that was stopped by the operator rather than
/// crashing. Return it (or wrap it in `anyhow`) from a guarded body to have the
/// failure treated as non-critical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("run interrupted by operator")]
pub struct Interrupted;
