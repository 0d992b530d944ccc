use crate::error::{IoContext, Result};
use crate::layout::DirectoryLayout;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Exclusive advisory lock on `<root>/.exdir.lock`.
///
/// Guards only the "scan ids, create directory" window. The lock is released
/// when the guard is dropped, and by the OS if the holder dies.
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Blocks until the lock is held.
    pub fn acquire(layout: &DirectoryLayout) -> Result<Self> {
        let path = layout.lock_path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .at(&path)?;
        file.lock_exclusive().at(&path)?;
        // Diagnostic only; nothing reads the holder pid back.
        if let Err(e) = file.set_len(0).and_then(|()| writeln!(file, "{}", std::process::id())) {
            tracing::debug!(lock = %path.display(), "cannot record lock holder pid: {e}");
        }
        tracing::trace!(lock = %path.display(), "root lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), "failed to release root lock: {e}");
        }
    }
}
