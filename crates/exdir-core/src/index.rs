use crate::error::Result;
use crate::layout::DirectoryLayout;
use crate::links::{link_relative, remove_link};
use crate::run::{RunDirectory, RunName};
use std::path::PathBuf;

/// `index/<run-name>.yaml`
pub fn index_entry_path(layout: &DirectoryLayout, name: &RunName) -> PathBuf {
    layout.index().join(name.record_link_name())
}

/// Links the run's record into the flat index. Publishing twice is harmless.
pub fn publish(layout: &DirectoryLayout, run: &RunDirectory) -> Result<PathBuf> {
    let link = index_entry_path(layout, &run.name);
    link_relative(&run.record_path(), &link)?;
    tracing::debug!(run = %run.name, link = %link.display(), "published index entry");
    Ok(link)
}

/// Removes the index entry if present; absence is not an error.
pub fn unpublish(layout: &DirectoryLayout, name: &RunName) -> Result<bool> {
    let removed = remove_link(&index_entry_path(layout, name))?;
    if removed {
        tracing::debug!(run = %name, "removed index entry");
    }
    Ok(removed)
}
