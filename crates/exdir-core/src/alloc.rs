use crate::error::{IoContext, Result};
use crate::ids::next_id;
use crate::layout::{DirectoryLayout, Location};
use crate::lock::RootLock;
use crate::run::{RunDirectory, RunName};
use chrono::{Local, NaiveDateTime};
use std::fs;
use std::io::ErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub tmp: bool,
    pub tag: Option<String>,
}

/// Creates a brand new run directory and returns it. The caller owns it
/// exclusively and is expected to write the record into it.
///
/// `create_dir` acts as the compare-and-swap: if the name is already taken
/// the whole step (rescan, new timestamp) is repeated, without limit.
pub fn allocate(
    layout: &DirectoryLayout,
    request: &AllocationRequest,
    zfill: usize,
) -> Result<RunDirectory> {
    allocate_with_clock(layout, request, zfill, || Local::now().naive_local())
}

pub(crate) fn allocate_with_clock(
    layout: &DirectoryLayout,
    request: &AllocationRequest,
    zfill: usize,
    mut now: impl FnMut() -> NaiveDateTime,
) -> Result<RunDirectory> {
    let location = if request.tmp {
        Location::Tmp
    } else {
        Location::Runs
    };
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let lock = RootLock::acquire(layout)?;
        let id = next_id(layout, &lock)?;
        let name = RunName::new(id, now(), request.tag.as_deref(), zfill);
        let run = RunDirectory::new(layout, name, location);
        match fs::create_dir(&run.path) {
            Ok(()) => {
                drop(lock);
                tracing::debug!(
                    run = %run.name,
                    location = location.dir_name(),
                    attempt,
                    "allocated run directory"
                );
                return Ok(run);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                drop(lock);
                tracing::debug!(run = %run.name, attempt, "run directory already exists, retrying");
                // Let the clock move on before trying the next name.
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e).at(&run.path),
        }
    }
}
