//! Bounded poll-and-sleep waiting.
//!
//! The capture image and the config file are produced by a companion
//! process that may still be writing when this one starts. Rather than
//! failing on the first missing file, callers poll with a fixed interval
//! and a fixed attempt budget.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_WAIT_ATTEMPTS: u32 = 120;
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("condition not met after {attempts} attempts")]
pub struct WaitTimeout {
    pub attempts: u32,
}

#[derive(Debug, Error)]
#[error("file does not exist: {}", path.display())]
pub struct FileMissing {
    pub path: PathBuf,
}

/// Poll `predicate` up to `max_attempts` times, sleeping `interval`
/// between attempts. Succeeds as soon as the predicate holds.
pub fn await_condition<F>(
    mut predicate: F,
    interval: Duration,
    max_attempts: u32,
) -> Result<(), WaitTimeout>
where
    F: FnMut() -> bool,
{
    for attempt in 1..=max_attempts {
        if predicate() {
            return Ok(());
        }
        if attempt < max_attempts {
            thread::sleep(interval);
        }
    }
    Err(WaitTimeout {
        attempts: max_attempts,
    })
}

/// Wait for a file another process is expected to produce.
pub fn await_file(path: &Path, interval: Duration, max_attempts: u32) -> Result<(), FileMissing> {
    await_condition(|| path.exists(), interval, max_attempts).map_err(|_| FileMissing {
        path: path.to_path_buf(),
    })
}
