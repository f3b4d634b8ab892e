//! Error types for aios-fswatch
//!
//! Every variant here is fatal to the observer. Interrupted waits and
//! "no data yet" reads are handled where they happen and never become errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::decoder::WatchId;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Error, Debug)]
pub enum WatchError {
    /// The notification session could not be created
    #[error("failed to open inotify session")]
    Session(#[source] io::Error),

    /// The subsystem rejected a root (missing path, permissions, watch limit)
    #[error("cannot watch '{}'", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The readiness wait failed for a reason other than interruption
    #[error("readiness wait failed")]
    ReadinessWait(#[source] io::Error),

    /// A read failed for a reason other than "no data yet"
    #[error("read from inotify descriptor failed")]
    Read(#[source] io::Error),

    /// A record would extend past the valid part of the batch
    #[error("corrupt event batch at offset {offset}: record needs {needed} bytes, {available} available")]
    Decode {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A decoded event carries a watch id nobody registered
    #[error("event for unknown watch id {0}")]
    UnknownWatch(WatchId),

    /// Every registered root has been dropped by the kernel
    #[error("all watches were removed by the kernel; nothing left to observe")]
    AllWatchesRemoved,
}
