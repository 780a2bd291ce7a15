//! Capability boundary around one worker OS process.
//!
//! The supervisor never touches `tokio::process` directly: it asks a
//! [`WorkerLauncher`] for a [`SpawnedWorker`], writes through the
//! [`ProcessHandle`] and observes the process through the ordered
//! [`ProcessEvent`] stream.

mod command;
mod death;
#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::Path;

use tokio::sync::mpsc;

use crate::error::ProcessError;

pub use command::CommandLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

/// Everything a worker process reports, in the order it happened. Output
/// from both streams is always delivered before `Exited`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ExitInfo),
}

pub trait ProcessHandle: Send + fmt::Debug {
    fn id(&self) -> Option<u32>;

    /// Queues `bytes` for the process's stdin. Each call is written in one
    /// piece, so frames from separate calls never interleave.
    fn write(&self, bytes: Vec<u8>) -> Result<(), ProcessError>;

    /// Asks the process to exit (SIGTERM where supported).
    fn terminate(&self) -> Result<(), ProcessError>;

    /// Kills the process outright.
    fn kill(&self) -> Result<(), ProcessError>;
}

#[derive(Debug)]
pub struct SpawnedWorker {
    pub handle: Box<dyn ProcessHandle>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Spawns one worker for the already-resolved dataset path.
    fn launch(&self, dataset: &Path) -> Result<SpawnedWorker, ProcessError>;
}
