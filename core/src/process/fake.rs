//! In-memory launcher for supervisor tests. Each launch hands a
//! [`FakeWorker`] controller to the test, which scripts the worker's output
//! and inspects what the supervisor wrote to it.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::sync::mpsc;

use super::ExitInfo;
use super::ProcessEvent;
use super::ProcessHandle;
use super::SpawnedWorker;
use super::WorkerLauncher;
use crate::error::ProcessError;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

#[derive(Debug)]
pub(crate) struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
    fail_next_spawn: AtomicBool,
}

impl FakeLauncher {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            workers,
            fail_next_spawn: AtomicBool::new(false),
        });
        (launcher, rx)
    }

    pub(crate) fn fail_next_spawn(&self) {
        self.fail_next_spawn.store(true, Ordering::SeqCst);
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, dataset: &Path) -> Result<SpawnedWorker, ProcessError> {
        if self.fail_next_spawn.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::spawn(
                "fake-worker",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            ));
        }
        let (events, rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            events,
            written: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            stdin_closed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        let worker = FakeWorker {
            dataset: dataset.to_path_buf(),
            shared: Arc::clone(&shared),
        };
        let _ = self.workers.send(worker);
        Ok(SpawnedWorker {
            handle: Box::new(FakeHandle { shared }),
            events: rx,
        })
    }
}

#[derive(Debug)]
struct Shared {
    events: mpsc::Sender<ProcessEvent>,
    written: Mutex<Vec<Vec<u8>>>,
    terminated: AtomicBool,
    killed: AtomicBool,
    stdin_closed: AtomicBool,
    exited: AtomicBool,
}

impl Shared {
    fn exit(&self, exit: ExitInfo) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events.try_send(ProcessEvent::Exited(exit));
        }
    }
}

#[derive(Debug)]
struct FakeHandle {
    shared: Arc<Shared>,
}

impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn write(&self, bytes: Vec<u8>) -> Result<(), ProcessError> {
        if self.shared.exited.load(Ordering::SeqCst)
            || self.shared.stdin_closed.load(Ordering::SeqCst)
        {
            return Err(ProcessError::StdinClosed);
        }
        self.shared
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes);
        Ok(())
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.exit(ExitInfo {
            code: None,
            signal: Some(SIGTERM),
        });
        Ok(())
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.shared.killed.store(true, Ordering::SeqCst);
        self.shared.exit(ExitInfo {
            code: None,
            signal: Some(SIGKILL),
        });
        Ok(())
    }
}

/// Test-side controller for one launched worker.
#[derive(Debug, Clone)]
pub(crate) struct FakeWorker {
    pub(crate) dataset: PathBuf,
    shared: Arc<Shared>,
}

impl FakeWorker {
    pub(crate) async fn stdout(&self, bytes: &str) {
        let _ = self
            .shared
            .events
            .send(ProcessEvent::Stdout(bytes.as_bytes().to_vec()))
            .await;
    }

    pub(crate) async fn stderr(&self, bytes: &str) {
        let _ = self
            .shared
            .events
            .send(ProcessEvent::Stderr(bytes.as_bytes().to_vec()))
            .await;
    }

    pub(crate) async fn frame(&self, frame: Value) {
        self.stdout(&format!("{frame}\n")).await;
    }

    pub(crate) async fn ready(&self) {
        self.frame(serde_json::json!({"type": "status", "status": "ready"}))
            .await;
    }

    /// Later writes fail while the worker itself stays alive.
    pub(crate) fn close_stdin(&self) {
        self.shared.stdin_closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn exit(&self, code: i32) {
        self.shared.exit(ExitInfo {
            code: Some(code),
            signal: None,
        });
    }

    /// Every frame the supervisor wrote, decoded.
    pub(crate) fn written(&self) -> Vec<Value> {
        let written = self
            .shared
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        written
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect()
    }

    pub(crate) fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }
}
