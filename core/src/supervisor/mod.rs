//! Session lifecycle: one worker process per session, driven through the
//! Starting -> Ready -> Busy -> Ready -> ... -> Stopping -> Stopped cycle.

mod reaper;
mod record;
mod registry;
mod timers;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kernelhub_protocol::SessionId;
use kernelhub_protocol::SessionStatus;
use kernelhub_protocol::StopReason;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::event_bus::EventSubscription;
use crate::process::CommandLauncher;
use crate::process::WorkerLauncher;

use self::registry::Registry;

/// Snapshot of one live session, as returned by [`Supervisor::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub dataset: PathBuf,
    pub pid: Option<u32>,
    pub has_pending_code: bool,
    pub uptime: Duration,
    pub idle_for: Duration,
}

/// Handle to the session registry. Cheap to clone; every clone drives the
/// same set of sessions. Dropping the last clone stops the idle reaper and
/// kills any workers still running.
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<Registry>,
}

impl Supervisor {
    /// Spawns real worker processes as configured. Must be called within a
    /// tokio runtime.
    pub fn new(config: SupervisorConfig) -> Self {
        let launcher = Arc::new(CommandLauncher::new(&config.worker));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let interval = config.reaper_interval();
        let registry = Arc::new(Registry::new(config, launcher));
        reaper::spawn(&registry, interval);
        Self { registry }
    }

    pub fn config(&self) -> &SupervisorConfig {
        self.registry.config()
    }

    /// Spawns a worker for `dataset_ref` and waits until it reports ready.
    /// A fresh id is generated when `session_id` is `None`.
    pub async fn start(&self, session_id: Option<SessionId>, dataset_ref: &str) -> Result<SessionId> {
        let session_id = session_id.unwrap_or_else(SessionId::generate);
        self.registry.start(session_id, dataset_ref).await
    }

    /// Stores `code` for the next [`run`](Self::run). Only valid while Ready.
    pub fn prepare(&self, session_id: &SessionId, code: impl Into<String>) -> Result<()> {
        self.registry.prepare(session_id, code.into())
    }

    /// Sends the prepared code to the worker. Progress and completion are
    /// reported only through events.
    pub fn run(&self, session_id: &SessionId) -> Result<()> {
        self.registry.run(session_id)
    }

    /// Stops a session. Graceful unless `force`; calling it again is a no-op
    /// except that `force` escalates a graceful stop already underway.
    pub fn stop(&self, session_id: &SessionId, force: bool) {
        self.registry.stop(session_id, force, StopReason::Requested);
    }

    /// [`SessionStatus::Stopped`] when no such session exists.
    pub fn status(&self, session_id: &SessionId) -> SessionStatus {
        self.registry.status(session_id)
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.registry.bus().subscribe()
    }

    pub fn subscribe_session(&self, session_id: &SessionId) -> EventSubscription {
        self.registry.bus().subscribe().for_session(session_id.clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionDescriptor> {
        self.registry.list_sessions()
    }

    /// Force-stops every session and stops the idle reaper.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
