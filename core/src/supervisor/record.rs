use std::path::PathBuf;
use std::time::Duration;

use kernelhub_protocol::SessionId;
use kernelhub_protocol::SessionStatus;
use kernelhub_protocol::StopReason;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::timers::SessionTimers;
use crate::codec::FrameDecoder;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::process::ProcessHandle;

pub(super) type ReadySender = oneshot::Sender<Result<()>>;

/// Everything the registry knows about one live session. All status changes
/// go through the methods below.
#[derive(Debug)]
pub(super) struct SessionRecord {
    pub(super) session_id: SessionId,
    /// Distinguishes this record from later ones reusing the same id.
    pub(super) instance: u64,
    pub(super) dataset: PathBuf,
    pub(super) process: Box<dyn ProcessHandle>,
    pub(super) decoder: FrameDecoder,
    pub(super) timers: SessionTimers,
    pub(super) started_at: Instant,
    status: SessionStatus,
    pending_code: Option<String>,
    in_flight: bool,
    last_activity: Instant,
    stop_reason: Option<StopReason>,
    ready_tx: Option<ReadySender>,
}

impl SessionRecord {
    pub(super) fn new(
        session_id: SessionId,
        instance: u64,
        dataset: PathBuf,
        process: Box<dyn ProcessHandle>,
        max_frame_bytes: usize,
        ready_tx: ReadySender,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            instance,
            dataset,
            process,
            decoder: FrameDecoder::new(max_frame_bytes),
            timers: SessionTimers::default(),
            started_at: now,
            status: SessionStatus::Starting,
            pending_code: None,
            in_flight: false,
            last_activity: now,
            stop_reason: None,
            ready_tx: Some(ready_tx),
        }
    }

    pub(super) fn status(&self) -> SessionStatus {
        self.status
    }

    pub(super) fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub(super) fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub(super) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(super) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub(super) fn has_pending_code(&self) -> bool {
        self.pending_code.is_some()
    }

    /// Starting -> Ready. Returns the sender that resolves `start()`.
    pub(super) fn mark_ready(&mut self) -> Option<ReadySender> {
        if self.status != SessionStatus::Starting {
            return None;
        }
        self.status = SessionStatus::Ready;
        self.ready_tx.take()
    }

    /// Stores code for the next run; last write wins.
    pub(super) fn prepare(&mut self, code: String) -> Result<()> {
        if self.status != SessionStatus::Ready {
            return Err(SupervisorError::not_ready(&self.session_id, self.status));
        }
        self.pending_code = Some(code);
        Ok(())
    }

    /// Ready -> Busy, handing back the prepared code.
    pub(super) fn begin_run(&mut self, now: Instant) -> Result<String> {
        if self.status != SessionStatus::Ready {
            return Err(SupervisorError::not_ready(&self.session_id, self.status));
        }
        let code = self
            .pending_code
            .take()
            .ok_or_else(|| SupervisorError::nothing_prepared(&self.session_id))?;
        self.status = SessionStatus::Busy;
        self.in_flight = true;
        self.last_activity = now;
        Ok(code)
    }

    /// Ends the in-flight execution. Busy returns to Ready; Stopping stays.
    /// Returns false when nothing was in flight.
    pub(super) fn finish_execution(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        self.in_flight = false;
        if self.status == SessionStatus::Busy {
            self.status = SessionStatus::Ready;
        }
        true
    }

    /// Any -> Stopping. The first reason recorded is the one reported.
    pub(super) fn begin_stop(&mut self, reason: StopReason) {
        self.status = SessionStatus::Stopping;
        self.pending_code = None;
        self.stop_reason.get_or_insert(reason);
    }

    pub(super) fn take_ready_tx(&mut self) -> Option<ReadySender> {
        self.ready_tx.take()
    }
}
