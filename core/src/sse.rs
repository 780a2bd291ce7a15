//! Server-Sent-Events rendering of one execution.
//!
//! An [`ExecutionStream`] subscribes to a session before triggering its
//! prepared code and ends after the `done` frame. A subscriber that falls
//! behind the bus rechecks the session status instead of waiting for a
//! completion that may already have been dropped.

use std::collections::VecDeque;
use std::fmt;

use kernelhub_protocol::ErrorDetail;
use kernelhub_protocol::ExecutionOutcome;
use kernelhub_protocol::SessionEvent;
use kernelhub_protocol::SessionEventKind;
use kernelhub_protocol::SessionId;
use kernelhub_protocol::SessionStatus;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use crate::error::SubscriptionError;
use crate::event_bus::EventSubscription;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    /// Compact JSON; never contains a newline.
    pub data: String,
}

impl SseFrame {
    fn json<T: Serialize>(event: &'static str, payload: &T) -> Self {
        let data = serde_json::to_string(payload).unwrap_or_else(|err| {
            warn!(event, "failed to serialize stream payload: {err}");
            "null".to_string()
        });
        Self { event, data }
    }

    fn connected() -> Self {
        Self::json(
            "connected",
            &json!({"message": "Streaming connection established."}),
        )
    }

    fn error(message: impl Into<String>) -> Self {
        Self::json("error", &ErrorDetail::new(message))
    }

    fn done(outcome: &ExecutionOutcome) -> Self {
        Self::json("done", outcome)
    }

    pub fn is_done(&self) -> bool {
        self.event == "done"
    }
}

impl fmt::Display for SseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[derive(Debug)]
pub struct ExecutionStream {
    supervisor: Supervisor,
    session_id: SessionId,
    events: EventSubscription,
    queued: VecDeque<SseFrame>,
    /// Set after the subscription lagged and until the backlog is drained.
    lagged: bool,
    finished: bool,
    outcome: Option<ExecutionOutcome>,
}

impl ExecutionStream {
    /// Subscribes to `session_id`, then runs its prepared code. A failed run
    /// is reported in-stream rather than returned.
    pub fn open(supervisor: &Supervisor, session_id: &SessionId) -> Self {
        let events = supervisor.subscribe_session(session_id);
        let mut queued = VecDeque::from([SseFrame::connected()]);
        let mut outcome = None;
        if let Err(err) = supervisor.run(session_id) {
            warn!(session = %session_id, "failed to start execution: {err}");
            queued.push_back(SseFrame::error(format!("Failed to start execution: {err}")));
            let failed = ExecutionOutcome::failure(ErrorDetail::new("Failed to start execution"));
            queued.push_back(SseFrame::done(&failed));
            outcome = Some(failed);
        }
        Self {
            supervisor: supervisor.clone(),
            session_id: session_id.clone(),
            events,
            queued,
            lagged: false,
            finished: outcome.is_some(),
            outcome,
        }
    }

    /// The outcome carried by the `done` frame, once one has been produced.
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.outcome.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome
            .as_ref()
            .is_some_and(ExecutionOutcome::is_success)
    }

    /// The next frame, or `None` once `done` has been yielded.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if let Some(frame) = self.queued.pop_front() {
            return Some(frame);
        }
        if self.finished {
            return None;
        }
        loop {
            let Some(event) = self.next_event().await else {
                if self.finished {
                    return self.queued.pop_front();
                }
                continue;
            };
            match event.kind {
                SessionEventKind::Output(chunk) => return Some(SseFrame::json("output", &chunk)),
                SessionEventKind::Error(detail) => return Some(SseFrame::json("error", &detail)),
                SessionEventKind::ExecutionComplete(outcome) => {
                    self.finished = true;
                    let frame = SseFrame::done(&outcome);
                    self.outcome = Some(outcome);
                    return Some(frame);
                }
                SessionEventKind::Stopped(info) => {
                    self.finished = true;
                    let stopped =
                        ExecutionOutcome::failure(ErrorDetail::new("Kernel stopped unexpectedly"));
                    self.queued.push_back(SseFrame::done(&stopped));
                    self.outcome = Some(stopped);
                    return Some(SseFrame::error(format!(
                        "Kernel stopped unexpectedly (code: {:?}, signal: {:?})",
                        info.code, info.signal
                    )));
                }
                SessionEventKind::Ready => {}
            }
        }
    }

    /// The next event for this session. `None` either ends the stream or,
    /// after lag, asks the caller to look again.
    async fn next_event(&mut self) -> Option<SessionEvent> {
        if !self.lagged {
            return match self.events.recv().await {
                Ok(event) => Some(event),
                Err(SubscriptionError::Lagged { skipped }) => {
                    warn!(session = %self.session_id, skipped, "execution stream fell behind");
                    self.lagged = true;
                    None
                }
                Err(SubscriptionError::Empty | SubscriptionError::Closed) => {
                    debug!(session = %self.session_id, "event bus closed mid-stream");
                    self.finished = true;
                    None
                }
            };
        }

        // Completion is published under the same lock that leaves Busy, so a
        // settled status read before an empty backlog means it was dropped.
        let pending = matches!(
            self.supervisor.status(&self.session_id),
            SessionStatus::Busy | SessionStatus::Stopping
        );
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(SubscriptionError::Lagged { skipped }) => {
                warn!(session = %self.session_id, skipped, "execution stream fell behind");
                None
            }
            Err(SubscriptionError::Empty) if pending => {
                self.lagged = false;
                None
            }
            Err(SubscriptionError::Empty) => {
                warn!(session = %self.session_id, "execution result was dropped from the event bus");
                self.finish_lost();
                None
            }
            Err(SubscriptionError::Closed) => {
                self.finished = true;
                None
            }
        }
    }

    fn finish_lost(&mut self) {
        self.finished = true;
        let lost = ExecutionOutcome::failure(ErrorDetail::new("Execution events were lost"));
        self.queued.push_back(SseFrame::error(
            "Execution events were dropped before they could be streamed",
        ));
        self.queued.push_back(SseFrame::done(&lost));
        self.outcome = Some(lost);
    }

    /// Drains the stream into a vector.
    pub async fn collect(mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }
}
