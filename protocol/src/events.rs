use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::frames::ErrorDetail;
use crate::frames::OutputChunk;
use crate::session::SessionId;

/// One event published by the supervisor. Events of a single session are
/// delivered in the order the underlying frames were observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SessionEventKind {
    /// The worker reported readiness. Consumed by `start()`.
    Ready,
    Output(OutputChunk),
    /// Execution-level failure detail. Always followed by an
    /// `ExecutionComplete` when an execution was in flight.
    Error(ErrorDetail),
    ExecutionComplete(ExecutionOutcome),
    /// The session's record was removed. Published exactly once per session.
    Stopped(StopInfo),
}

impl SessionEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEventKind::Ready => "ready",
            SessionEventKind::Output(_) => "output",
            SessionEventKind::Error(_) => "error",
            SessionEventKind::ExecutionComplete(_) => "executionComplete",
            SessionEventKind::Stopped(_) => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ExecutionOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: ErrorDetail) -> Self {
        Self {
            status: ExecutionStatus::Error,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Why a session's record went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called by the caller.
    Requested,
    /// Reclaimed after sitting idle past the threshold.
    Idle,
    /// The worker never reported readiness in time.
    StartupTimeout,
    /// The supervisor itself was shut down.
    SupervisorShutdown,
    /// The worker exited without being asked to.
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: StopReason,
}
