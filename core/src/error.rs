use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kernelhub_protocol::SessionId;
use kernelhub_protocol::SessionStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Failures surfaced synchronously by the control API.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session {session_id} already exists ({status})")]
    AlreadyActive {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error("dataset `{dataset}` could not be resolved")]
    ResourceNotFound { dataset: String },
    #[error("session {session_id} is not ready: {reason}")]
    NotReady {
        session_id: SessionId,
        reason: NotReadyReason,
    },
    #[error("failed to spawn worker for session {session_id}: {source}")]
    Spawn {
        session_id: SessionId,
        #[source]
        source: ProcessError,
    },
    #[error("worker for session {session_id} did not report ready within {timeout:?}")]
    StartupTimeout {
        session_id: SessionId,
        timeout: Duration,
    },
    #[error(
        "worker for session {session_id} exited before reporting ready (code: {code:?}, signal: {signal:?})"
    )]
    ExitedDuringStartup {
        session_id: SessionId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("session {session_id} was stopped before it became ready")]
    StartupAborted { session_id: SessionId },
}

impl SupervisorError {
    pub(crate) fn not_ready(session_id: &SessionId, status: SessionStatus) -> Self {
        Self::NotReady {
            session_id: session_id.clone(),
            reason: NotReadyReason::Status(status),
        }
    }

    pub(crate) fn nothing_prepared(session_id: &SessionId) -> Self {
        Self::NotReady {
            session_id: session_id.clone(),
            reason: NotReadyReason::NothingPrepared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    Status(SessionStatus),
    NothingPrepared,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::Status(status) => write!(f, "status is {status}"),
            NotReadyReason::NothingPrepared => write!(f, "no code has been prepared"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {stream} pipe was not captured")]
    MissingPipe { stream: &'static str },
    #[error("worker stdin is closed")]
    StdinClosed,
    #[error("failed to signal worker: {source}")]
    Signal {
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    pub(crate) fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("`{frame_type}` frame has an unexpected shape: {source}")]
    InvalidFrame {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame exceeded {limit} bytes without a newline")]
    FrameTooLarge { limit: usize },
    #[error("failed to encode frame: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// Why an [`EventSubscription`](crate::event_bus::EventSubscription) did not
/// yield an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Events were dropped before this subscriber read them; some may have
    /// belonged to its session.
    #[error("subscriber fell behind and {skipped} events were dropped")]
    Lagged { skipped: u64 },
    #[error("no event is queued")]
    Empty,
    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
