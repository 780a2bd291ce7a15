use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Opaque identifier of one logical session. Callers may pick their own or
/// let the supervisor generate one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of a session as observed through the control API.
///
/// `Stopped` is never stored: a session that has stopped is simply absent
/// from the registry and reported as `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Ready,
    Busy,
    Stopping,
    Stopped,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Busy => write!(f, "busy"),
            SessionStatus::Stopping => write!(f, "stopping"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}
