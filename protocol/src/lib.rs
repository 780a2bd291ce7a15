//! Wire types shared between the session supervisor and its consumers.
//!
//! [`frames`] describes the newline-delimited JSON spoken with a worker
//! process over its standard streams, [`events`] the typed events the
//! supervisor republishes, and [`session`] the identifiers and lifecycle
//! states exposed by the control API.

pub mod events;
pub mod frames;
pub mod session;

pub use events::ExecutionOutcome;
pub use events::ExecutionStatus;
pub use events::SessionEvent;
pub use events::SessionEventKind;
pub use events::StopInfo;
pub use events::StopReason;
pub use frames::ErrorDetail;
pub use frames::InboundFrame;
pub use frames::OutboundFrame;
pub use frames::OutputChunk;
pub use session::SessionId;
pub use session::SessionStatus;
