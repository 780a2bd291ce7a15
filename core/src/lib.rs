//! Session supervisor for long-lived code-execution workers.
//!
//! One worker process per session speaks newline-delimited JSON over its
//! standard streams. [`Supervisor`] drives each session through its
//! lifecycle and republishes everything the worker reports as typed
//! [`SessionEvent`]s.

pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod event_bus;
pub mod process;
pub mod sse;
mod supervisor;

pub use config::SupervisorConfig;
pub use config::WorkerConfig;
pub use error::CodecError;
pub use error::ConfigError;
pub use error::NotReadyReason;
pub use error::ProcessError;
pub use error::SubscriptionError;
pub use error::Result;
pub use error::SupervisorError;
pub use event_bus::EventBus;
pub use event_bus::EventSubscription;
pub use kernelhub_protocol::SessionEvent;
pub use kernelhub_protocol::SessionEventKind;
pub use kernelhub_protocol::SessionId;
pub use kernelhub_protocol::SessionStatus;
pub use sse::ExecutionStream;
pub use sse::SseFrame;
pub use supervisor::SessionDescriptor;
pub use supervisor::Supervisor;
