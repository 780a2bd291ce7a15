use kernelhub_protocol::SessionEvent;
use kernelhub_protocol::SessionEventKind;
use kernelhub_protocol::SessionId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::trace;
use tracing::warn;

use crate::error::SubscriptionError;

/// Largest backlog the bus retains for a slow subscriber.
pub const MAX_CAPACITY: usize = 65_536;

/// Single broadcast channel shared by every session. There is no
/// per-subscriber routing: subscribers filter by session id themselves.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.clamp(1, MAX_CAPACITY));
        Self { events }
    }

    pub fn publish(&self, session_id: &SessionId, kind: SessionEventKind) {
        trace!(session = %session_id, event = kind.name(), "publishing event");
        // No subscribers is fine: events are fire-and-forget.
        let _ = self.events.send(SessionEvent {
            session_id: session_id.clone(),
            kind,
        });
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            events: self.events.subscribe(),
            session: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

/// A receiver on the [`EventBus`], optionally narrowed to one session.
#[derive(Debug)]
pub struct EventSubscription {
    events: broadcast::Receiver<SessionEvent>,
    session: Option<SessionId>,
}

impl EventSubscription {
    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session = Some(session_id);
        self
    }

    /// Waits for the next matching event. Returns `None` once the bus is
    /// gone. Lag is logged and skipped; use [`recv`](Self::recv) to observe it.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.recv().await {
                Ok(event) => return Some(event),
                Err(SubscriptionError::Lagged { skipped }) => self.report_lag(skipped),
                Err(SubscriptionError::Empty | SubscriptionError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event that is already queued, if any.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.try_recv() {
                Ok(event) => return Some(event),
                Err(SubscriptionError::Lagged { skipped }) => self.report_lag(skipped),
                Err(SubscriptionError::Empty | SubscriptionError::Closed) => return None,
            }
        }
    }

    /// Waits for the next matching event, reporting lag to the caller. After
    /// `Lagged` the subscription resumes from the oldest retained event.
    pub async fn recv(&mut self) -> Result<SessionEvent, SubscriptionError> {
        loop {
            match self.events.recv().await {
                Ok(event) if self.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    return Err(SubscriptionError::Lagged { skipped });
                }
                Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SessionEvent, SubscriptionError> {
        loop {
            match self.events.try_recv() {
                Ok(event) if self.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    return Err(SubscriptionError::Lagged { skipped });
                }
                Err(TryRecvError::Empty) => return Err(SubscriptionError::Empty),
                Err(TryRecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    fn matches(&self, event: &SessionEvent) -> bool {
        self.session
            .as_ref()
            .is_none_or(|session| *session == event.session_id)
    }

    fn report_lag(&self, skipped: u64) {
        warn!(
            session = ?self.session,
            skipped, "event subscriber fell behind; oldest events were dropped"
        );
    }
}
