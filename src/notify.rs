//! Live-transport notifications for newly appended turns.
//!
//! Broadcasting is best-effort and fire-and-forget: a dropped event never
//! loses the stored turn. WebSocket/SSE plumbing subscribes on the channel
//! side; the core only publishes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::history::MessageRole;

/// One appended turn, as seen by live listeners.
#[derive(Debug, Clone, Serialize)]
pub struct TurnEvent {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

pub trait Broadcaster: Send + Sync {
    /// At most once per appended turn; losses are acceptable.
    fn broadcast(&self, event: TurnEvent);
}

pub type DynBroadcaster = Arc<dyn Broadcaster>;

/// Default when no transport is attached.
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&self, _event: TurnEvent) {}
}

/// Fan-out over a tokio broadcast channel. Send errors (no subscribers,
/// lagged receivers) are ignored.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<TurnEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: TurnEvent) {
        let _ = self.tx.send(event);
    }
}
