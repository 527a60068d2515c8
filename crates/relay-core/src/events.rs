//! Broadcast bus for gateway events consumed outside the core, such as audit persistence.
//!
//! Publishing never blocks. A lagging subscriber loses the oldest events rather than slowing
//! down the request path.

use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Something an operator or an external collaborator may want to record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A response was fetched from an upstream endpoint.
    UpstreamFetched {
        source_id: Option<String>,
        endpoint_id: Option<String>,
        cache_key: String,
        status: u16,
        stored: bool,
    },
    /// Every endpoint failed and a stale entry or mock payload was served instead.
    FallbackServed { source_id: String, cache_key: String, mode: &'static str },
    /// The request was refused before reaching an upstream.
    RequestRejected { source_id: Option<String>, reason: &'static str },
    KillSwitchChanged { source_id: Option<String>, enabled: bool },
    CacheInvalidated { cache_key: String },
    CachePurged { scope: String, removed: usize },
    CacheTtlUpdated { entries_updated: usize, ttl_seconds: u64 },
    PolicyCleanup { removed: usize },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to current subscribers; the event is dropped when there are none.
    pub fn publish(&self, event: GatewayEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("gateway event dropped, no subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
