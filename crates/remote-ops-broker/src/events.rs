//! Multi-consumer notification bus for broker events.

use futures::StreamExt;
use remote_ops_protocol::{CommandResult, ExecutionOutput};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::registry::SessionInfo;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Event published by the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A session completed its handshake and became authoritative.
    Connected { session: SessionInfo },
    /// A session was removed.
    Disconnected { session: SessionInfo, reason: String },
    /// A terminal result arrived, whether or not a dispatch was still waiting.
    CommandResult {
        session_id: String,
        result: CommandResult,
    },
    /// A streamed output chunk arrived.
    ExecutionOutput {
        session_id: String,
        output: ExecutionOutput,
    },
}

/// Broadcast fan-out; subscription lifetime is the receiver's lifetime.
pub struct BrokerEvents {
    tx: broadcast::Sender<BrokerEvent>,
}

impl BrokerEvents {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    /// Events as a stream; lagged entries are dropped.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, BrokerEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    pub(crate) fn publish(&self, event: BrokerEvent) {
        // No subscribers is fine; events are observability, not control flow.
        let _ = self.tx.send(event);
    }
}

impl Default for BrokerEvents {
    fn default() -> Self {
        Self::new()
    }
}
