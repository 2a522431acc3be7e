//! Control-plane half of the remote command protocol.
//!
//! Provides:
//! - `SessionRegistry` - authoritative map of live sessions
//! - `CommandDispatcher` - dispatch + exactly-once result correlation
//! - `LivenessMonitor` - heartbeat probing and stale-session reaping
//! - `BrokerEvents` - multi-consumer notification bus
//! - Axum WebSocket endpoint with a credential-verifier boundary

pub mod dispatcher;
pub mod events;
pub mod liveness;
pub mod registry;
pub mod websocket;

use std::sync::Arc;

pub use dispatcher::{CommandDispatcher, DEFAULT_COMMAND_TIMEOUT, DispatchError, PendingCommands};
pub use events::{BrokerEvent, BrokerEvents};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use registry::{
    Outbound, RegisterError, SessionInfo, SessionRegistry, SessionTransport, TransportSendError,
};
pub use websocket::{AuthError, CredentialVerifier, StaticTokenVerifier, WsState};

/// One process-wide broker: registry, dispatcher, and event bus wired
/// together with a shared correlation table.
///
/// Constructed once per process and passed by reference; several brokers can
/// coexist in one process (tests do exactly that).
pub struct Broker {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    events: Arc<BrokerEvents>,
}

impl Broker {
    /// Create a broker with fresh state.
    #[must_use]
    pub fn new() -> Self {
        let events = Arc::new(BrokerEvents::new());
        let pending = Arc::new(PendingCommands::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&pending),
            Arc::clone(&events),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            pending,
            Arc::clone(&events),
        ));
        Self {
            registry,
            dispatcher,
            events,
        }
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The command dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// The event bus.
    #[must_use]
    pub const fn events(&self) -> &Arc<BrokerEvents> {
        &self.events
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
