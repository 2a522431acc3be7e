//! Heartbeat probing and stale-session reaping.

use std::{sync::Arc, time::Duration};

use remote_ops_protocol::{ServerMessage, close_code};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::SessionRegistry;

/// Liveness tuning.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often every session is probed with a ping.
    pub probe_interval: Duration,
    /// How long a session may stay silent before it is removed.
    pub idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Periodic heartbeat probe over the registry.
///
/// Disconnection is detected either by transport closure (the connection
/// task removes the session) or by heartbeat silence (this monitor does).
pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Create a monitor over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    /// Spawn the probe loop; abort the handle to stop it.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.probe();
            }
        })
    }

    fn probe(&self) {
        for session in self.registry.sessions() {
            if session.last_seen_at.elapsed() > self.config.idle_timeout {
                tracing::warn!(
                    session_id = %session.session_id,
                    "Session silent past idle timeout; removing"
                );
                if let Some(transport) = self.registry.transport(&session.session_id) {
                    transport.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                }
                self.registry.remove(&session.session_id, "heartbeat timeout");
            } else if let Some(transport) = self.registry.transport(&session.session_id) {
                let _ = transport.send(&ServerMessage::Ping {
                    nonce: Some(Uuid::new_v4().to_string()),
                });
            }
        }
    }
}
