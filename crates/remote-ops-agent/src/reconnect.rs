//! Bounded-delay reconnect loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{AgentError, AgentOptions, SessionEnd, connect_once};

/// Fixed reconnect delays.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Delay after a clean close.
    pub clean_delay: Duration,
    /// Delay after an error.
    pub error_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            clean_delay: Duration::from_secs(3),
            error_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Policy with reconnection enabled and the default delays.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Run the agent until shutdown, reconnecting per `policy`.
///
/// Delays are raced against the cancellation token so shutdown stays prompt.
/// A failure before the very first acknowledgement propagates instead of
/// retrying - a bad endpoint or refused credential should surface, not loop
/// silently.
///
/// # Errors
/// Propagates the connection error when reconnection is disabled or the
/// agent never came up.
pub async fn run(
    options: &AgentOptions,
    policy: &ReconnectPolicy,
    shutdown: &CancellationToken,
) -> Result<(), AgentError> {
    let mut ever_acked = false;

    loop {
        let delay = match connect_once(options, shutdown).await {
            Ok(SessionEnd::ShutdownRequested) => return Ok(()),
            Ok(SessionEnd::Closed { code, reason }) => {
                ever_acked = true;
                if !policy.enabled {
                    return Ok(());
                }
                tracing::warn!(
                    ?code,
                    reason,
                    "Connection closed; reconnecting in {:?}",
                    policy.clean_delay
                );
                policy.clean_delay
            }
            Err(err) => {
                if !policy.enabled {
                    return Err(err);
                }
                if !ever_acked && err.is_pre_ack() {
                    return Err(err);
                }
                ever_acked = ever_acked || !err.is_pre_ack();
                tracing::error!(
                    "Connection error: {err}; retrying in {:?}",
                    policy.error_delay
                );
                policy.error_delay
            }
        };

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
