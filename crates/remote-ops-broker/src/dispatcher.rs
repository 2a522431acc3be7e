//! Command dispatch and exactly-once result correlation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use remote_ops_protocol::{Command, CommandResult, ExecutionOutput, ServerMessage};
use thiserror::Error;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::{
    events::{BrokerEvent, BrokerEvents},
    registry::SessionRegistry,
};

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Why a dispatched command did not produce a result.
///
/// The variants are disjoint so a caller can always tell a timeout from a
/// disconnect from a dispatch failure.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("session {0} is not connected")]
    SessionNotConnected(String),
    #[error("session {0} transport is not open")]
    TransportClosed(String),
    #[error("failed to dispatch command {command_id}: {reason}")]
    DispatchFailed { command_id: String, reason: String },
    #[error("command {command_id} timed out after {timeout:?}")]
    TimedOut {
        command_id: String,
        timeout: Duration,
    },
    #[error("command cancelled because session {session_id} disconnected: {reason}")]
    Disconnected { session_id: String, reason: String },
    #[error("command {0} was abandoned without a resolution")]
    Abandoned(String),
}

type PendingKey = (String, String);
type Resolver = oneshot::Sender<Result<CommandResult, DispatchError>>;

struct PendingEntry {
    resolver: Resolver,
    timer: Option<AbortHandle>,
}

/// Correlation table of in-flight commands, keyed by
/// `(session_id, command_id)`.
///
/// Every entry is destroyed exactly once. The take is a map removal under one
/// mutex, so a matching result, the timeout timer, and session removal can
/// never double-resolve a waiter.
#[derive(Default)]
pub struct PendingCommands {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
}

impl PendingCommands {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no commands are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn insert(&self, key: PendingKey, entry: PendingEntry) {
        self.entries.lock().unwrap().insert(key, entry);
    }

    fn take(&self, key: &PendingKey) -> Option<PendingEntry> {
        self.entries.lock().unwrap().remove(key)
    }

    /// Arm an already-inserted entry with its timer handle.
    ///
    /// If the entry resolved in the meantime the timer is cancelled instead.
    fn attach_timer(&self, key: &PendingKey, timer: AbortHandle) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Reject every entry belonging to `session_id` with a disconnect error.
    pub(crate) fn reject_session(&self, session_id: &str, reason: &str) {
        let drained: Vec<(PendingKey, PendingEntry)> = {
            let mut entries = self.entries.lock().unwrap();
            let keys: Vec<PendingKey> = entries
                .keys()
                .filter(|(sid, _)| sid == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for ((_, command_id), entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            tracing::debug!(session_id, command_id, "Rejecting command on disconnect");
            let _ = entry.resolver.send(Err(DispatchError::Disconnected {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            }));
        }
    }
}

/// Sends commands to sessions and correlates their asynchronous results.
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    pending: Arc<PendingCommands>,
    events: Arc<BrokerEvents>,
}

impl CommandDispatcher {
    /// Create a dispatcher over a registry and its shared correlation table.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        pending: Arc<PendingCommands>,
        events: Arc<BrokerEvents>,
    ) -> Self {
        Self {
            registry,
            pending,
            events,
        }
    }

    /// Dispatch a command to a session and await its terminal outcome.
    ///
    /// Fails immediately when the session is unknown or its transport is not
    /// open - no entry is created and no timer armed; the caller must
    /// re-dispatch against a new session after a reconnect. Otherwise the
    /// call suspends until the matching result arrives, the timeout (default
    /// 5 minutes) fires, or the session disconnects.
    ///
    /// # Errors
    /// [`DispatchError`] distinguishes every non-result outcome.
    pub async fn dispatch(
        &self,
        session_id: &str,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, DispatchError> {
        let transport = self
            .registry
            .transport(session_id)
            .ok_or_else(|| DispatchError::SessionNotConnected(session_id.to_string()))?;
        if !transport.is_open() {
            return Err(DispatchError::TransportClosed(session_id.to_string()));
        }

        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let key: PendingKey = (session_id.to_string(), command.command_id.clone());
        let (resolver, resolution) = oneshot::channel();

        // The entry must exist before the timer can possibly fire.
        self.pending.insert(
            key.clone(),
            PendingEntry {
                resolver,
                timer: None,
            },
        );
        let timer = tokio::spawn({
            let pending = Arc::clone(&self.pending);
            let key = key.clone();
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(entry) = pending.take(&key) {
                    let _ = entry.resolver.send(Err(DispatchError::TimedOut {
                        command_id: key.1,
                        timeout,
                    }));
                }
            }
        });
        self.pending.attach_timer(&key, timer.abort_handle());

        tracing::debug!(
            session_id,
            command_id = %key.1,
            tool_name = %command.tool_name,
            "Dispatching command"
        );
        if let Err(err) = transport.send(&ServerMessage::Command(command)) {
            // Never reached the wire; tear the entry down synchronously.
            if let Some(entry) = self.pending.take(&key) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
            return Err(DispatchError::DispatchFailed {
                command_id: key.1,
                reason: err.to_string(),
            });
        }
        // Holding the transport handle past the send would keep the
        // connection's outbound queue alive while we wait.
        drop(transport);

        match resolution.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Abandoned(key.1)),
        }
    }

    /// Handle a terminal result reported by a session.
    ///
    /// Resolves the matching pending command if one is still waiting and
    /// always republishes the result for observers - a result may
    /// legitimately outlive its waiter.
    pub fn on_command_result(&self, session_id: &str, result: CommandResult) {
        self.registry.touch(session_id);

        let key = (session_id.to_string(), result.command_id.clone());
        if let Some(entry) = self.pending.take(&key) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.resolver.send(Ok(result.clone()));
        } else {
            tracing::debug!(
                session_id,
                command_id = %result.command_id,
                "Result without a waiting dispatch"
            );
        }

        self.events.publish(BrokerEvent::CommandResult {
            session_id: session_id.to_string(),
            result,
        });
    }

    /// Handle a streamed output chunk; never resolves a pending command.
    pub fn on_execution_output(&self, session_id: &str, output: ExecutionOutput) {
        self.registry.touch(session_id);
        self.events.publish(BrokerEvent::ExecutionOutput {
            session_id: session_id.to_string(),
            output,
        });
    }
}
