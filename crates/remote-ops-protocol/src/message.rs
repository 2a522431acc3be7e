//! Tagged message types exchanged over the persistent channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// First message on a new connection, establishing identity and session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Agent build/protocol version.
    pub version: String,
    /// Caller-generated unique session token, also the supersede key.
    pub session_id: String,
    /// Free-form remote machine label.
    pub machine_id: String,
    /// Absolute path the agent is scoped to.
    pub project_directory: String,
}

/// A unit of work dispatched to exactly one session.
///
/// `tool_name` is kept as a plain string so an unrecognized tool still parses
/// cleanly and comes back as an error result instead of being dropped by
/// message validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Command {
    /// Create a new command.
    #[must_use]
    pub fn new(
        command_id: impl Into<String>,
        tool_name: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            tool_name: tool_name.into(),
            parameters,
        }
    }
}

/// Command completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Error,
}

/// Terminal outcome of a dispatched command.
///
/// At most one result is ever accepted per `command_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    /// Opaque payload on success, `null` on failure.
    #[serde(default)]
    pub result: Option<Value>,
    /// Human-readable message on failure, `null` on success.
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandResult {
    /// Build a success result carrying `output`.
    #[must_use]
    pub fn success(command_id: impl Into<String>, output: Value) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Success,
            result: Some(output),
            error: None,
        }
    }

    /// Build an error result carrying a message.
    #[must_use]
    pub fn failure(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Whether the command exited successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, CommandStatus::Success)
    }
}

/// Which stream an output chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Info,
}

/// Out-of-band streamed output for a running command.
///
/// Zero or more may precede the terminal [`CommandResult`]; they never
/// resolve the pending command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub command_id: String,
    pub stream: OutputStream,
    pub data: String,
}

impl ExecutionOutput {
    /// Create a stdout chunk.
    #[must_use]
    pub fn stdout(command_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(command_id, OutputStream::Stdout, data)
    }

    /// Create a stderr chunk.
    #[must_use]
    pub fn stderr(command_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(command_id, OutputStream::Stderr, data)
    }

    /// Create an informational notice (e.g. a timeout note).
    #[must_use]
    pub fn info(command_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(command_id, OutputStream::Info, data)
    }

    fn new(command_id: impl Into<String>, stream: OutputStream, data: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            stream,
            data: data.into(),
        }
    }
}

/// Message from agent to control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake(Handshake),
    CommandResult(CommandResult),
    ExecutionOutput(ExecutionOutput),
    /// Heartbeat reply, echoing the probe nonce.
    Pong {
        #[serde(default)]
        nonce: Option<String>,
    },
}

/// Message from control plane to agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the handshake was accepted as the authoritative session.
    ///
    /// The field is camelCase on the wire; deployed agents expect it that way.
    HandshakeAck {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Command(Command),
    /// Heartbeat probe with an optional nonce to echo back.
    Ping {
        #[serde(default)]
        nonce: Option<String>,
    },
}
