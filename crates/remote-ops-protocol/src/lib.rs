//! Wire protocol for the control-plane / remote-agent channel.
//!
//! Provides:
//! - Tagged JSON message types for both directions
//! - The closed set of tool names
//! - WebSocket close-code registry

pub mod message;

pub use message::{
    ClientMessage, Command, CommandResult, CommandStatus, ExecutionOutput, Handshake,
    OutputStream, ServerMessage,
};

/// The closed set of tools a command may select.
///
/// Unrecognized names are rejected by the execution sandbox with an error
/// result, never retried.
pub mod tool {
    /// Write a file inside the project directory.
    pub const WRITE_FILE: &str = "write-file";
    /// Read a file inside the project directory.
    pub const READ_FILE: &str = "read-file";
    /// Run a shell command rooted at the project directory.
    pub const RUN_COMMAND: &str = "run-command";
}

/// Upgrade-request headers carried alongside the bearer credential.
pub mod header {
    /// Free-form machine label, informational before the handshake.
    pub const MACHINE_ID: &str = "x-remote-ops-machine";
    /// Session id claimed ahead of the handshake; the handshake must match it.
    pub const SESSION_ID: &str = "x-remote-ops-session";
}

/// WebSocket close codes used by the protocol.
pub mod close_code {
    /// Session replaced by a newer handshake claiming the same id.
    pub const SUPERSEDED: u16 = 4000;
    /// Connection attempted without a resolvable credential.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// Session removed after heartbeat silence.
    pub const HEARTBEAT_TIMEOUT: u16 = 4003;
    /// Payload failed structural validation during the handshake phase.
    pub const INVALID_PAYLOAD: u16 = 4400;
    /// First message on the connection was not a handshake.
    pub const HANDSHAKE_EXPECTED: u16 = 4401;
    /// Handshake session id does not match the one claimed at upgrade time.
    pub const SESSION_MISMATCH: u16 = 4402;
}
