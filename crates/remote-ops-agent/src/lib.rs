//! Remote-machine half of the command protocol.
//!
//! Provides:
//! - `connect_once` - one connection: handshake, command loop, heartbeats
//! - `run` - reconnect-with-fixed-delay wrapper around it
//! - `AgentConfig` - persisted configuration for the CLI surface

pub mod client;
pub mod config;
pub mod reconnect;

pub use client::{AGENT_VERSION, AgentError, AgentOptions, SessionEnd, connect_once};
pub use config::{AgentConfig, ConfigError};
pub use reconnect::{ReconnectPolicy, run};
