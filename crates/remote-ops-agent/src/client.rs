//! One outbound connection: handshake, command loop, heartbeat replies.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use remote_ops_protocol::{ClientMessage, Command, Handshake, ServerMessage, header};
use remote_ops_sandbox::ToolExecutor;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message,
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;

/// Agent build version reported in the handshake.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection options for one agent session.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// WebSocket endpoint of the control plane.
    pub endpoint: String,
    /// Pre-issued bearer credential.
    pub access_token: String,
    /// Machine label reported to the control plane.
    pub machine_id: String,
    /// Session token; also the supersede key on the control plane.
    pub session_id: String,
    /// Directory all tool execution is confined to.
    pub project_directory: PathBuf,
}

/// How an acknowledged connection ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The server closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// Local shutdown was requested.
    ShutdownRequested,
}

/// Agent connection error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("failed to connect: {0}")]
    ConnectFailed(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed before handshake acknowledgement (code {code:?}: {reason})")]
    ClosedBeforeAck { code: Option<u16>, reason: String },
    #[error("handshake acknowledged a different session id: {0}")]
    WrongSession(String),
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the failure happened before the handshake acknowledgement.
    #[must_use]
    pub const fn is_pre_ack(&self) -> bool {
        !matches!(self, Self::ConnectionLost(_))
    }
}

/// Open one connection, handshake, and serve commands until it ends.
///
/// Commands execute one at a time; streamed output produced mid-command
/// interleaves with replies through a single outbound queue. A `ping` is
/// answered with a `pong` carrying the same nonce. Closure before the
/// acknowledgement is a hard failure for the attempt.
///
/// # Errors
/// [`AgentError`] distinguishes pre-acknowledgement failures (bad endpoint,
/// refused credential, early close) from a lost connection.
pub async fn connect_once(
    options: &AgentOptions,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, AgentError> {
    let request = build_request(options)?;
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(AgentError::ConnectFailed)?;
    let (mut sink, mut stream) = stream.split();

    // One outbound queue keeps results and streamed output ordered.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let _write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let executor = ToolExecutor::new(&options.project_directory).with_output(output_tx);
    let _output_task = tokio::spawn({
        let outbound = outbound_tx.clone();
        async move {
            while let Some(output) = output_rx.recv().await {
                let message = ClientMessage::ExecutionOutput(output);
                let Ok(frame) = serde_json::to_string(&message) else {
                    continue;
                };
                if outbound.send(Message::Text(frame.into())).is_err() {
                    break;
                }
            }
        }
    });

    send(
        &outbound_tx,
        &ClientMessage::Handshake(Handshake {
            version: AGENT_VERSION.to_string(),
            session_id: options.session_id.clone(),
            machine_id: options.machine_id.clone(),
            project_directory: options.project_directory.to_string_lossy().into_owned(),
        }),
    )?;

    let mut acked = false;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = outbound_tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client shutdown".into(),
                })));
                return Ok(SessionEnd::ShutdownRequested);
            }
            message = stream.next() => {
                let Some(message) = message else {
                    if acked {
                        return Ok(SessionEnd::Closed { code: None, reason: "connection closed".to_string() });
                    }
                    return Err(AgentError::ClosedBeforeAck { code: None, reason: "connection closed".to_string() });
                };
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::HandshakeAck { session_id }) => {
                            if session_id != options.session_id {
                                return Err(AgentError::WrongSession(session_id));
                            }
                            acked = true;
                            tracing::info!(
                                session_id = %options.session_id,
                                "Connected to control plane"
                            );
                        }
                        Ok(ServerMessage::Ping { nonce }) => {
                            send(&outbound_tx, &ClientMessage::Pong { nonce })?;
                        }
                        Ok(ServerMessage::Command(command)) => {
                            handle_command(&executor, &outbound_tx, command).await?;
                        }
                        Err(err) => {
                            tracing::warn!("Dropping invalid message from control plane: {err}");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.to_string())
                        });
                        if acked {
                            return Ok(SessionEnd::Closed { code, reason });
                        }
                        return Err(AgentError::ClosedBeforeAck { code, reason });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if acked {
                            return Err(AgentError::ConnectionLost(err));
                        }
                        return Err(AgentError::ConnectFailed(err));
                    }
                }
            }
        }
    }
}

async fn handle_command(
    executor: &ToolExecutor,
    outbound: &mpsc::UnboundedSender<Message>,
    command: Command,
) -> Result<(), AgentError> {
    tracing::info!(
        command_id = %command.command_id,
        tool_name = %command.tool_name,
        "Executing command"
    );

    let result = executor.execute(&command).await;

    if result.is_success() {
        tracing::info!(command_id = %command.command_id, "Command completed");
    } else {
        tracing::warn!(
            command_id = %command.command_id,
            error = result.error.as_deref().unwrap_or("unknown"),
            "Command failed"
        );
    }
    send(outbound, &ClientMessage::CommandResult(result))
}

fn send(
    outbound: &mpsc::UnboundedSender<Message>,
    message: &ClientMessage,
) -> Result<(), AgentError> {
    let frame = serde_json::to_string(message)?;
    // A closed queue means the socket already went away; the receive loop
    // surfaces that as the terminal outcome.
    let _ = outbound.send(Message::Text(frame.into()));
    Ok(())
}

fn build_request(
    options: &AgentOptions,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, AgentError> {
    let mut request = options
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| AgentError::InvalidOptions(format!("endpoint {}: {err}", options.endpoint)))?;

    let authorization = HeaderValue::from_str(&format!("Bearer {}", options.access_token))
        .map_err(|_| AgentError::InvalidOptions("credential is not header-safe".to_string()))?;
    let machine = HeaderValue::from_str(&options.machine_id)
        .map_err(|_| AgentError::InvalidOptions("machine id is not header-safe".to_string()))?;
    let session = HeaderValue::from_str(&options.session_id)
        .map_err(|_| AgentError::InvalidOptions("session id is not header-safe".to_string()))?;

    let headers = request.headers_mut();
    headers.insert("authorization", authorization);
    headers.insert(header::MACHINE_ID, machine);
    headers.insert(header::SESSION_ID, session);
    Ok(request)
}
