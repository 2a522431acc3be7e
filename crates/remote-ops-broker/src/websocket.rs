//! Axum WebSocket endpoint for agent connections.
//!
//! Connections move through `AwaitingHandshake -> Active -> Closed`. The
//! credential is resolved before the upgrade; the handshake then installs
//! the session in the registry and everything after that is message
//! dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use remote_ops_protocol::{ClientMessage, ServerMessage, close_code, header as protocol_header};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{
    Broker,
    registry::{Outbound, SessionTransport},
};

/// Credential rejection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Resolves a pre-issued bearer credential to a user identity.
///
/// Credential issuance and verification live outside the broker; this trait
/// is the boundary, invoked once per connection before `register`.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Resolve `token` to a user id.
    ///
    /// # Errors
    /// Returns [`AuthError`] when the credential is invalid.
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Verifier accepting one shared token. Useful for tests and single-tenant
/// deployments.
pub struct StaticTokenVerifier {
    token: String,
    user_id: String,
}

impl StaticTokenVerifier {
    /// Create a verifier mapping `token` to `user_id`.
    #[must_use]
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token == self.token {
            Ok(self.user_id.clone())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct WsState {
    pub broker: Arc<Broker>,
    pub verifier: Arc<dyn CredentialVerifier>,
}

/// Identity resolved from the upgrade request, before the handshake.
#[derive(Debug, Clone)]
struct ConnectionIdentity {
    user_id: String,
    session_id: String,
}

/// Create the agent WebSocket router (`GET /ws`).
#[must_use]
pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler: authenticates, then upgrades.
pub async fn ws_handler(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing authorization token").into_response();
    };

    let session_id = header_value(&headers, protocol_header::SESSION_ID);
    if session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing session header").into_response();
    }

    let user_id = match state.verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::warn!(session_id, "Rejected connection: {err}");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let identity = ConnectionIdentity {
        user_id,
        session_id,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: WsState, identity: ConnectionIdentity) {
    let (mut sender, mut receiver) = socket.split();
    let (transport, mut outbound) = SessionTransport::channel();
    let transport_id = transport.id();

    // Drain the outbound queue onto the wire.
    let send_task = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut registered: Option<String> = None;
    let mut close_reason = "closed".to_string();

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(frame)) => {
                close_reason = frame
                    .map_or_else(|| "closed".to_string(), |f| format!("closed:{}", f.code));
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!("WebSocket error: {err}");
                close_reason = "error".to_string();
                break;
            }
        };

        if let Some(session_id) = &registered {
            // Active: invalid payloads are dropped with a warning; only a
            // conflicting handshake is fatal.
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::CommandResult(result)) => {
                    state.broker.dispatcher().on_command_result(session_id, result);
                }
                Ok(ClientMessage::ExecutionOutput(output)) => {
                    state
                        .broker
                        .dispatcher()
                        .on_execution_output(session_id, output);
                }
                Ok(ClientMessage::Pong { .. }) => {
                    state.broker.registry().touch(session_id);
                }
                Ok(ClientMessage::Handshake(handshake)) => {
                    if handshake.session_id == *session_id {
                        tracing::warn!(session_id, "Dropping repeated handshake");
                    } else {
                        transport.close(close_code::SESSION_MISMATCH, "session id mismatch");
                        close_reason = "session id mismatch".to_string();
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id, "Dropping invalid message: {err}");
                }
            }
        } else {
            // AwaitingHandshake: anything but a well-formed, matching
            // handshake is fatal.
            let handshake = match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Handshake(handshake)) => handshake,
                Ok(_) => {
                    transport.close(close_code::HANDSHAKE_EXPECTED, "handshake message expected");
                    close_reason = "handshake expected".to_string();
                    break;
                }
                Err(err) => {
                    tracing::warn!("Invalid handshake payload: {err}");
                    transport.close(close_code::INVALID_PAYLOAD, "invalid payload");
                    close_reason = "invalid payload".to_string();
                    break;
                }
            };

            if handshake.session_id != identity.session_id {
                transport.close(close_code::SESSION_MISMATCH, "session id mismatch");
                close_reason = "session id mismatch".to_string();
                break;
            }

            match state
                .broker
                .registry()
                .register(&handshake, &identity.user_id, transport.clone())
            {
                Ok(info) => {
                    // The ack confirms this connection is the authoritative
                    // session rather than one silently superseded by a race.
                    let _ = transport.send(&ServerMessage::HandshakeAck {
                        session_id: info.session_id.clone(),
                    });
                    registered = Some(info.session_id);
                }
                Err(err) => {
                    tracing::warn!("Rejected handshake: {err}");
                    transport.close(close_code::INVALID_PAYLOAD, err.to_string());
                    close_reason = "rejected handshake".to_string();
                    break;
                }
            }
        }
    }

    if let Some(session_id) = registered {
        state
            .broker
            .registry()
            .remove_if_current(&session_id, transport_id, &close_reason);
    }

    // Let the writer drain any queued close frame; dropping our transport
    // clone (after registry removal) closes the queue and ends the task.
    drop(transport);
    if tokio::time::timeout(std::time::Duration::from_secs(5), send_task)
        .await
        .is_err()
    {
        tracing::debug!("Outbound queue did not drain before teardown");
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}
