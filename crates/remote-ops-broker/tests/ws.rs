//! End-to-end tests of the WebSocket endpoint against a real socket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use remote_ops_broker::{Broker, StaticTokenVerifier, WsState, websocket};
use remote_ops_protocol::{
    ClientMessage, Command, CommandResult, Handshake, ServerMessage, close_code, header, tool,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(broker: Arc<Broker>) -> SocketAddr {
    let state = WsState {
        broker,
        verifier: Arc::new(StaticTokenVerifier::new("secret", "user-1")),
    };
    let app = websocket::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, token: &str, session_id: &str) -> WsClient {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    request.headers_mut().insert(
        header::SESSION_ID,
        HeaderValue::from_str(session_id).unwrap(),
    );
    request
        .headers_mut()
        .insert(header::MACHINE_ID, HeaderValue::from_static("test-machine"));

    let (stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream
}

async fn send_client_message(client: &mut WsClient, message: &ClientMessage) {
    let frame = serde_json::to_string(message).unwrap();
    client.send(Message::Text(frame.into())).await.unwrap();
}

async fn next_server_message(client: &mut WsClient) -> ServerMessage {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_close_code(client: &mut WsClient) -> u16 {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame without code"),
            _ => {}
        }
    }
}

fn handshake_message(session_id: &str) -> ClientMessage {
    ClientMessage::Handshake(Handshake {
        version: "0.1.0".to_string(),
        session_id: session_id.to_string(),
        machine_id: "test-machine".to_string(),
        project_directory: "/srv/project".to_string(),
    })
}

#[tokio::test]
async fn test_handshake_is_acknowledged() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(Arc::clone(&broker)).await;

    let mut client = connect(addr, "secret", "s-1").await;
    send_client_message(&mut client, &handshake_message("s-1")).await;

    match next_server_message(&mut client).await {
        ServerMessage::HandshakeAck { session_id } => assert_eq!(session_id, "s-1"),
        other => panic!("expected ack, got {other:?}"),
    }
    assert_eq!(broker.registry().list_by_user("user-1").len(), 1);
}

#[tokio::test]
async fn test_missing_token_is_refused_before_upgrade() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(broker).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(header::SESSION_ID, HeaderValue::from_static("s-1"));

    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_token_is_refused_before_upgrade() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(broker).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_static("Bearer wrong-token"),
    );
    request
        .headers_mut()
        .insert(header::SESSION_ID, HeaderValue::from_static("s-1"));

    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_message_must_be_handshake() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(broker).await;

    let mut client = connect(addr, "secret", "s-1").await;
    send_client_message(&mut client, &ClientMessage::Pong { nonce: None }).await;

    assert_eq!(
        next_close_code(&mut client).await,
        close_code::HANDSHAKE_EXPECTED
    );
}

#[tokio::test]
async fn test_handshake_session_mismatch_is_fatal() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(Arc::clone(&broker)).await;

    let mut client = connect(addr, "secret", "s-1").await;
    send_client_message(&mut client, &handshake_message("something-else")).await;

    assert_eq!(
        next_close_code(&mut client).await,
        close_code::SESSION_MISMATCH
    );
    assert!(broker.registry().get("something-else").is_none());
}

#[tokio::test]
async fn test_command_round_trip() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(Arc::clone(&broker)).await;

    let mut client = connect(addr, "secret", "s-1").await;
    send_client_message(&mut client, &handshake_message("s-1")).await;
    next_server_message(&mut client).await; // ack

    let dispatch = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let parameters = json!({"path": "src/app.ts", "content": "hello"});
            let serde_json::Value::Object(parameters) = parameters else {
                unreachable!()
            };
            broker
                .dispatcher()
                .dispatch(
                    "s-1",
                    Command::new("c1", tool::WRITE_FILE, parameters),
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };

    let command = match next_server_message(&mut client).await {
        ServerMessage::Command(command) => command,
        other => panic!("expected command, got {other:?}"),
    };
    assert_eq!(command.command_id, "c1");
    assert_eq!(command.tool_name, tool::WRITE_FILE);

    send_client_message(
        &mut client,
        &ClientMessage::CommandResult(CommandResult::success(
            "c1",
            json!({"path": "src/app.ts", "bytesWritten": 5}),
        )),
    )
    .await;

    let result = dispatch.await.unwrap().unwrap();
    assert_eq!(result.command_id, "c1");
    assert!(result.is_success());
    assert_eq!(result.result.unwrap()["bytesWritten"], 5);
}

#[tokio::test]
async fn test_supersede_closes_first_transport_and_routes_to_second() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(Arc::clone(&broker)).await;

    let mut first = connect(addr, "secret", "s-1").await;
    send_client_message(&mut first, &handshake_message("s-1")).await;
    next_server_message(&mut first).await; // ack

    let mut second = connect(addr, "secret", "s-1").await;
    send_client_message(&mut second, &handshake_message("s-1")).await;
    next_server_message(&mut second).await; // ack

    // The first transport is closed with the supersede code.
    assert_eq!(next_close_code(&mut first).await, close_code::SUPERSEDED);

    // A command dispatched afterwards reaches only the second transport.
    let dispatch = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let serde_json::Value::Object(parameters) = json!({"path": "a.txt"}) else {
                unreachable!()
            };
            broker
                .dispatcher()
                .dispatch(
                    "s-1",
                    Command::new("c2", tool::READ_FILE, parameters),
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };

    let command = match next_server_message(&mut second).await {
        ServerMessage::Command(command) => command,
        other => panic!("expected command, got {other:?}"),
    };
    assert_eq!(command.command_id, "c2");

    send_client_message(
        &mut second,
        &ClientMessage::CommandResult(CommandResult::failure("c2", "file not found")),
    )
    .await;
    let result = dispatch.await.unwrap().unwrap();
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_disconnect_rejects_outstanding_dispatch() {
    let broker = Arc::new(Broker::new());
    let addr = start_server(Arc::clone(&broker)).await;

    let mut client = connect(addr, "secret", "s-1").await;
    send_client_message(&mut client, &handshake_message("s-1")).await;
    next_server_message(&mut client).await; // ack

    let dispatch = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let serde_json::Value::Object(parameters) = json!({"command": "sleep 60"}) else {
                unreachable!()
            };
            broker
                .dispatcher()
                .dispatch(
                    "s-1",
                    Command::new("c3", tool::RUN_COMMAND, parameters),
                    Some(Duration::from_secs(30)),
                )
                .await
        })
    };

    // Wait for the command to reach the client, then drop the connection.
    match next_server_message(&mut client).await {
        ServerMessage::Command(_) => {}
        other => panic!("expected command, got {other:?}"),
    }
    drop(client);

    let err = dispatch.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        remote_ops_broker::DispatchError::Disconnected { .. }
    ));
}
