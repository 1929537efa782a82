//! Integration tests for the control connection over a real WebSocket.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sprite_protocol::{ControlMessage, Frame};
use sprite_runtime::{ControlConnection, Error, OwnerEvent, transport};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

#[tokio::test]
async fn control_operation_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut auth = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            Ok(resp)
        })
        .await
        .unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer tok-123"));

        let (mut ws_tx, mut ws_rx) = ws.split();

        let incoming = ws_rx.next().await.unwrap().unwrap();
        let Message::Text(text) = incoming else {
            panic!("expected op.start text frame, got {incoming:?}");
        };
        let ControlMessage::OpStart { op, args } = ControlMessage::parse(&text).unwrap().unwrap()
        else {
            panic!("expected op.start");
        };
        assert_eq!(op, "exec");
        assert_eq!(args["cmd"][0], "echo");

        ws_tx
            .send(Message::Binary(Frame::Stdout(b"hi\n".to_vec()).encode()))
            .await
            .unwrap();
        ws_tx
            .send(Message::Text(
                ControlMessage::OpComplete { exit_code: 0 }.encode(),
            ))
            .await
            .unwrap();
    });

    let url = format!("ws://{addr}");
    let conn = ControlConnection::connect(&url, "tok-123", None)
        .await
        .unwrap();

    let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();
    conn.start_op(owner_tx, "exec", json!({"cmd": ["echo", "hi"]}))
        .await
        .unwrap();

    assert_eq!(
        owner_rx.recv().await,
        Some(OwnerEvent::Binary(Frame::Stdout(b"hi\n".to_vec()).encode()))
    );
    assert_eq!(
        owner_rx.recv().await,
        Some(OwnerEvent::OpComplete { exit_code: 0 })
    );

    server.await.unwrap();
}

#[tokio::test]
async fn upgrade_404_is_control_unsupported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Reject the upgrade before the WebSocket handshake completes.
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let url = format!("ws://{addr}/v1/sprites/nope/control");
    let err = transport::connect(&url, "tok-123").await.unwrap_err();
    assert!(matches!(err, Error::ControlUnsupported));

    server.await.unwrap();
}

#[tokio::test]
async fn server_disconnect_fails_the_active_operation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (_ws_tx, mut ws_rx) = ws.split();
        // Read the op.start, then drop the socket without completing.
        let _ = ws_rx.next().await;
    });

    let url = format!("ws://{addr}");
    let conn = ControlConnection::connect(&url, "tok-123", None)
        .await
        .unwrap();

    let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();
    conn.start_op(owner_tx, "exec", json!({"cmd": ["sleep", "60"]}))
        .await
        .unwrap();

    server.await.unwrap();
    assert!(matches!(
        owner_rx.recv().await,
        Some(OwnerEvent::OpError { .. })
    ));
}
