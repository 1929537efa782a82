//! Integration tests for direct exec sessions against a real WebSocket server.

use futures_util::{SinkExt, StreamExt};
use sprite::{Error, ExecCommand, ExecEvent, Frame, Sprite, TextSignal};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

#[tokio::test]
async fn direct_exec_round_trip() {
    let (listener, base) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut uri = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            uri = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();

        assert!(uri.starts_with("/v1/sprites/demo/exec?"));
        assert!(uri.contains("cmd=cat"));
        assert!(uri.contains("stdin=true"));
        assert!(uri.contains("env=GREETING%3Dhello") || uri.contains("env=GREETING=hello"));

        let (mut ws_tx, mut ws_rx) = ws.split();

        // Echo one stdin frame back as stdout, then exit.
        let incoming = ws_rx.next().await.unwrap().unwrap();
        let Message::Binary(bytes) = incoming else {
            panic!("expected binary stdin frame, got {incoming:?}");
        };
        let Frame::Stdin(data) = Frame::decode(&bytes) else {
            panic!("expected stdin frame");
        };
        ws_tx
            .send(Message::Binary(Frame::Stdout(data).encode()))
            .await
            .unwrap();

        let eof = ws_rx.next().await.unwrap().unwrap();
        assert_eq!(
            Frame::decode(&eof.into_data()),
            Frame::StdinEof,
            "stdin close should arrive as a zero-length stdin frame"
        );

        ws_tx
            .send(Message::Binary(Frame::Exit(0).encode()))
            .await
            .unwrap();
    });

    let sprite = Sprite::new(base, "tok", "demo").unwrap();
    let command = ExecCommand::new(["cat"]).stdin(true).env("GREETING", "hello");
    let mut session = sprite.exec(command).await.unwrap();

    session.write_stdin(b"ping".to_vec()).unwrap();
    session.close_stdin().unwrap();

    assert_eq!(
        session.next_event().await,
        Some(ExecEvent::Stdout(b"ping".to_vec()))
    );
    assert_eq!(session.next_event().await, Some(ExecEvent::Exit(0)));
    server.await.unwrap();
}

#[tokio::test]
async fn tty_exec_uses_raw_bytes_and_text_signals() {
    let (listener, base) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut uri = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            uri = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();
        assert!(uri.contains("tty=true"));
        assert!(uri.contains("rows=40"));
        assert!(uri.contains("cols=120"));

        let (mut ws_tx, mut ws_rx) = ws.split();

        // Raw prompt bytes, untagged.
        ws_tx
            .send(Message::Binary(b"$ ".to_vec()))
            .await
            .unwrap();

        // Client keystrokes arrive untagged too.
        let incoming = ws_rx.next().await.unwrap().unwrap();
        assert_eq!(incoming, Message::Binary(b"exit\r".to_vec()));

        // Resize travels as a JSON text signal.
        let incoming = ws_rx.next().await.unwrap().unwrap();
        let Message::Text(text) = incoming else {
            panic!("expected resize text frame, got {incoming:?}");
        };
        assert_eq!(
            TextSignal::parse(&text),
            Some(TextSignal::Resize { rows: 50, cols: 132 })
        );

        ws_tx
            .send(Message::Text(r#"{"type":"exit","code":0}"#.into()))
            .await
            .unwrap();
    });

    let sprite = Sprite::new(base, "tok", "demo").unwrap();
    let mut session = sprite
        .exec(ExecCommand::new(["bash"]).tty(40, 120))
        .await
        .unwrap();

    assert_eq!(
        session.next_event().await,
        Some(ExecEvent::Stdout(b"$ ".to_vec()))
    );

    session.write_stdin(b"exit\r".to_vec()).unwrap();
    session.resize(50, 132).unwrap();

    assert_eq!(session.wait().await.unwrap(), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn missing_sprite_surfaces_as_api_error() {
    let (listener, base) = bind().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let sprite = Sprite::new(base, "tok", "gone").unwrap();
    let err = sprite.exec(ExecCommand::new(["true"])).await.unwrap_err();
    let Error::Api(api) = err else {
        panic!("expected api error, got {err:?}");
    };
    assert_eq!(api.status, 404);

    server.await.unwrap();
}

#[tokio::test]
async fn server_close_without_exit_fails_the_session() {
    let (listener, base) = bind().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut ws_tx, _ws_rx) = ws.split();
        ws_tx
            .send(Message::Binary(Frame::Stdout(b"partial".to_vec()).encode()))
            .await
            .unwrap();
        // Drop without sending an exit frame.
    });

    let sprite = Sprite::new(base, "tok", "demo").unwrap();
    let mut session = sprite.exec(ExecCommand::new(["true"])).await.unwrap();

    assert_eq!(
        session.next_event().await,
        Some(ExecEvent::Stdout(b"partial".to_vec()))
    );
    assert!(matches!(
        session.next_event().await,
        Some(ExecEvent::Error(_))
    ));
    server.await.unwrap();
}
