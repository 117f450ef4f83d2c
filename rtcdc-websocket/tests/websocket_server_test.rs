use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use rtcdc_websocket::{
    WebSocket, WebSocketConfiguration, WebSocketMessage, WebSocketServer,
    WebSocketServerConfiguration, WebSocketState,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn echo_server(enable_tls: bool, max_message_size: usize) -> (Arc<WebSocketServer>, u16) {
    let server = WebSocketServer::bind(WebSocketServerConfiguration {
        port: 0,
        bind_address: Some("127.0.0.1".to_owned()),
        enable_tls,
        max_message_size: Some(max_message_size),
        ..Default::default()
    })
    .await
    .expect("bind server");

    server.on_client(Box::new(move |client: Arc<WebSocket>| {
        Box::pin(async move {
            let echo = Arc::clone(&client);
            client.on_message(Box::new(move |message| {
                let echo = Arc::clone(&echo);
                Box::pin(async move {
                    let _ = echo.send(message).await;
                })
            }));
        })
    }));

    let port = server.port();
    (server, port)
}

#[tokio::test]
async fn test_wss_echo_with_truncation_and_headers() {
    let _ = env_logger::try_init();
    let (server, port) = echo_server(true, 1000).await;

    // capture what the server sees of the upgrade request
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(Option<String>, Option<String>)>();
    server.on_client(Box::new(move |client: Arc<WebSocket>| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            let _ = seen_tx.send((
                client.path().map(str::to_owned),
                client
                    .request_header("x-badly-formatted")
                    .map(str::to_owned),
            ));
            let echo = Arc::clone(&client);
            client.on_message(Box::new(move |message| {
                let echo = Arc::clone(&echo);
                Box::pin(async move {
                    let _ = echo.send(message).await;
                })
            }));
        })
    }));

    let client = WebSocket::connect(
        &format!("wss://localhost:{port}/p"),
        WebSocketConfiguration {
            disable_tls_verification: true,
            additional_headers: vec![
                ("Authorization".to_owned(), "Bearer 9c96615b".to_owned()),
                ("X-Badly-Formatted".to_owned(), "Hello\r\nWorld".to_owned()),
            ],
            ..Default::default()
        },
    )
    .await
    .expect("connect");
    assert_eq!(client.ready_state(), WebSocketState::Open);

    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<WebSocketMessage>();
    client.on_message(Box::new(move |message| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            let _ = message_tx.send(message);
        })
    }));

    // the upgrade request is reconstituted server-side
    let (path, badly_formatted) = timeout(RECV_TIMEOUT, seen_rx.recv())
        .await
        .expect("server saw client")
        .expect("channel open");
    assert_eq!(path.as_deref(), Some("/p"));
    assert_eq!(badly_formatted.as_deref(), Some("Hello World"));

    client.send_binary(vec![0xAB; 1001]).await.expect("send binary");
    client.send_text("hi").await.expect("send text");

    // the server truncated the binary message at its 1000-byte cap
    let first = timeout(RECV_TIMEOUT, message_rx.recv())
        .await
        .expect("binary echo")
        .expect("channel open");
    match first {
        WebSocketMessage::Binary(data) => {
            assert_eq!(data.len(), 1000);
            assert!(data.iter().all(|&b| b == 0xAB));
        }
        other => panic!("expected binary echo, got {other:?}"),
    }

    let second = timeout(RECV_TIMEOUT, message_rx.recv())
        .await
        .expect("text echo")
        .expect("channel open");
    assert_eq!(second, WebSocketMessage::Text("hi".to_owned()));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_plain_ws_echo_and_close() {
    let _ = env_logger::try_init();
    let (server, port) = echo_server(false, 256 * 1024).await;

    let client = WebSocket::connect(
        &format!("ws://127.0.0.1:{port}/"),
        WebSocketConfiguration::default(),
    )
    .await
    .expect("connect");

    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<WebSocketMessage>();
    client.on_message(Box::new(move |message| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            let _ = message_tx.send(message);
        })
    }));

    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();
    client.on_close(Box::new(move || {
        let close_tx = close_tx.clone();
        Box::pin(async move {
            let _ = close_tx.send(());
        })
    }));

    client.send_text("ping?").await.expect("send");
    let echoed = timeout(RECV_TIMEOUT, message_rx.recv())
        .await
        .expect("echo")
        .expect("channel open");
    assert_eq!(echoed, WebSocketMessage::Text("ping?".to_owned()));

    client.close().await;
    timeout(RECV_TIMEOUT, close_rx.recv())
        .await
        .expect("close observed")
        .expect("channel open");
    assert_eq!(client.ready_state(), WebSocketState::Closed);

    // sending on a closed socket is a state error
    assert!(client.send_text("late").await.is_err());

    server.close().await;
}

#[tokio::test]
async fn test_connect_rejects_bad_scheme() {
    let result = WebSocket::connect("http://localhost:1/", WebSocketConfiguration::default()).await;
    assert!(result.is_err());
}
