use futures_util::{SinkExt, StreamExt};
use mockproxy::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

mod common;

fn passthrough_to(upstream_port: u16) -> PassthroughStepConfig {
    let mut config = PassthroughStepConfig::default();
    config.transform_request = Some(RequestTransform {
        replace_host: Some(format!("127.0.0.1:{}", upstream_port)),
        ..Default::default()
    });
    config
}

/// Echo server speaking real RFC 6455, mirroring the first offered
/// subprotocol.
async fn start_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut selected = None;
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                     mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                        if let Some(protocols) = request
                            .headers()
                            .get("sec-websocket-protocol")
                            .and_then(|v| v.to_str().ok())
                        {
                            if let Some(first) = protocols.split(',').next() {
                                let first = first.trim().to_string();
                                response.headers_mut().insert(
                                    "sec-websocket-protocol",
                                    first.parse().unwrap(),
                                );
                                selected = Some(first);
                            }
                        }
                        Ok(response)
                    },
                )
                .await;
                let Ok(mut ws) = ws else { return };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn frames_are_piped_in_both_directions() {
    let upstream_port = start_echo_upstream().await;

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(upstream_port))
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(
        format!("ws://127.0.0.1:{}/socket", port),
        stream,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("hello through the proxy".to_string()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(
        echoed,
        Message::Text("hello through the proxy".to_string())
    );

    ws.close(None).await.unwrap();
    proxy.stop().await;
}

#[tokio::test]
async fn negotiated_subprotocols_are_mirrored_downstream() {
    let upstream_port = start_echo_upstream().await;

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(upstream_port))
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = http::Request::builder()
        .uri(format!("ws://127.0.0.1:{}/socket", port))
        .header("host", format!("127.0.0.1:{}", port))
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header(
            "sec-websocket-key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("sec-websocket-protocol", "chat, superchat")
        .body(())
        .unwrap();

    let (mut ws, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("chat")
    );

    ws.close(None).await.unwrap();
    proxy.stop().await;
}

#[tokio::test]
async fn upstream_http_rejections_are_mirrored() {
    // An upstream that refuses the upgrade with a plain 401.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 401 Unauthorized\r\nx-reject-reason: nope\r\ncontent-length: 0\r\n\r\n",
                    )
                    .await;
            });
        }
    });

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(upstream_port))
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let result = tokio_tungstenite::client_async(
        format!("ws://127.0.0.1:{}/denied", port),
        stream,
    )
    .await;

    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
            assert_eq!(
                response
                    .headers()
                    .get("x-reject-reason")
                    .and_then(|v| v.to_str().ok()),
                Some("nope")
            );
        }
        other => panic!("expected a mirrored 401, got {:?}", other),
    }

    proxy.stop().await;
}

#[tokio::test]
async fn non_passthrough_rules_answer_upgrades_as_plain_http() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_reply(403, "no sockets here")
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let result = tokio_tungstenite::client_async(
        format!("ws://127.0.0.1:{}/denied", port),
        stream,
    )
    .await;

    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected a 403, got {:?}", other),
    }

    proxy.stop().await;
}
