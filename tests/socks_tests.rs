use mockproxy::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

async fn socks5_connect_with_metadata(
    port: u16,
    metadata: &[u8],
) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Greeting offering only the custom-metadata method.
    stream.write_all(&[0x05, 0x01, 0xDA]).await.unwrap();
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0xDA]);

    // Length-prefixed metadata blob.
    let mut auth = vec![metadata.len() as u8];
    auth.extend_from_slice(metadata);
    stream.write_all(&auth).await.unwrap();
    let mut auth_reply = [0u8; 2];
    stream.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    // CONNECT tagged.test:80.
    let mut connect = vec![0x05, 0x01, 0x00, 0x03, "tagged.test".len() as u8];
    connect.extend_from_slice(b"tagged.test");
    connect.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&connect).await.unwrap();
    let mut connect_reply = [0u8; 10];
    stream.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00);

    stream
}

#[tokio::test]
async fn socks5_metadata_tags_reach_rule_matching_and_events() {
    let proxy = common::start_proxy().await;
    let mut events = proxy.subscribe();
    proxy.add_rule(
        RuleBuilder::get("/hi")
            .match_tag("ci")
            .then_reply(200, "tagged")
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let mut stream = socks5_connect_with_metadata(port, br#"{"tags":["ci"]}"#).await;

    // Speak plain HTTP through the established tunnel.
    stream
        .write_all(b"GET /hi HTTP/1.1\r\nHost: tagged.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("tagged"), "got: {}", response);

    // The request event carries the connection tag.
    let mut seen_tag = false;
    while let Ok(Ok(event)) = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        events.recv(),
    )
    .await
    {
        if let Event::Request(snapshot) = event {
            assert!(snapshot.tags.contains(&"ci".to_string()));
            seen_tag = true;
            break;
        }
    }
    assert!(seen_tag, "no request event observed");

    proxy.stop().await;
}

#[tokio::test]
async fn socks_tunnel_targets_become_the_request_authority() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/where")
            .match_hostname("tagged.test")
            .then_reply(200, "by authority")
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let mut stream = socks5_connect_with_metadata(port, b"{}").await;

    // Origin-form request without a Host header: the SOCKS CONNECT target
    // provides the authority.
    stream
        .write_all(b"GET /where HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.contains("by authority"), "got: {}", response);

    proxy.stop().await;
}

#[tokio::test]
async fn invalid_socks_metadata_is_rejected_with_the_method_error_code() {
    let proxy = common::start_proxy().await;
    let port = proxy.port().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0xDA]).await.unwrap();
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await.unwrap();

    stream.write_all(&[0x08]).await.unwrap();
    stream.write_all(b"not-json").await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x01]);

    // The server closes after a failed sub-negotiation.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn socks4a_connect_is_accepted() {
    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::get("/v4")
            .then_reply(200, "socks4 ok")
            .build()
            .unwrap(),
    );
    let port = proxy.port().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&80u16.to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]); // SOCKS4a marker
    request.extend_from_slice(b"user\0");
    request.extend_from_slice(b"v4.test\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5A);

    stream
        .write_all(b"GET /v4 HTTP/1.1\r\nHost: v4.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).contains("socks4 ok"));

    proxy.stop().await;
}
