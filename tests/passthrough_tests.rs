use bytes::Bytes;
use mockproxy::api::{CallbackAction, CallbackResponse};
use mockproxy::prelude::*;
use mockproxy::server::intake::OngoingRequest;
use std::sync::Arc;

mod common;

/// An upstream that answers every request with its own Host header as the
/// body, so tests can observe exactly what arrived.
async fn start_host_echo_upstream() -> MockProxy {
    let upstream = common::start_proxy().await;
    upstream.add_rule(
        RuleBuilder::anything()
            .then_callback(Arc::new(|req: &OngoingRequest| {
                let host = req.header("host").unwrap_or("<none>").to_string();
                Box::pin(async move {
                    Ok(CallbackAction::Response(CallbackResponse {
                        status: 200,
                        status_message: None,
                        headers: None,
                        body: Bytes::from(host),
                    }))
                })
            }))
            .build()
            .unwrap(),
    );
    upstream
}

fn passthrough_to(upstream_port: u16) -> PassthroughStepConfig {
    let mut config = PassthroughStepConfig::default();
    config.transform_request = Some(RequestTransform {
        replace_host: Some(format!("127.0.0.1:{}", upstream_port)),
        ..Default::default()
    });
    config
}

#[tokio::test]
async fn replace_host_updates_the_host_header_by_default() {
    let upstream = start_host_echo_upstream().await;
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(upstream_port))
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/any", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        format!("127.0.0.1:{}", upstream_port)
    );

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn custom_host_header_values_are_sent_verbatim() {
    let upstream = start_host_echo_upstream().await;
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    let mut config = passthrough_to(upstream_port);
    config.transform_request.as_mut().unwrap().update_host_header =
        UpdateHostHeader::Custom("spoofed.test".to_string());
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(config)
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/any", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "spoofed.test");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn response_match_replace_corrects_content_length() {
    let upstream = common::start_proxy().await;
    upstream.add_rule(
        RuleBuilder::anything()
            .then_reply(200, "foobarfoo")
            .build()
            .unwrap(),
    );
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    let mut config = passthrough_to(upstream_port);
    config.transform_response = Some(ResponseTransform {
        match_replace_body: vec![MatchReplacePair::literal("foo", "bar")],
        ..Default::default()
    });
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(config)
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/body", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok()),
        Some("9")
    );
    // Only the first occurrence is replaced per pair.
    assert_eq!(response.text().await.unwrap(), "barbarfoo");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn request_json_bodies_can_be_merged() {
    let upstream = common::start_proxy().await;
    upstream.add_rule(
        RuleBuilder::anything()
            .then_callback(Arc::new(|req: &OngoingRequest| {
                Box::pin(async move {
                    let body = req
                        .decoded_body()
                        .await
                        .map_err(|err| err.to_string())?;
                    Ok(CallbackAction::Response(CallbackResponse {
                        status: 200,
                        status_message: None,
                        headers: None,
                        body,
                    }))
                })
            }))
            .build()
            .unwrap(),
    );
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    let mut config = passthrough_to(upstream_port);
    config
        .transform_request
        .as_mut()
        .unwrap()
        .update_json_body = Some(serde_json::json!({"added": true, "drop": null}));
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(config)
            .build()
            .unwrap(),
    );

    let client = common::http_client();
    let response = client
        .post(format!("{}/merge", proxy.url().unwrap()))
        .body(r#"{"kept":1,"drop":2}"#)
        .send()
        .await
        .unwrap();

    let value: serde_json::Value = response.json().await.unwrap();
    assert_eq!(value, serde_json::json!({"kept": 1, "added": true}));

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn unreachable_upstreams_produce_a_502_by_default() {
    let proxy = common::start_proxy().await;
    // Port 9 (discard) is reliably closed.
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(9))
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/down", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(
        body.contains("Error communicating with upstream server"),
        "got: {}",
        body
    );

    proxy.stop().await;
}

#[tokio::test]
async fn simulated_connection_errors_reset_the_downstream_socket() {
    let proxy = common::start_proxy().await;
    let mut config = passthrough_to(9);
    config.simulate_connection_errors = true;
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(config)
            .build()
            .unwrap(),
    );

    let result = reqwest::get(format!("{}/down", proxy.url().unwrap())).await;

    // No HTTP response at all; the connection dies underneath the client.
    assert!(result.is_err());

    proxy.stop().await;
}

#[tokio::test]
async fn forwarding_to_ourselves_is_detected_as_a_loop() {
    let proxy = common::start_proxy().await;
    let own_port = proxy.port().unwrap();
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(passthrough_to(own_port))
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/loop", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("loop"), "got: {}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn before_response_hooks_can_override_the_response() {
    let upstream = common::start_proxy().await;
    upstream.add_rule(
        RuleBuilder::anything()
            .then_reply(200, "original")
            .build()
            .unwrap(),
    );
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    let hooks = mockproxy::server::passthrough::PassthroughHooks {
        before_request: None,
        before_response: Some(Arc::new(|summary| {
            Box::pin(async move {
                assert_eq!(summary.status, 200);
                Ok(
                    mockproxy::server::passthrough::BeforeResponseAction::Override(
                        mockproxy::server::passthrough::ResponseOverride {
                            status: Some(418),
                            headers: None,
                            body: Some(Bytes::from_static(b"overridden")),
                        },
                    ),
                )
            })
        })),
    };
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with_hooks(passthrough_to(upstream_port), hooks)
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/hooked", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), 418);
    assert_eq!(response.text().await.unwrap(), "overridden");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn https_upstreams_can_be_reached_with_relaxed_verification() {
    // The upstream proxy terminates TLS with a throwaway CA we do not
    // trust, so the passthrough must be told to ignore certificate errors.
    let upstream = common::start_proxy().await;
    upstream.add_rule(
        RuleBuilder::anything()
            .then_reply(200, "secure ok")
            .build()
            .unwrap(),
    );
    let upstream_port = upstream.port().unwrap();

    let proxy = common::start_proxy().await;
    let mut config = passthrough_to(upstream_port);
    config.transform_request.as_mut().unwrap().set_protocol = Some("https".to_string());
    config.ignore_host_https_errors = IgnoreHttpsErrors::All(true);
    proxy.add_rule(
        RuleBuilder::anything()
            .then_passthrough_with(config)
            .build()
            .unwrap(),
    );

    let response = reqwest::get(format!("{}/tls", proxy.url().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secure ok");

    proxy.stop().await;
    upstream.stop().await;
}
