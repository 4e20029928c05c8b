use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::common::util;
use crate::server::events::{Event, PassthroughAbortSnapshot};
use crate::server::intake::{OngoingRequest, ProxyResponse, ResponseBody};
use crate::server::passthrough::{self, agent, PassthroughOptions};
use crate::server::rules::steps::{Step, StepContext, StepOutcome};
use crate::server::rules::Rule;

/// True when a request asks for an RFC 6455 upgrade.
pub fn is_upgrade_request<B>(req: &http::Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Runs a rule's steps for an upgrade request. Continuing steps behave as
/// usual; a passthrough step switches to the WebSocket pipe, and any other
/// terminal step answers the upgrade request as plain HTTP.
pub async fn run_upgrade_steps(
    rule: &Rule,
    req: &OngoingRequest,
    ctx: &StepContext,
    on_upgrade: hyper::upgrade::OnUpgrade,
) -> StepOutcome {
    let mut on_upgrade = Some(on_upgrade);
    for step in rule.steps() {
        if let Some(options) = step.passthrough_options() {
            let Some(upgrade) = on_upgrade.take() else {
                break;
            };
            return passthrough_websocket(req, upgrade, &options, ctx).await;
        }
        match step.handle(req, ctx).await {
            Ok(StepOutcome::Continue) => continue,
            Ok(outcome) => return outcome,
            Err(err) => {
                log::warn!("rule step failed during upgrade: {}", err);
                return StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                        .with_body(err.to_string()),
                );
            }
        }
    }
    StepOutcome::Respond(
        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_body("rule completed without a terminal step"),
    )
}

/// RFC 2616 token check for subprotocol entries.
fn is_valid_protocol_token(token: &str) -> bool {
    !token.is_empty()
        && token.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

/// Cleans the downstream subprotocol offer: empty or invalid entries are
/// stripped; if nothing survives the header is omitted entirely.
fn clean_subprotocols(req: &OngoingRequest) -> Option<String> {
    let offered: Vec<&str> = util::find_header_values(&req.raw_headers, "sec-websocket-protocol")
        .flat_map(|value| value.split(','))
        .map(|entry| entry.trim())
        .filter(|entry| is_valid_protocol_token(entry))
        .collect();
    if offered.is_empty() {
        None
    } else {
        Some(offered.join(", "))
    }
}

/// Headers managed by the WebSocket handshake itself and never mirrored.
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "proxy-connection",
    "keep-alive",
];

/// Dials the upstream WebSocket, mirrors the negotiation, and pipes frames
/// both ways once the downstream upgrade completes.
pub async fn passthrough_websocket(
    req: &OngoingRequest,
    on_upgrade: hyper::upgrade::OnUpgrade,
    options: &Arc<PassthroughOptions>,
    ctx: &StepContext,
) -> StepOutcome {
    let simulate = options.config.simulate_connection_errors;

    let plan = match passthrough::build_plan(req, options) {
        Ok(plan) => plan,
        Err(message) => {
            return StepOutcome::Respond(
                ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message),
            )
        }
    };

    let tls_options = agent::TlsOptions {
        ignore_errors: options
            .config
            .ignore_host_https_errors
            .covers(&plan.hostname, plan.port),
        trusted_cas: options.config.trusted_cas.clone(),
        additional_cas: options
            .config
            .additional_trusted_cas
            .clone()
            .unwrap_or_default(),
        offer_h2: false,
    };

    let resolver = options.resolver(&ctx.dns);
    let dialed = match agent::dial(
        &plan.hostname,
        plan.port,
        plan.https,
        false,
        plan.proxy.as_ref(),
        &tls_options,
        &resolver,
        &ctx.agents,
    )
    .await
    {
        Ok(dialed) => dialed,
        Err(err) => {
            log::warn!("websocket upstream dial failed: {}", err);
            emit_ws_abort(ctx, req, err.code(), err.to_string());
            return if simulate {
                StepOutcome::Reset
            } else {
                StepOutcome::Close
            };
        }
    };
    options.record_socket(dialed.local_port);

    let upstream_request = match build_upstream_ws_request(req, &plan) {
        Ok(request) => request,
        Err(message) => {
            return StepOutcome::Respond(
                ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message),
            )
        }
    };

    let (upstream, upstream_response) =
        match tokio_tungstenite::client_async(upstream_request, dialed.io).await {
            Ok(established) => established,
            Err(tokio_tungstenite::tungstenite::Error::Http(rejection)) => {
                // The upstream answered the upgrade with a plain HTTP
                // response; mirror it verbatim.
                let status = rejection.status();
                let headers = rejection
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();
                let body = rejection
                    .into_body()
                    .map(bytes::Bytes::from)
                    .unwrap_or_default();
                return StepOutcome::Respond(ProxyResponse {
                    status,
                    status_message: None,
                    headers,
                    body: ResponseBody::Full(body),
                    trailers: None,
                });
            }
            Err(err) => {
                log::warn!("websocket upstream handshake failed: {}", err);
                emit_ws_abort(ctx, req, "EWSHANDSHAKE".to_string(), err.to_string());
                return if simulate {
                    StepOutcome::Reset
                } else {
                    StepOutcome::Close
                };
            }
        };

    // Only now that the upstream accepted do we complete the downstream
    // upgrade, mirroring the subprotocol the upstream picked.
    let selected_protocol = upstream_response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let Some(key) = req.header("sec-websocket-key").map(|v| v.to_string()) else {
        return StepOutcome::Respond(
            ProxyResponse::new(StatusCode::BAD_REQUEST)
                .with_body("missing Sec-WebSocket-Key header"),
        );
    };

    let request_id = req.id;
    let events = ctx.events.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let downstream = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                pipe_frames(downstream, upstream).await;
            }
            Err(err) => {
                log::warn!("downstream websocket upgrade failed: {}", err);
                events.emit(Event::PassthroughAbort(PassthroughAbortSnapshot {
                    id: request_id,
                    error_code: "EWSUPGRADE".to_string(),
                    message: err.to_string(),
                    tags: vec!["passthrough-error:EWSUPGRADE".to_string()],
                }));
            }
        }
    });

    let mut response = ProxyResponse::new(StatusCode::SWITCHING_PROTOCOLS)
        .with_header("upgrade", "websocket")
        .with_header("connection", "Upgrade")
        .with_header("sec-websocket-accept", &derive_accept_key(key.as_bytes()));
    if let Some(protocol) = selected_protocol {
        response = response.with_header("sec-websocket-protocol", &protocol);
    }
    StepOutcome::Respond(response)
}

fn emit_ws_abort(ctx: &StepContext, req: &OngoingRequest, code: String, message: String) {
    ctx.events
        .emit(Event::PassthroughAbort(PassthroughAbortSnapshot {
            id: req.id,
            tags: vec![format!("passthrough-error:{}", code)],
            error_code: code,
            message,
        }));
}

fn build_upstream_ws_request(
    req: &OngoingRequest,
    plan: &passthrough::UpstreamPlan,
) -> Result<http::Request<()>, String> {
    let scheme = if plan.https { "wss" } else { "ws" };
    let mut target = plan.url.clone();
    target
        .set_scheme(scheme)
        .map_err(|_| format!("cannot build {} URL for upstream websocket", scheme))?;

    let host_value = match &plan.host_header {
        passthrough::transform::HostHeaderAction::Set(value) => value.clone(),
        passthrough::transform::HostHeaderAction::Keep => req
            .header("host")
            .map(|v| v.to_string())
            .unwrap_or_else(|| {
                util::format_host_header(&plan.hostname, plan.port, plan.url.scheme())
            }),
    };

    let mut builder = http::Request::builder()
        .method(http::Method::GET)
        .uri(target.as_str())
        .header("host", host_value)
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header(
            "sec-websocket-key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        );

    if let Some(protocols) = clean_subprotocols(req) {
        builder = builder.header("sec-websocket-protocol", protocols);
    }

    for (name, value) in &req.raw_headers {
        let lowered = name.to_ascii_lowercase();
        if HANDSHAKE_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(())
        .map_err(|err| format!("cannot build upstream websocket request: {}", err))
}

/// Replaces close codes that are invalid on the wire with a clean 1011.
fn sanitize_close(frame: Option<CloseFrame<'_>>) -> Option<CloseFrame<'static>> {
    frame.map(|frame| {
        if frame.code.is_allowed() {
            CloseFrame {
                code: frame.code,
                reason: frame.reason.into_owned().into(),
            }
        } else {
            log::debug!("translating invalid close code {:?} to 1011", frame.code);
            CloseFrame {
                code: CloseCode::Error,
                reason: "".into(),
            }
        }
    })
}

async fn pipe_frames<D, U>(downstream: WebSocketStream<D>, upstream: WebSocketStream<U>)
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut down_sink, mut down_stream) = downstream.split();
    let (mut up_sink, mut up_stream) = upstream.split();

    let client_to_server = async {
        while let Some(message) = down_stream.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    let _ = up_sink.send(Message::Close(sanitize_close(frame))).await;
                    break;
                }
                Ok(message) => {
                    if up_sink.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("downstream websocket error: {}", err);
                    let _ = up_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    };

    let server_to_client = async {
        while let Some(message) = up_stream.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    let _ = down_sink.send(Message::Close(sanitize_close(frame))).await;
                    break;
                }
                Ok(message) => {
                    if down_sink.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("upstream websocket error: {}", err);
                    let _ = down_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    };

    tokio::join!(client_to_server, server_to_client);
    log::trace!("websocket pipe finished");
}
