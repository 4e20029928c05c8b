pub mod agent;
pub mod dns;
pub mod transform;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::data::{PassthroughStepConfig, ProxyConfig, ProxySetting};
use crate::common::util;
use crate::server::events::{Event, EventBus, PassthroughAbortSnapshot};
use crate::server::intake::{BodySource, OngoingRequest, ProxyResponse, ResponseBody};
use crate::server::rules::steps::{StepContext, StepOutcome};

use agent::{AgentCache, OutBody, PoolKey, PooledConn, TlsOptions, UpstreamSender};
use dns::CachingResolver;
use transform::HostHeaderAction;

/// Summary handed to a `before_response` hook. The body is fully buffered by
/// the time the hook runs.
pub struct ResponseSummary {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct ResponseOverride {
    pub status: Option<u16>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<Bytes>,
}

pub enum BeforeResponseAction {
    Continue,
    Close,
    Reset,
    Override(ResponseOverride),
}

pub type BeforeResponseCallback = Arc<
    dyn Fn(ResponseSummary) -> BoxFuture<'static, Result<BeforeResponseAction, String>>
        + Send
        + Sync,
>;

/// Summary handed to a `before_request` hook, before the upstream exchange.
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

pub struct RequestOverride {
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<Bytes>,
}

pub enum BeforeRequestAction {
    Continue,
    Close,
    Reset,
    Override(RequestOverride),
}

pub type BeforeRequestCallback = Arc<
    dyn Fn(RequestSummary) -> BoxFuture<'static, Result<BeforeRequestAction, String>>
        + Send
        + Sync,
>;

#[derive(Default, Clone)]
pub struct PassthroughHooks {
    pub before_request: Option<BeforeRequestCallback>,
    pub before_response: Option<BeforeResponseCallback>,
}

/// Everything one passthrough step owns: its configuration, hooks, the
/// loop-detection socket set and (optionally) a dedicated resolver.
pub struct PassthroughOptions {
    pub config: PassthroughStepConfig,
    pub hooks: PassthroughHooks,
    sockets: Mutex<HashSet<u16>>,
    resolver: OnceLock<Arc<CachingResolver>>,
}

impl PassthroughOptions {
    pub fn from_config(config: PassthroughStepConfig) -> Self {
        PassthroughOptions {
            config,
            hooks: PassthroughHooks::default(),
            sockets: Mutex::new(HashSet::new()),
            resolver: OnceLock::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: PassthroughHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Fails fast on configurations the engine cannot honour: PAC proxies,
    /// unknown proxy schemes, contradictory trust settings.
    pub fn validate(&self) -> Result<(), agent::Error> {
        if self.config.trusted_cas.is_some() && self.config.additional_trusted_cas.is_some() {
            return Err(agent::Error::ProxyUnsupported(
                "trustedCAs and additionalTrustedCAs are mutually exclusive".to_string(),
            ));
        }
        if let Some(proxy) = &self.config.proxy {
            validate_proxy_config(proxy)?;
        }
        Ok(())
    }

    pub(crate) fn resolver(&self, default: &Arc<CachingResolver>) -> Arc<CachingResolver> {
        match &self.config.dns {
            Some(dns_config) => self
                .resolver
                .get_or_init(|| Arc::new(CachingResolver::from_config(dns_config)))
                .clone(),
            None => default.clone(),
        }
    }

    pub(crate) fn record_socket(&self, local_port: u16) {
        self.sockets.lock().unwrap().insert(local_port);
    }

    pub(crate) fn owns_port(&self, port: u16) -> bool {
        self.sockets.lock().unwrap().contains(&port)
    }
}

fn validate_proxy_config(config: &ProxyConfig) -> Result<(), agent::Error> {
    match config {
        ProxyConfig::Setting(setting) => agent::validate_proxy_setting(setting),
        ProxyConfig::Callback(_) => Ok(()),
        ProxyConfig::List(entries) => entries.iter().try_for_each(validate_proxy_config),
    }
}

/// IETF-registered HTTP/2 error code names, for GOAWAY/RST_STREAM tagging.
fn h2_error_code_name(code: u32) -> &'static str {
    match code {
        0x0 => "NO_ERROR",
        0x1 => "PROTOCOL_ERROR",
        0x2 => "INTERNAL_ERROR",
        0x3 => "FLOW_CONTROL_ERROR",
        0x4 => "SETTINGS_TIMEOUT",
        0x5 => "STREAM_CLOSED",
        0x6 => "FRAME_SIZE_ERROR",
        0x7 => "REFUSED_STREAM",
        0x8 => "CANCEL",
        0x9 => "COMPRESSION_ERROR",
        0xa => "CONNECT_ERROR",
        0xb => "ENHANCE_YOUR_CALM",
        0xc => "INADEQUATE_SECURITY",
        0xd => "HTTP_1_1_REQUIRED",
        _ => "UNKNOWN",
    }
}

/// Digs an h2 reason code out of a hyper error chain, if there is one.
fn h2_reason(err: &hyper::Error) -> Option<u32> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(h2_err) = current.downcast_ref::<h2::Error>() {
            return h2_err.reason().map(|reason| reason.into());
        }
        source = current.source();
    }
    None
}

fn abort_snapshot(req: &OngoingRequest, code: String, message: String) -> PassthroughAbortSnapshot {
    PassthroughAbortSnapshot {
        id: req.id,
        tags: vec![format!("passthrough-error:{}", code)],
        error_code: code,
        message,
    }
}

fn emit_dial_abort(events: &EventBus, req: &OngoingRequest, err: &agent::Error) {
    let mut snapshot = abort_snapshot(req, err.code(), err.to_string());
    if let Some(name) = err.tls_error_name() {
        snapshot.tags.push(format!("passthrough-tls-error:{}", name));
    }
    events.emit(Event::PassthroughAbort(snapshot));
}

fn emit_send_abort(events: &EventBus, req: &OngoingRequest, err: &hyper::Error) {
    let code = match h2_reason(err) {
        Some(reason) => format!("H2_{}", h2_error_code_name(reason)),
        None => "ECONNRESET".to_string(),
    };
    events.emit(Event::PassthroughAbort(abort_snapshot(
        req,
        code,
        err.to_string(),
    )));
}

/// Maps an upstream failure that happened before any bytes reached the
/// client: 502 by default, a downstream reset when the rule asked to
/// simulate connection errors.
fn upstream_failure(simulate: bool, message: String) -> StepOutcome {
    if simulate {
        StepOutcome::Reset
    } else {
        StepOutcome::Respond(
            ProxyResponse::new(StatusCode::BAD_GATEWAY)
                .with_header("content-type", "text/plain")
                .with_body(format!("Error communicating with upstream server: {}", message)),
        )
    }
}

/// Response body wrapper that reports a mid-stream upstream failure exactly
/// once before surfacing it downstream.
struct TapBody {
    inner: OutBody,
    events: Arc<EventBus>,
    request_id: uuid::Uuid,
    reported: AtomicBool,
}

impl hyper::body::Body for TapBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        let poll = std::pin::Pin::new(&mut this.inner).poll_frame(cx);
        if let std::task::Poll::Ready(Some(Err(err))) = &poll {
            if !this.reported.swap(true, Ordering::SeqCst) {
                let code = match h2_reason(err) {
                    Some(reason) => format!("H2_{}", h2_error_code_name(reason)),
                    None => "ECONNRESET".to_string(),
                };
                this.events
                    .emit(Event::PassthroughAbort(PassthroughAbortSnapshot {
                        id: this.request_id,
                        error_code: code.clone(),
                        message: err.to_string(),
                        tags: vec![format!("passthrough-error:{}", code)],
                    }));
            }
        }
        poll
    }
}

pub(crate) struct UpstreamPlan {
    pub(crate) url: url::Url,
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) https: bool,
    pub(crate) host_header: HostHeaderAction,
    pub(crate) proxy: Option<ProxySetting>,
    pub(crate) try_h2: bool,
}

/// Executes a passthrough step end to end. Every early failure is mapped to
/// the configured failure policy, and at most one `passthrough-abort` event
/// fires per upstream error.
pub async fn execute(
    req: &OngoingRequest,
    options: &PassthroughOptions,
    ctx: &StepContext,
) -> StepOutcome {
    let simulate = options.config.simulate_connection_errors;

    // A request arriving from one of our own outgoing sockets means a rule
    // is forwarding to this proxy itself.
    if let Some(peer) = req.peer_addr {
        if peer.ip().is_loopback() && options.owns_port(peer.port()) {
            let err = agent::Error::LoopDetected;
            log::warn!("{}", err);
            emit_dial_abort(&ctx.events, req, &err);
            return upstream_failure(simulate, err.to_string());
        }
    }

    let plan = match build_plan(req, options) {
        Ok(plan) => plan,
        Err(message) => {
            log::warn!("cannot resolve passthrough destination: {}", message);
            return StepOutcome::Respond(
                ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message),
            );
        }
    };

    // Spec'd loop guard: connecting straight back to a port one of our own
    // sockets owns on this machine.
    if util::is_localhost(&plan.hostname) && options.owns_port(plan.port) {
        let err = agent::Error::LoopDetected;
        emit_dial_abort(&ctx.events, req, &err);
        return upstream_failure(simulate, err.to_string());
    }

    let resolver = options.resolver(&ctx.dns);

    let tls_options = TlsOptions {
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
        offer_h2: plan.try_h2,
    };

    let pool_key = PoolKey {
        scheme: if plan.https { "https" } else { "http" },
        hostname: plan.hostname.clone(),
        port: plan.port,
        proxy: plan.proxy.as_ref().map(|p| p.proxy_url.clone()),
        h2: plan.try_h2,
    };

    // Plaintext through an HTTP proxy goes out in absolute form rather than
    // through a CONNECT tunnel; this holds for pooled connections too.
    let absolute_form = !plan.https
        && plan
            .proxy
            .as_ref()
            .map(|setting| setting.proxy_url.starts_with("http"))
            .unwrap_or(false);

    let (mut sender, local_port, reusable) = match req
        .keep_alive
        .then(|| ctx.agents.checkout(&pool_key))
        .flatten()
    {
        Some(pooled) => (pooled.sender, pooled.local_port, true),
        None => {
            let dialed = match agent::dial(
                &plan.hostname,
                plan.port,
                plan.https,
                plan.try_h2,
                plan.proxy.as_ref(),
                &tls_options,
                &resolver,
                &ctx.agents,
            )
            .await
            {
                Ok(dialed) => dialed,
                Err(err) => {
                    log::warn!("upstream dial failed: {}", err);
                    emit_dial_abort(&ctx.events, req, &err);
                    return upstream_failure(simulate, err.to_string());
                }
            };
            options.record_socket(dialed.local_port);

            let use_h2 = plan.try_h2 && dialed.negotiated_h2;
            match agent::handshake(dialed.io, use_h2).await {
                Ok(sender) => (sender, dialed.local_port, req.keep_alive),
                Err(err) => {
                    log::warn!("upstream handshake failed: {}", err);
                    emit_dial_abort(&ctx.events, req, &err);
                    return upstream_failure(simulate, err.to_string());
                }
            }
        }
    };

    let upstream_request =
        match build_upstream_request(req, options, &plan, sender.is_h2(), absolute_form).await {
            Ok(Some(request)) => request,
            Ok(None) => return StepOutcome::Close,
            Err(outcome) => return outcome,
        };

    if let Err(err) = sender.ready().await {
        emit_send_abort(&ctx.events, req, &err);
        return upstream_failure(simulate, err.to_string());
    }

    let response = match sender.send_request(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("upstream request failed: {}", err);
            emit_send_abort(&ctx.events, req, &err);
            return upstream_failure(simulate, err.to_string());
        }
    };

    if reusable {
        ctx.agents.checkin(
            pool_key,
            PooledConn {
                sender,
                local_port,
            },
        );
    }

    build_downstream_response(req, options, ctx, response, simulate).await
}

pub(crate) fn build_plan(
    req: &OngoingRequest,
    options: &PassthroughOptions,
) -> Result<UpstreamPlan, String> {
    let resolved = transform::resolve_destination(
        &req.url,
        options.config.transform_request.as_ref(),
    )
    .map_err(|err| err.to_string())?;

    let mut hostname = resolved
        .url
        .host_str()
        .ok_or_else(|| "effective URL has no host".to_string())?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = resolved
        .url
        .port()
        .unwrap_or_else(|| util::default_port(resolved.url.scheme()));

    // A containerised client pointing at "localhost" means *its* localhost,
    // not ours: rewrite to the peer's address.
    if let Some(peer) = req.peer_addr {
        if util::is_localhost(&hostname) && !peer.ip().is_loopback() {
            log::debug!(
                "rewriting localhost target to client address {} for {}",
                peer.ip(),
                req.id
            );
            hostname = peer.ip().to_string();
        }
    }

    let https = resolved.url.scheme() == "https";
    let proxy = options
        .config
        .proxy
        .as_ref()
        .and_then(|config| config.resolve(&hostname, port));

    // H2 is only attempted against TLS upstreams, and only when the client
    // itself spoke H2; H2C upstream is never attempted.
    let try_h2 = req.version == Version::HTTP_2 && https;

    Ok(UpstreamPlan {
        url: resolved.url,
        hostname,
        port,
        https,
        host_header: resolved.host_header,
        proxy,
        try_h2,
    })
}

/// Hop-by-hop headers never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "upgrade",
    "proxy-authorization",
];

async fn build_upstream_request(
    req: &OngoingRequest,
    options: &PassthroughOptions,
    plan: &UpstreamPlan,
    h2_upstream: bool,
    absolute_form: bool,
) -> Result<Option<http::Request<OutBody>>, StepOutcome> {
    let mut headers = req.raw_headers.clone();
    for name in HOP_BY_HOP {
        util::remove_header(&mut headers, name);
    }

    // Host tracking: regenerate unless the user explicitly pinned it. A
    // pinned value that contradicts the effective URL is honoured, loudly.
    let url_host = util::format_host_header(&plan.hostname, plan.port, plan.url.scheme());
    match &plan.host_header {
        HostHeaderAction::Set(value) => util::set_header(&mut headers, "host", value),
        HostHeaderAction::Keep => match util::find_header(&headers, "host") {
            None => headers.insert(0, ("host".to_string(), url_host)),
            Some(existing) if existing != url_host && existing != plan.hostname => {
                log::warn!(
                    "host header {:?} contradicts the effective URL host {:?}; sending it anyway",
                    existing,
                    url_host
                );
            }
            Some(_) => {}
        },
    }

    let transform = options.config.transform_request.as_ref();
    if let Some(transform) = transform {
        let replaced_wholesale = transform::apply_header_transform(
            &mut headers,
            &transform.update_headers,
            &transform.replace_headers,
        );
        if replaced_wholesale && util::find_header(&headers, "host").is_none() {
            log::warn!("replacement headers dropped the host header; restoring from the URL");
            let value =
                util::format_host_header(&plan.hostname, plan.port, plan.url.scheme());
            headers.insert(0, ("host".to_string(), value));
        }
    }

    // Decide the body: transformed bodies are buffered, untouched bodies
    // stream straight through.
    let has_body_transform = transform.map(|t| t.has_body_transform()).unwrap_or(false)
        || options.hooks.before_request.is_some();

    let body: OutBody = if has_body_transform {
        let decoded = match req.decoded_body().await {
            Ok(decoded) => decoded,
            Err(err) => {
                return Err(StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                        .with_body(format!("cannot read request body: {}", err)),
                ))
            }
        };

        let mut body = decoded;
        if let Some(transform) = transform {
            body = match transform::apply_body_transform(body, &transform.body_spec()).await {
                Ok(body) => body,
                Err(err) => {
                    return Err(StepOutcome::Respond(
                        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                            .with_body(err.to_string()),
                    ))
                }
            };
        }

        if let Some(hook) = &options.hooks.before_request {
            let summary = RequestSummary {
                method: req.method.to_string(),
                url: plan.url.to_string(),
                headers: headers.clone(),
            };
            match hook(summary).await {
                Ok(BeforeRequestAction::Continue) => {}
                Ok(BeforeRequestAction::Close) => return Ok(None),
                Ok(BeforeRequestAction::Reset) => return Err(StepOutcome::Reset),
                Ok(BeforeRequestAction::Override(overrides)) => {
                    if let Some(new_headers) = overrides.headers {
                        headers = new_headers;
                    }
                    if let Some(new_body) = overrides.body {
                        body = new_body;
                    }
                }
                Err(message) => {
                    return Err(StepOutcome::Respond(
                        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message),
                    ))
                }
            }
        }

        // Re-encode to whatever encoding the effective headers declare and
        // correct the framing for the new length.
        let encoding = util::find_header(&headers, "content-encoding").map(|v| v.to_string());
        let encoded = match util::encode_body(encoding.as_deref(), &body) {
            Ok(encoded) => encoded,
            Err(err) => {
                return Err(StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                        .with_body(err.to_string()),
                ))
            }
        };

        util::remove_header(&mut headers, "transfer-encoding");
        if let Some(warning) =
            transform::fix_framing(&mut headers, encoded.len() as u64, h2_upstream, false)
        {
            log::warn!("{}", warning);
        }

        match req.body.buffered_trailers().cloned() {
            Some(trailers) if !h2_upstream => Full::new(encoded)
                .with_trailers(async move { Some(Ok(trailers)) })
                .map_err(|never| match never {})
                .boxed(),
            _ => Full::new(encoded).map_err(|never| match never {}).boxed(),
        }
    } else {
        match req.body.take().await {
            Ok(BodySource::Stream(incoming)) => incoming.boxed(),
            Ok(BodySource::Buffered(bytes)) => {
                // A matcher buffered the body earlier; forward the buffered
                // copy with corrected framing.
                util::remove_header(&mut headers, "transfer-encoding");
                if let Some(warning) =
                    transform::fix_framing(&mut headers, bytes.len() as u64, h2_upstream, false)
                {
                    log::warn!("{}", warning);
                }
                match req.body.buffered_trailers().cloned() {
                    Some(trailers) if !h2_upstream => Full::new(bytes)
                        .with_trailers(async move { Some(Ok(trailers)) })
                        .map_err(|never| match never {})
                        .boxed(),
                    _ => Full::new(bytes).map_err(|never| match never {}).boxed(),
                }
            }
            Err(err) => {
                return Err(StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                        .with_body(format!("request body unavailable: {}", err)),
                ))
            }
        }
    };

    // URI form depends on the upstream channel: absolute for H2 (hyper
    // derives :scheme/:authority from it) and for plaintext-via-HTTP-proxy,
    // origin-form otherwise.
    let uri: http::Uri = if h2_upstream || absolute_form {
        let mut authority_url = plan.url.clone();
        if h2_upstream {
            // :authority mirrors the effective host header.
            if let HostHeaderAction::Set(value) = &plan.host_header {
                let (host, port) = util::split_host_port(value);
                let _ = authority_url.set_host(Some(&host));
                let _ = authority_url.set_port(port);
            }
        }
        authority_url
            .as_str()
            .parse()
            .map_err(|err| internal_error(format!("invalid upstream URL: {}", err)))?
    } else {
        let mut origin_form = plan.url.path().to_string();
        if let Some(query) = plan.url.query() {
            origin_form.push('?');
            origin_form.push_str(query);
        }
        origin_form
            .parse()
            .map_err(|err| internal_error(format!("invalid upstream path: {}", err)))?
    };

    let mut builder = http::Request::builder().method(req.method.clone()).uri(uri);
    builder = builder.version(if h2_upstream {
        Version::HTTP_2
    } else {
        Version::HTTP_11
    });

    let mut request = builder
        .body(body)
        .map_err(|err| internal_error(format!("cannot build upstream request: {}", err)))?;

    // Preserve wire order and (via the original extensions and hyper's
    // preserve_header_case) the original casing of untouched headers.
    *request.extensions_mut() = req.take_extensions();
    let header_map = request.headers_mut();
    for (name, value) in &headers {
        // H2 carries the authority as a pseudo-header and forbids
        // connection-level framing headers.
        if h2_upstream
            && (name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        match (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                header_map.append(name, value);
            }
            _ => log::warn!("dropping invalid header {:?} on upstream request", name),
        }
    }

    Ok(Some(request))
}

fn internal_error(message: String) -> StepOutcome {
    StepOutcome::Respond(ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message))
}

async fn build_downstream_response(
    req: &OngoingRequest,
    options: &PassthroughOptions,
    ctx: &StepContext,
    response: http::Response<Incoming>,
    simulate: bool,
) -> StepOutcome {
    let status = response.status();
    let mut headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    // Connection-level headers are never mirrored; they describe the
    // upstream link, not ours.
    for name in ["connection", "keep-alive", "proxy-connection", "upgrade"] {
        util::remove_header(&mut headers, name);
    }

    let downstream_h2 = req.version == Version::HTTP_2;
    if downstream_h2 {
        util::remove_header(&mut headers, "transfer-encoding");
    }
    let is_head = req.method == http::Method::HEAD;
    let response_transform = options
        .config
        .transform_response
        .as_ref()
        .filter(|t| !t.is_noop());

    let must_buffer = response_transform.is_some() || options.hooks.before_response.is_some();

    if !must_buffer {
        // Plain mirroring: stream the body (trailer frames included) and
        // report mid-stream failures exactly once.
        let body = TapBody {
            inner: response.into_body().boxed(),
            events: ctx.events.clone(),
            request_id: req.id,
            reported: AtomicBool::new(false),
        };
        return StepOutcome::Respond(ProxyResponse {
            status,
            status_message: None,
            headers,
            body: ResponseBody::Boxed(body.boxed()),
            trailers: None,
        });
    }

    // Buffering path: hooks or transforms need the whole body.
    let collected = match response.into_body().collect().await {
        Ok(collected) => collected,
        Err(err) => {
            emit_send_abort(&ctx.events, req, &err);
            return upstream_failure(simulate, err.to_string());
        }
    };
    let trailers = collected.trailers().cloned();
    let raw_body = collected.to_bytes();

    let mut status = status;
    let mut body = raw_body;

    if let Some(hook) = &options.hooks.before_response {
        let summary = ResponseSummary {
            status: status.as_u16(),
            headers: headers.clone(),
            body: body.clone(),
        };
        match hook(summary).await {
            Ok(BeforeResponseAction::Continue) => {}
            Ok(BeforeResponseAction::Close) => {
                ctx.events
                    .emit(Event::PassthroughAbort(PassthroughAbortSnapshot {
                        id: req.id,
                        error_code: "E_RULE_BRESP_CLOSE".to_string(),
                        message: "beforeResponse callback closed the connection".to_string(),
                        tags: vec!["passthrough-error:E_RULE_BRESP_CLOSE".to_string()],
                    }));
                return StepOutcome::Close;
            }
            Ok(BeforeResponseAction::Reset) => {
                ctx.events
                    .emit(Event::PassthroughAbort(PassthroughAbortSnapshot {
                        id: req.id,
                        error_code: "E_RULE_BRESP_RESET".to_string(),
                        message: "beforeResponse callback reset the connection".to_string(),
                        tags: vec!["passthrough-error:E_RULE_BRESP_RESET".to_string()],
                    }));
                return StepOutcome::Reset;
            }
            Ok(BeforeResponseAction::Override(overrides)) => {
                if let Some(new_status) = overrides.status {
                    status = StatusCode::from_u16(new_status).unwrap_or(status);
                }
                if let Some(new_headers) = overrides.headers {
                    headers = new_headers;
                }
                if let Some(new_body) = overrides.body {
                    body = new_body;
                }
            }
            Err(message) => {
                return StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR).with_body(message),
                )
            }
        }
    }

    if let Some(transform) = response_transform {
        if let Some(new_status) = transform.set_status {
            status = StatusCode::from_u16(new_status).unwrap_or(status);
        }
        transform::apply_header_transform(
            &mut headers,
            &transform.update_headers,
            &transform.replace_headers,
        );

        if transform.has_body_transform() {
            let encoding = util::find_header(&headers, "content-encoding").map(|v| v.to_string());
            let decoded = match util::decode_body(encoding.as_deref(), &body, usize::MAX) {
                Ok(decoded) => decoded,
                Err(err) => {
                    return StepOutcome::Respond(
                        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                            .with_body(err.to_string()),
                    )
                }
            };
            let transformed =
                match transform::apply_body_transform(decoded, &transform.body_spec()).await {
                    Ok(transformed) => transformed,
                    Err(err) => {
                        return StepOutcome::Respond(
                            ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                                .with_body(err.to_string()),
                        )
                    }
                };
            body = match util::encode_body(encoding.as_deref(), &transformed) {
                Ok(encoded) => encoded,
                Err(err) => {
                    return StepOutcome::Respond(
                        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                            .with_body(err.to_string()),
                    )
                }
            };
        }
    }

    util::remove_header(&mut headers, "transfer-encoding");
    if let Some(warning) = transform::fix_framing(
        &mut headers,
        body.len() as u64,
        downstream_h2,
        is_head,
    ) {
        log::warn!("{}", warning);
    }

    StepOutcome::Respond(ProxyResponse {
        status,
        status_message: None,
        headers,
        body: ResponseBody::Full(body),
        trailers: sanitize_trailers(trailers),
    })
}

/// Drops trailer entries with invalid names or values, warning once each.
fn sanitize_trailers(trailers: Option<HeaderMap>) -> Option<HeaderMap> {
    let trailers = trailers?;
    let mut sanitized = HeaderMap::new();
    for (name, value) in trailers.iter() {
        if value.to_str().is_ok() {
            sanitized.append(name.clone(), value.clone());
        } else {
            log::warn!("dropping invalid trailer {:?}", name);
        }
    }
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}
