use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::server::events::{ClientErrorSnapshot, Event};
use crate::server::intake::{OngoingRequest, ProxyResponse, ResponseBody};
use crate::server::passthrough::agent::AsyncStream;
use crate::server::rules::steps::{self, StepOutcome};
use crate::server::socks;
use crate::server::websocket;
use crate::server::ServerState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS accept failed: {0}")]
    TlsAccept(String),
    #[error("SOCKS handshake failed: {0}")]
    Socks(#[from] socks::Error),
    #[error("HTTP connection error: {0}")]
    Http(String),
}

/// Raised out of the hyper service when a rule terminated the connection
/// without a response; hyper tears the connection down in reaction.
#[derive(Error, Debug)]
#[error("connection terminated by rule")]
struct AbortedByRule;

/// Handle on the raw socket underlying a (possibly TLS-wrapped, possibly
/// tunneled) connection, used to force closes and RSTs decided deep inside
/// rule handling.
pub struct ConnectionControl {
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
    reset_requested: AtomicBool,
}

impl ConnectionControl {
    pub fn new(stream: &TcpStream) -> Self {
        ConnectionControl {
            #[cfg(unix)]
            fd: {
                use std::os::unix::io::AsRawFd;
                stream.as_raw_fd()
            },
            reset_requested: AtomicBool::new(false),
        }
    }

    /// Arms an RST: SO_LINGER is zeroed so the close that follows (dropping
    /// the hyper connection) resets instead of FIN-closing. The fd is still
    /// owned by the connection task at this point.
    pub fn request_reset(&self) {
        if self.reset_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::io::BorrowedFd;
            let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
            let sock = socket2::SockRef::from(&fd);
            if let Err(err) = sock.set_linger(Some(std::time::Duration::ZERO)) {
                log::warn!("cannot arm connection reset: {}", err);
            }
        }
        #[cfg(not(unix))]
        {
            log::warn!("connection reset requested on a platform without RST support");
        }
    }
}

/// Replays already-read bytes before the wrapped stream, so protocol
/// detection can consume a prefix and hand the full stream onward.
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Rewind {
            prefix: if prefix.is_empty() { None } else { Some(prefix) },
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(prefix) = self.prefix.take() {
            let n = std::cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix[..n]);
            if n < prefix.len() {
                self.prefix = Some(prefix.slice(n..));
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// What the first byte of a connection tells us.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DetectedProtocol {
    Socks,
    Tls,
    Http,
    Unknown,
}

fn detect_protocol(first: u8) -> DetectedProtocol {
    match first {
        0x04 | 0x05 => DetectedProtocol::Socks,
        0x16 => DetectedProtocol::Tls,
        // Printable ASCII starting an HTTP verb, including the "PRI *
        // HTTP/2.0" preface for prior-knowledge HTTP/2.
        b'A'..=b'Z' | b'a'..=b'z' => DetectedProtocol::Http,
        _ => DetectedProtocol::Unknown,
    }
}

/// Per-connection context shared with every request served on it.
struct ConnectionContext {
    state: Arc<ServerState>,
    peer_addr: Option<SocketAddr>,
    tags: Vec<String>,
    scheme: &'static str,
    connect_authority: Option<String>,
    control: Arc<ConnectionControl>,
}

/// Entry point for one accepted TCP connection.
pub async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), Error> {
    log::trace!("new TCP connection from {}", peer_addr);
    let control = Arc::new(ConnectionControl::new(&stream));
    let io: Box<dyn AsyncStream> = Box::new(stream);
    detect_and_serve(state, io, Some(peer_addr), Vec::new(), None, control, true).await
}

/// The combo front door: peeks the first byte and routes to SOCKS, TLS MITM
/// or HTTP. Runs iteratively because SOCKS and TLS both hand back a stream
/// that needs detecting again.
async fn detect_and_serve(
    state: Arc<ServerState>,
    mut io: Box<dyn AsyncStream>,
    peer_addr: Option<SocketAddr>,
    mut tags: Vec<String>,
    mut connect_authority: Option<String>,
    control: Arc<ConnectionControl>,
    mut allow_socks: bool,
) -> Result<(), Error> {
    let mut scheme: &'static str = "http";

    loop {
        let mut first = [0u8; 1];
        let n = io.read(&mut first).await?;
        if n == 0 {
            log::trace!("connection closed before any bytes arrived");
            return Ok(());
        }

        match detect_protocol(first[0]) {
            DetectedProtocol::Socks if allow_socks && !state.config.socks_auth.is_empty() => {
                let mut rewound = Rewind::new(Bytes::copy_from_slice(&first), io);
                let target = match socks::handshake(&mut rewound, &state.config.socks_auth).await {
                    Ok(target) => target,
                    Err(err) => {
                        state.events.emit(Event::ClientError(ClientErrorSnapshot {
                            peer_addr,
                            error_code: Some("socks-error".to_string()),
                            message: err.to_string(),
                            request: None,
                        }));
                        return Err(err.into());
                    }
                };
                log::debug!(
                    "SOCKS CONNECT to {}:{} accepted",
                    target.host.to_hostname(),
                    target.port
                );
                tags.extend(target.tags.iter().cloned());
                connect_authority =
                    Some(format!("{}:{}", target.host.to_hostname(), target.port));
                io = Box::new(rewound);
                // SOCKS cannot nest.
                allow_socks = false;
            }
            DetectedProtocol::Tls => {
                let rewound = Rewind::new(Bytes::copy_from_slice(&first), io);
                let tls_config = state.cert_authority.server_config(
                    connect_authority.clone(),
                    state.config.http2,
                    state.config.keylog.clone(),
                );
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                let tls_stream = match acceptor.accept(rewound).await {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        // Failures before TLS setup completes are their own
                        // error class.
                        state
                            .events
                            .emit(Event::TlsClientError(ClientErrorSnapshot {
                                peer_addr,
                                error_code: Some("tls-handshake-failed".to_string()),
                                message: err.to_string(),
                                request: None,
                            }));
                        return Err(Error::TlsAccept(err.to_string()));
                    }
                };
                log::trace!("TLS established with {:?}", peer_addr);
                io = Box::new(tls_stream);
                scheme = "https";
                allow_socks = false;
            }
            DetectedProtocol::Http => {
                let rewound = Rewind::new(Bytes::copy_from_slice(&first), io);
                let ctx = Arc::new(ConnectionContext {
                    state: state.clone(),
                    peer_addr,
                    tags,
                    scheme,
                    connect_authority,
                    control,
                });
                return serve_http(ctx, Box::new(rewound)).await;
            }
            DetectedProtocol::Socks | DetectedProtocol::Unknown => {
                log::debug!(
                    "ambiguous first byte 0x{:02x} from {:?}, resetting",
                    first[0],
                    peer_addr
                );
                state.events.emit(Event::ClientError(ClientErrorSnapshot {
                    peer_addr,
                    error_code: Some("unknown-protocol".to_string()),
                    message: format!("unrecognised first byte 0x{:02x}", first[0]),
                    request: None,
                }));
                control.request_reset();
                return Ok(());
            }
        }
    }
}

async fn serve_http(ctx: Arc<ConnectionContext>, io: Box<dyn AsyncStream>) -> Result<(), Error> {
    let mut builder = ServerBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);

    let service_ctx = ctx.clone();
    let result = builder
        .serve_connection_with_upgrades(
            TokioIo::new(io),
            service_fn(move |req| {
                let ctx = service_ctx.clone();
                async move { service(ctx, req).await }
            }),
        )
        .await;

    if let Err(err) = result {
        // An error after protocol selection is an ordinary client error
        // unless a rule asked for the teardown.
        if !is_rule_abort(err.as_ref()) {
            log::debug!("connection ended with error: {}", err);
            ctx.state.events.emit(Event::ClientError(ClientErrorSnapshot {
                peer_addr: ctx.peer_addr,
                error_code: Some("http-error".to_string()),
                message: err.to_string(),
                request: None,
            }));
            return Err(Error::Http(err.to_string()));
        }
    }
    Ok(())
}

/// Hyper wraps service errors, so rule-driven teardowns are found by walking
/// the source chain.
fn is_rule_abort(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = current {
        if inner.is::<AbortedByRule>() {
            return true;
        }
        current = inner.source();
    }
    false
}

/// Emits exactly one `abort` event if the service future is dropped (client
/// gone, timeout step cancelled) or a rule tears the connection down before
/// a response.
struct AbortGuard {
    state: Arc<ServerState>,
    snapshot: Option<crate::server::events::RequestSnapshot>,
    code: Option<String>,
}

impl AbortGuard {
    fn arm(state: Arc<ServerState>, req: &OngoingRequest) -> Self {
        AbortGuard {
            state,
            snapshot: Some(req.snapshot()),
            code: None,
        }
    }

    fn set_code(&mut self, code: &str) {
        self.code = Some(code.to_string());
    }

    fn disarm(&mut self) {
        self.snapshot = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            let mut timing = snapshot.timing.clone();
            timing.aborted = Some(std::time::Instant::now());
            self.state
                .events
                .emit(Event::Abort(crate::server::events::AbortSnapshot {
                    id: snapshot.id,
                    error_code: self.code.clone(),
                    message: "request aborted before a response was sent".to_string(),
                    tags: snapshot.tags.clone(),
                    timing,
                }));
        }
    }
}

type ServiceBody = BoxBody<Bytes, hyper::Error>;

async fn service(
    ctx: Arc<ConnectionContext>,
    req: Request<Incoming>,
) -> Result<Response<ServiceBody>, AbortedByRule> {
    if req.method() == http::Method::CONNECT {
        return handle_connect(ctx, req);
    }

    let mut req = req;
    let on_upgrade = if websocket::is_upgrade_request(&req) {
        Some(hyper::upgrade::on(&mut req))
    } else {
        None
    };

    let ongoing = match OngoingRequest::new(
        req,
        ctx.scheme,
        ctx.connect_authority.as_deref(),
        ctx.peer_addr,
        &ctx.tags,
        ctx.state.config.max_body_size,
    ) {
        Ok(ongoing) => ongoing,
        Err(err) => {
            ctx.state.events.emit(Event::ClientError(ClientErrorSnapshot {
                peer_addr: ctx.peer_addr,
                error_code: Some("invalid-request".to_string()),
                message: err.to_string(),
                request: None,
            }));
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid request: {}", err),
            ));
        }
    };

    log::debug!(
        "{} {} ({} / {:?})",
        ongoing.method,
        ongoing.url,
        ongoing.scheme,
        ongoing.version
    );

    ctx.state
        .events
        .emit(Event::RequestInitiated(ongoing.snapshot()));

    // Armed across matching and step execution: if the client disconnects
    // and this future is dropped, exactly one abort event fires.
    let mut guard = AbortGuard::arm(ctx.state.clone(), &ongoing);

    let selected = ctx.state.rules.select(&ongoing).await;

    let step_ctx = ctx.state.step_context();

    let (outcome, handled_by) = match selected {
        Some(rule) => {
            ongoing.set_matched_rule(rule.id());
            ctx.state.events.emit(Event::Request(ongoing.snapshot()));

            let outcome = match on_upgrade {
                Some(upgrade) => {
                    websocket::run_upgrade_steps(&rule, &ongoing, &step_ctx, upgrade).await
                }
                None => steps::run_steps(&rule, &ongoing, &step_ctx).await,
            };
            (outcome, Some(rule))
        }
        None => {
            ctx.state.events.emit(Event::Request(ongoing.snapshot()));
            log::debug!("no rule matched {} {}", ongoing.method, ongoing.url);
            (unmatched_response(&ctx.state), None)
        }
    };

    if let Some(rule) = &handled_by {
        rule.record_handled(ongoing.snapshot());
    }

    match outcome {
        StepOutcome::Respond(response) => {
            guard.disarm();
            drop(guard);
            let mut timing = ongoing.timing.clone();
            timing.headers_sent = Some(std::time::Instant::now());
            if matches!(response.body, ResponseBody::Full(_)) {
                timing.response_sent = Some(std::time::Instant::now());
            }

            ctx.state
                .events
                .emit(Event::Response(crate::server::events::ResponseSnapshot {
                    id: ongoing.id,
                    status: response.status.as_u16(),
                    status_message: response.status_message.clone(),
                    headers: response.headers.clone(),
                    body_size: response.body.len(),
                    timing,
                }));

            Ok(to_hyper_response(response))
        }
        StepOutcome::Close => {
            guard.set_code("rule-close");
            Err(AbortedByRule)
        }
        StepOutcome::Reset => {
            guard.set_code("rule-reset");
            ctx.control.request_reset();
            Err(AbortedByRule)
        }
        StepOutcome::Continue => {
            guard.disarm();
            Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "rule completed without a terminal step".to_string(),
            ))
        }
    }
}

/// CONNECT turns the connection into a raw tunnel which we immediately MITM:
/// the upgraded stream re-enters protocol detection with the CONNECT target
/// as authority. The 200 must be written before hyper completes the
/// upgrade, so tunnel handling is detached.
fn handle_connect(
    ctx: Arc<ConnectionContext>,
    req: Request<Incoming>,
) -> Result<Response<ServiceBody>, AbortedByRule> {
    let authority = req.uri().authority().map(|a| a.to_string());
    log::debug!("CONNECT to {:?}", authority);

    let on_upgrade = hyper::upgrade::on(req);
    let ctx_for_tunnel = ctx.clone();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io: Box<dyn AsyncStream> = Box::new(TokioIo::new(upgraded));
                if let Err(err) = detect_and_serve(
                    ctx_for_tunnel.state.clone(),
                    io,
                    ctx_for_tunnel.peer_addr,
                    ctx_for_tunnel.tags.clone(),
                    authority,
                    ctx_for_tunnel.control.clone(),
                    false,
                )
                .await
                {
                    log::debug!("tunneled connection ended: {}", err);
                }
            }
            Err(err) => {
                log::warn!("CONNECT upgrade failed: {}", err);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static CONNECT response must build"))
}

fn unmatched_response(state: &ServerState) -> StepOutcome {
    let mut body = String::from(
        "Request for unmocked endpoint: no rules were found matching this request.\n",
    );
    let rules = state.rules.all();
    if rules.is_empty() {
        body.push_str("No rules are configured on this server.\n");
    } else {
        body.push_str("The configured rules are:\n");
        for rule in rules {
            body.push_str(&format!("- {}\n", rule.explain()));
        }
    }

    StepOutcome::Respond(
        ProxyResponse::new(StatusCode::SERVICE_UNAVAILABLE)
            .with_header("content-type", "text/plain")
            .with_body(body),
    )
}

fn to_hyper_response(response: ProxyResponse) -> Response<ServiceBody> {
    let mut builder = Response::builder().status(response.status);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            match (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => log::warn!("dropping invalid response header {:?}", name),
            }
        }
    }

    let body: ServiceBody = match response.trailers {
        Some(trailers) => response
            .body
            .into_boxed()
            .with_trailers(async move { Some(Ok(trailers)) })
            .boxed(),
        None => response.body.into_boxed(),
    };

    builder.body(body).unwrap_or_else(|err| {
        log::error!("cannot build response: {}", err);
        plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "cannot build response".to_string(),
        )
    })
}

fn plain_response(status: StatusCode, body: String) -> Response<ServiceBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(
            http_body_util::Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response must build")
}

fn empty_body() -> ServiceBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_byte_detection() {
        assert_eq!(detect_protocol(0x04), DetectedProtocol::Socks);
        assert_eq!(detect_protocol(0x05), DetectedProtocol::Socks);
        assert_eq!(detect_protocol(0x16), DetectedProtocol::Tls);
        assert_eq!(detect_protocol(b'G'), DetectedProtocol::Http);
        assert_eq!(detect_protocol(b'P'), DetectedProtocol::Http);
        assert_eq!(detect_protocol(b'p'), DetectedProtocol::Http);
        assert_eq!(detect_protocol(0x00), DetectedProtocol::Unknown);
        assert_eq!(detect_protocol(0xff), DetectedProtocol::Unknown);
    }

    #[tokio::test]
    async fn rewind_replays_the_prefix() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut rewound = Rewind::new(Bytes::from_static(b"GET "), server);

        let mut buf = [0u8; 4];
        rewound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET ");
    }

    #[tokio::test]
    async fn rewind_handles_partial_prefix_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_all(b"rest").await;
        });
        let mut rewound = Rewind::new(Bytes::from_static(b"pre-"), server);

        let mut buf = [0u8; 2];
        rewound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pr");
        let mut rest = Vec::new();
        rewound.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest, b"e-rest");
    }
}
