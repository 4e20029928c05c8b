use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use lru::LruCache;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::common::data::ProxySetting;
use crate::common::util;
use crate::server::passthrough::dns::CachingResolver;

use self::Error::{
    CaError, ConnectError, HandshakeError, InvalidUrl, ProxyError, ProxyUnsupported, TlsError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported proxy configuration: {0}")]
    ProxyUnsupported(String),
    #[error("proxy connection failed: {0}")]
    ProxyError(String),
    #[error("{0}")]
    DnsError(#[from] crate::server::passthrough::dns::Error),
    #[error("cannot connect to upstream: {0}")]
    ConnectError(std::io::Error),
    #[error("upstream TLS failure: {0}")]
    TlsError(String),
    #[error("upstream HTTP handshake failed: {0}")]
    HandshakeError(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("cannot load trusted CAs: {0}")]
    CaError(String),
    #[error("passthrough loop detected: request would re-enter this proxy")]
    LoopDetected,
}

impl Error {
    /// Short machine-readable code, used for `passthrough-error:<code>` tags
    /// and abort events.
    pub fn code(&self) -> String {
        match self {
            Error::DnsError(_) => "ENOTFOUND".to_string(),
            Error::ConnectError(err) => match err.kind() {
                std::io::ErrorKind::ConnectionRefused => "ECONNREFUSED".to_string(),
                std::io::ErrorKind::ConnectionReset => "ECONNRESET".to_string(),
                std::io::ErrorKind::TimedOut => "ETIMEDOUT".to_string(),
                std::io::ErrorKind::ConnectionAborted => "ECONNABORTED".to_string(),
                kind => format!("{:?}", kind).to_uppercase(),
            },
            Error::TlsError(_) => "EPROTO".to_string(),
            Error::LoopDetected => "ELOOP".to_string(),
            Error::ProxyError(_) | Error::ProxyUnsupported(_) => "EPROXY".to_string(),
            Error::HandshakeError(_) => "ECONNRESET".to_string(),
            Error::InvalidUrl(_) | Error::CaError(_) => "EINVAL".to_string(),
        }
    }

    /// Recognised TLS failure name for `passthrough-tls-error:<name>` tags,
    /// when the error is a TLS one.
    pub fn tls_error_name(&self) -> Option<String> {
        let Error::TlsError(message) = self else {
            return None;
        };
        let lowered = message.to_ascii_lowercase();
        let name = if lowered.contains("unknownissuer") || lowered.contains("unknown issuer") {
            "unknown-issuer"
        } else if lowered.contains("expired") {
            "expired-cert"
        } else if lowered.contains("notvalidforname") || lowered.contains("invalid for name") {
            "wrong-host"
        } else if lowered.contains("handshakefailure") {
            "handshake-failure"
        } else if lowered.contains("protocolversion") {
            "unsupported-version"
        } else if lowered.contains("alert") {
            "remote-alert"
        } else {
            return Some("context-unknown".to_string());
        };
        Some(name.to_string())
    }
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type OutBody = BoxBody<Bytes, hyper::Error>;

/// Matches a hostname/port pair against a `no_proxy` list. Entries cover
/// the domain itself and its subdomains at label boundaries; an entry port
/// restricts the match to that port; bare IPs match exactly.
pub fn no_proxy_matches(no_proxy: &[String], hostname: &str, port: u16) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    no_proxy.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return false;
        }
        let entry = entry
            .strip_prefix("*.")
            .or_else(|| entry.strip_prefix('.'))
            .unwrap_or(&entry)
            .to_string();

        let (entry_host, entry_port) = util::split_host_port(&entry);
        if let Some(entry_port) = entry_port {
            if entry_port != port {
                return false;
            }
        }

        if entry_host.parse::<IpAddr>().is_ok() {
            return hostname == entry_host;
        }

        hostname == entry_host || hostname.ends_with(&format!(".{}", entry_host))
    })
}

enum ProxyKind {
    /// CONNECT (or absolute-form for plaintext) over HTTP, optionally with
    /// the proxy link itself TLS-wrapped.
    Http { tls: bool },
    Socks4,
    /// `resolve_remotely` distinguishes socks5h/socks4a from socks5/socks4.
    Socks5 { resolve_remotely: bool },
}

struct ParsedProxy {
    kind: ProxyKind,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

fn parse_proxy_url(raw: &str) -> Result<ParsedProxy, Error> {
    let url = url::Url::parse(raw).map_err(|err| InvalidUrl(format!("{}: {}", raw, err)))?;
    let scheme = url.scheme().to_ascii_lowercase();

    if scheme.starts_with("pac+") {
        return Err(ProxyUnsupported(
            "PAC proxy configuration is not supported".to_string(),
        ));
    }

    let kind = match scheme.as_str() {
        "http" => ProxyKind::Http { tls: false },
        "https" => ProxyKind::Http { tls: true },
        "socks4" | "socks4a" => ProxyKind::Socks4,
        "socks5" => ProxyKind::Socks5 {
            resolve_remotely: false,
        },
        "socks5h" => ProxyKind::Socks5 {
            resolve_remotely: true,
        },
        other => {
            return Err(ProxyUnsupported(format!(
                "unknown proxy scheme {:?}",
                other
            )))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| InvalidUrl(format!("proxy URL {} has no host", raw)))?
        .to_string();
    let port = url.port().unwrap_or(match kind {
        ProxyKind::Http { tls: true } => 443,
        ProxyKind::Http { tls: false } => 8080,
        _ => 1080,
    });

    let username = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };

    Ok(ParsedProxy {
        kind,
        host,
        port,
        username,
        password: url.password().map(|p| p.to_string()),
    })
}

/// Rejects settings the engine cannot honour before any request uses them.
pub fn validate_proxy_setting(setting: &ProxySetting) -> Result<(), Error> {
    parse_proxy_url(&setting.proxy_url)?;
    if setting.trusted_cas.is_some() && setting.additional_trusted_cas.is_some() {
        return Err(ProxyUnsupported(
            "trustedCAs and additionalTrustedCAs are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

/// TLS parameters for one upstream connection.
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub ignore_errors: bool,
    /// Replaces the system roots entirely.
    pub trusted_cas: Option<Vec<String>>,
    /// Appended to the system roots.
    pub additional_cas: Vec<String>,
    pub offer_h2: bool,
}

impl TlsOptions {
    fn cache_key(&self) -> String {
        serde_json::json!({
            "ignore": self.ignore_errors,
            "trusted": self.trusted_cas,
            "additional": self.additional_cas,
            "h2": self.offer_h2,
        })
        .to_string()
    }
}

#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Cipher-suite and key-exchange ordering chosen to look like a current
/// browser, so TLS-fingerprinting upstreams don't single us out.
fn browser_like_provider() -> rustls::crypto::CryptoProvider {
    use rustls::crypto::ring::{cipher_suite, default_provider, kx_group};

    rustls::crypto::CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1],
        ..default_provider()
    }
}

fn add_pem_to_store(store: &mut RootCertStore, pem: &str) -> Result<(), Error> {
    let mut reader = std::io::Cursor::new(pem.as_bytes().to_vec());
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|err| CaError(format!("invalid CA PEM: {}", err)))?;
        store
            .add(cert)
            .map_err(|err| CaError(format!("cannot add CA certificate: {}", err)))?;
    }
    Ok(())
}

fn build_client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, Error> {
    let provider = Arc::new(browser_like_provider());

    // Ignoring certificate errors also relaxes the minimum version.
    let versions: &[&rustls::SupportedProtocolVersion] = if options.ignore_errors {
        &[&rustls::version::TLS12, &rustls::version::TLS13]
    } else {
        rustls::DEFAULT_VERSIONS
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|err| TlsError(format!("cannot configure TLS versions: {}", err)))?;

    let mut config = if options.ignore_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match &options.trusted_cas {
            Some(replacement) => {
                for pem in replacement {
                    add_pem_to_store(&mut roots, pem)?;
                }
            }
            None => {
                let native = rustls_native_certs::load_native_certs();
                for cert in native.certs {
                    // Individual unparseable platform certs are skipped.
                    let _ = roots.add(cert);
                }
                for pem in &options.additional_cas {
                    add_pem_to_store(&mut roots, pem)?;
                }
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    config.alpn_protocols = if options.offer_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(Arc::new(config))
}

const AGENT_CACHE_CAPACITY: usize = 20;
const AGENT_IDLE_TTL: Duration = Duration::from_secs(5 * 60);
const POOL_MAX_IDLE_PER_KEY: usize = 6;

struct AgentEntry {
    config: Arc<ClientConfig>,
    last_used: Instant,
}

/// Key for the upstream keep-alive pool: one bucket per distinct dial
/// configuration.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PoolKey {
    pub scheme: &'static str,
    pub hostname: String,
    pub port: u16,
    pub proxy: Option<String>,
    pub h2: bool,
}

pub struct PooledConn {
    pub sender: UpstreamSender,
    pub local_port: u16,
}

/// Process-wide cache of TLS client configs (LRU, capped, idle-expired) plus
/// the upstream keep-alive connection pool.
pub struct AgentCache {
    configs: Mutex<LruCache<String, AgentEntry>>,
    pool: Mutex<HashMap<PoolKey, Vec<PooledConn>>>,
}

impl AgentCache {
    pub fn new() -> Self {
        AgentCache {
            configs: Mutex::new(LruCache::new(
                NonZeroUsize::new(AGENT_CACHE_CAPACITY).unwrap(),
            )),
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up or builds the TLS client config for a dial configuration.
    /// Cache keys include the proxy identity and trust settings; idle
    /// entries expire after five minutes, refreshed on use.
    pub fn client_config(
        &self,
        options: &TlsOptions,
        proxy_url: Option<&str>,
    ) -> Result<Arc<ClientConfig>, Error> {
        let key = serde_json::json!({
            "proxy": proxy_url,
            "tls": options.cache_key(),
        })
        .to_string();

        let mut configs = self.configs.lock().unwrap();
        if let Some(entry) = configs.get_mut(&key) {
            if entry.last_used.elapsed() < AGENT_IDLE_TTL {
                entry.last_used = Instant::now();
                return Ok(entry.config.clone());
            }
            configs.pop(&key);
        }

        let config = build_client_config(options)?;
        configs.put(
            key,
            AgentEntry {
                config: config.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(config)
    }

    /// Pops an idle connection for reuse, discarding ones that died.
    pub fn checkout(&self, key: &PoolKey) -> Option<PooledConn> {
        let mut pool = self.pool.lock().unwrap();
        let idle = pool.get_mut(key)?;
        while let Some(conn) = idle.pop() {
            if !conn.sender.is_closed() {
                log::trace!("reusing pooled upstream connection for {:?}", key);
                return Some(conn);
            }
        }
        None
    }

    pub fn checkin(&self, key: PoolKey, conn: PooledConn) {
        if conn.sender.is_closed() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        let idle = pool.entry(key).or_default();
        if idle.len() < POOL_MAX_IDLE_PER_KEY {
            idle.push(conn);
        }
    }
}

impl Default for AgentCache {
    fn default() -> Self {
        AgentCache::new()
    }
}

/// Established upstream HTTP channel.
pub enum UpstreamSender {
    H1(hyper::client::conn::http1::SendRequest<OutBody>),
    H2(hyper::client::conn::http2::SendRequest<OutBody>),
}

impl UpstreamSender {
    pub fn is_closed(&self) -> bool {
        match self {
            UpstreamSender::H1(sender) => sender.is_closed(),
            UpstreamSender::H2(sender) => sender.is_closed(),
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self, UpstreamSender::H2(_))
    }

    /// Waits until the channel can take another request. On pooled HTTP/1
    /// connections this is what serialises consecutive requests.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        match self {
            UpstreamSender::H1(sender) => sender.ready().await,
            UpstreamSender::H2(sender) => sender.ready().await,
        }
    }

    pub async fn send_request(
        &mut self,
        req: http::Request<OutBody>,
    ) -> Result<http::Response<Incoming>, hyper::Error> {
        match self {
            UpstreamSender::H1(sender) => sender.send_request(req).await,
            UpstreamSender::H2(sender) => sender.send_request(req).await,
        }
    }
}

/// A dialed (but not yet HTTP-handshaken) upstream transport.
pub struct DialedTransport {
    pub io: Box<dyn AsyncStream>,
    pub local_port: u16,
    /// ALPN selected h2.
    pub negotiated_h2: bool,
    /// The request must go out in absolute form (plaintext via HTTP proxy).
    pub absolute_form: bool,
}

async fn open_tcp(
    hostname: &str,
    port: u16,
    dns: &CachingResolver,
) -> Result<TcpStream, Error> {
    let ips = dns.resolve(hostname).await?;
    let mut last_error: Option<std::io::Error> = None;
    for ip in ips {
        match TcpStream::connect((ip, port)).await {
            Ok(stream) => {
                // Keep forwarding latency low; we write whole messages.
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => last_error = Some(err),
        }
    }
    Err(ConnectError(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no addresses to try")
    })))
}

/// Minimal CONNECT handshake on an established proxy link.
async fn connect_tunnel<S>(stream: &mut S, hostname: &str, port: u16) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if hostname.contains(':') {
        format!("[{}]:{}", hostname, port)
    } else {
        format!("{}:{}", hostname, port)
    };
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| ProxyError(format!("cannot send CONNECT: {}", err)))?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(ProxyError("oversized CONNECT response".to_string()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|err| ProxyError(format!("cannot read CONNECT response: {}", err)))?;
        if n == 0 {
            return Err(ProxyError(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).to_string())
        .unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError(format!("malformed CONNECT status line: {}", status_line)))?;
    if !(200..300).contains(&status) {
        return Err(ProxyError(format!("proxy refused CONNECT: {}", status)));
    }
    Ok(())
}

async fn tls_wrap(
    io: Box<dyn AsyncStream>,
    server_name: &str,
    config: Arc<ClientConfig>,
) -> Result<(Box<dyn AsyncStream>, bool), Error> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|err| TlsError(format!("invalid TLS server name {}: {}", server_name, err)))?;
    let connector = TlsConnector::from(config);
    let stream = connector
        .connect(name, io)
        .await
        .map_err(|err| TlsError(format!("{:?}", err)))?;
    let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_ref());
    Ok((Box::new(stream), negotiated_h2))
}

/// Dials the target, optionally via a proxy, optionally TLS-wrapped, and
/// reports the local port of the outgoing socket for loop tracking.
pub async fn dial(
    hostname: &str,
    port: u16,
    https: bool,
    try_h2: bool,
    proxy: Option<&ProxySetting>,
    tls_options: &TlsOptions,
    dns: &CachingResolver,
    agents: &AgentCache,
) -> Result<DialedTransport, Error> {
    let mut absolute_form = false;

    let (io, local_port): (Box<dyn AsyncStream>, u16) = match proxy {
        None => {
            let stream = open_tcp(hostname, port, dns).await?;
            let local_port = stream
                .local_addr()
                .map_err(ConnectError)?
                .port();
            (Box::new(stream), local_port)
        }
        Some(setting) => {
            let parsed = parse_proxy_url(&setting.proxy_url)?;
            let stream = open_tcp(&parsed.host, parsed.port, dns).await?;
            let local_port = stream
                .local_addr()
                .map_err(ConnectError)?
                .port();

            match parsed.kind {
                ProxyKind::Http { tls } => {
                    let mut link: Box<dyn AsyncStream> = if tls {
                        let proxy_tls = TlsOptions {
                            ignore_errors: tls_options.ignore_errors,
                            trusted_cas: setting.trusted_cas.clone(),
                            additional_cas: setting
                                .additional_trusted_cas
                                .clone()
                                .unwrap_or_default(),
                            offer_h2: false,
                        };
                        let config =
                            agents.client_config(&proxy_tls, Some(&setting.proxy_url))?;
                        let (wrapped, _) = tls_wrap(Box::new(stream), &parsed.host, config).await?;
                        wrapped
                    } else {
                        Box::new(stream)
                    };

                    if https {
                        connect_tunnel(&mut link, hostname, port).await?;
                    } else {
                        // Plaintext goes through the proxy in absolute form,
                        // no tunnel needed.
                        absolute_form = true;
                    }
                    (link, local_port)
                }
                ProxyKind::Socks4 => {
                    let target = socks_target(hostname, port, false, dns).await?;
                    let socks =
                        tokio_socks::tcp::Socks4Stream::connect_with_socket(stream, target)
                            .await
                            .map_err(|err| ProxyError(format!("SOCKS4 connect failed: {}", err)))?;
                    (Box::new(socks), local_port)
                }
                ProxyKind::Socks5 { resolve_remotely } => {
                    let target = socks_target(hostname, port, !resolve_remotely, dns).await?;
                    let socks = match (&parsed.username, &parsed.password) {
                        (Some(user), Some(pass)) => {
                            tokio_socks::tcp::Socks5Stream::connect_with_password_and_socket(
                                stream,
                                target,
                                user.as_str(),
                                pass.as_str(),
                            )
                            .await
                        }
                        _ => {
                            tokio_socks::tcp::Socks5Stream::connect_with_socket(stream, target)
                                .await
                        }
                    }
                    .map_err(|err| ProxyError(format!("SOCKS5 connect failed: {}", err)))?;
                    (Box::new(socks), local_port)
                }
            }
        }
    };

    if https {
        let options = TlsOptions {
            offer_h2: try_h2,
            ..tls_options.clone()
        };
        let config = agents.client_config(&options, proxy.map(|p| p.proxy_url.as_str()))?;
        let (io, negotiated_h2) = tls_wrap(io, hostname, config).await?;
        Ok(DialedTransport {
            io,
            local_port,
            negotiated_h2,
            absolute_form: false,
        })
    } else {
        Ok(DialedTransport {
            io,
            local_port,
            negotiated_h2: false,
            absolute_form,
        })
    }
}

async fn socks_target(
    hostname: &str,
    port: u16,
    resolve_locally: bool,
    dns: &CachingResolver,
) -> Result<tokio_socks::TargetAddr<'static>, Error> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(tokio_socks::TargetAddr::Ip(std::net::SocketAddr::new(ip, port)));
    }
    if resolve_locally {
        let ips = dns.resolve(hostname).await?;
        let ip = ips
            .first()
            .copied()
            .ok_or_else(|| crate::server::passthrough::dns::Error::NoAddresses(hostname.to_string()))?;
        Ok(tokio_socks::TargetAddr::Ip(std::net::SocketAddr::new(ip, port)))
    } else {
        Ok(tokio_socks::TargetAddr::Domain(
            std::borrow::Cow::Owned(hostname.to_string()),
            port,
        ))
    }
}

/// Runs the HTTP/1 or HTTP/2 client handshake over a dialed transport. The
/// connection driver is spawned; it ends when the sender is dropped.
pub async fn handshake(
    io: Box<dyn AsyncStream>,
    h2: bool,
) -> Result<UpstreamSender, Error> {
    if h2 {
        let (sender, connection) =
            hyper::client::conn::http2::Builder::new(TokioExecutor::new())
                .handshake(TokioIo::new(io))
                .await
                .map_err(|err| HandshakeError(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("upstream h2 connection ended: {}", err);
            }
        });
        Ok(UpstreamSender::H2(sender))
    } else {
        let (sender, connection) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(io))
            .await
            .map_err(|err| HandshakeError(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("upstream h1 connection ended: {}", err);
            }
        });
        Ok(UpstreamSender::H1(sender))
    }
}

/// One-shot POST used by webhook steps. Best effort: default TLS
/// verification, no proxying, no pooling.
pub async fn post_json(
    url: &str,
    body: String,
    dns: &CachingResolver,
) -> Result<u16, Error> {
    let parsed = url::Url::parse(url).map_err(|err| InvalidUrl(format!("{}: {}", url, err)))?;
    let https = parsed.scheme() == "https";
    let hostname = parsed
        .host_str()
        .ok_or_else(|| InvalidUrl(format!("webhook URL {} has no host", url)))?
        .to_string();
    let port = parsed
        .port()
        .unwrap_or_else(|| util::default_port(parsed.scheme()));

    let stream = open_tcp(&hostname, port, dns).await?;
    let io: Box<dyn AsyncStream> = if https {
        let config = build_client_config(&TlsOptions::default())?;
        let (wrapped, _) = tls_wrap(Box::new(stream), &hostname, config).await?;
        wrapped
    } else {
        Box::new(stream)
    };

    let mut sender = handshake(io, false).await?;

    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::HOST, util::format_host_header(&hostname, port, parsed.scheme()))
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .map_err(|err| InvalidUrl(err.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|err| HandshakeError(err.to_string()))?;
    Ok(response.status().as_u16())
}
