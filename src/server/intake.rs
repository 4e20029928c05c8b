use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::common::util;
use crate::server::events::{RequestSnapshot, TimingEvents};

use self::Error::{BodyUnavailable, MissingAuthority, UrlInvalid};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read request body: {0}")]
    BodyReadError(String),
    #[error("request body was already consumed")]
    BodyUnavailable,
    #[error("{0}")]
    BodyDecodeError(#[from] crate::common::util::Error),
    #[error("origin-form request carries no Host header or CONNECT authority")]
    MissingAuthority,
    #[error("cannot build canonical request URL: {0}")]
    UrlInvalid(String),
}

/// Where a request is headed, before any passthrough transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub hostname: String,
    pub port: u16,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

enum BodyState {
    Pending(Incoming),
    Buffered,
    Taken,
}

/// What passthrough gets to forward: the live stream when nothing read the
/// body yet, or the buffered bytes otherwise.
pub enum BodySource {
    Stream(Incoming),
    Buffered(Bytes),
}

/// Lazy request body. The raw view buffers on first use and stays available;
/// decoded views honour the configured size cap and fail beyond it.
pub struct BodyHandle {
    state: tokio::sync::Mutex<BodyState>,
    raw: OnceLock<Bytes>,
    trailers: OnceLock<HeaderMap>,
    max_body_size: usize,
}

impl BodyHandle {
    pub fn new(incoming: Incoming, max_body_size: usize) -> Self {
        BodyHandle {
            state: tokio::sync::Mutex::new(BodyState::Pending(incoming)),
            raw: OnceLock::new(),
            trailers: OnceLock::new(),
            max_body_size,
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let handle = BodyHandle {
            state: tokio::sync::Mutex::new(BodyState::Buffered),
            raw: OnceLock::new(),
            trailers: OnceLock::new(),
            max_body_size: usize::MAX,
        };
        let _ = handle.raw.set(bytes);
        handle
    }

    /// Buffers (once) and returns the raw body bytes.
    pub async fn raw(&self) -> Result<Bytes, Error> {
        if let Some(bytes) = self.raw.get() {
            return Ok(bytes.clone());
        }

        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, BodyState::Buffered) {
            BodyState::Pending(incoming) => {
                let collected = incoming
                    .collect()
                    .await
                    .map_err(|err| Error::BodyReadError(err.to_string()))?;
                if let Some(trailers) = collected.trailers() {
                    let _ = self.trailers.set(trailers.clone());
                }
                let bytes = collected.to_bytes();
                let _ = self.raw.set(bytes.clone());
                Ok(bytes)
            }
            BodyState::Buffered => Ok(self.raw.get().cloned().unwrap_or_else(Bytes::new)),
            BodyState::Taken => {
                *state = BodyState::Taken;
                Err(BodyUnavailable)
            }
        }
    }

    /// The body decoded according to `content-encoding`, capped at the
    /// configured maximum size.
    pub async fn decoded(&self, content_encoding: Option<&str>) -> Result<Bytes, Error> {
        let raw = self.raw().await?;
        Ok(util::decode_body(content_encoding, &raw, self.max_body_size)?)
    }

    /// Hands the body to the passthrough engine. Streams are returned live
    /// only if nothing buffered them before.
    pub async fn take(&self) -> Result<BodySource, Error> {
        if let Some(bytes) = self.raw.get() {
            return Ok(BodySource::Buffered(bytes.clone()));
        }
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, BodyState::Taken) {
            BodyState::Pending(incoming) => Ok(BodySource::Stream(incoming)),
            BodyState::Buffered => Ok(BodySource::Buffered(
                self.raw.get().cloned().unwrap_or_else(Bytes::new),
            )),
            BodyState::Taken => Err(BodyUnavailable),
        }
    }

    pub fn buffered_trailers(&self) -> Option<&HeaderMap> {
        self.trailers.get()
    }
}

/// One request moving through the engine: created at intake, read by the
/// rule engine and steps, consumed by passthrough, finalised in the
/// response event.
pub struct OngoingRequest {
    pub id: Uuid,
    pub timing: TimingEvents,
    pub method: Method,
    pub version: Version,
    pub url: Url,
    pub scheme: String,
    pub destination: Destination,
    pub headers: HeaderMap,
    pub raw_headers: Vec<(String, String)>,
    pub peer_addr: Option<SocketAddr>,
    pub keep_alive: bool,
    pub body: BodyHandle,
    tags: Mutex<Vec<String>>,
    matched_rule_id: OnceLock<usize>,
    /// Original hyper extensions, carried so the private header-case map
    /// survives into the upstream request.
    extensions: Mutex<Option<http::Extensions>>,
}

impl OngoingRequest {
    pub fn new(
        req: http::Request<Incoming>,
        scheme: &str,
        connect_authority: Option<&str>,
        peer_addr: Option<SocketAddr>,
        connection_tags: &[String],
        max_body_size: usize,
    ) -> Result<Self, Error> {
        let (parts, body) = req.into_parts();

        let url = canonical_url(&parts.uri, &parts.headers, scheme, connect_authority)?;
        let hostname = url
            .host_str()
            .ok_or_else(|| UrlInvalid("canonical URL has no host".to_string()))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port()
            .unwrap_or_else(|| util::default_port(url.scheme()));

        let raw_headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        let keep_alive = detect_keep_alive(parts.version, &parts.headers);

        Ok(OngoingRequest {
            id: Uuid::new_v4(),
            timing: TimingEvents::new(),
            method: parts.method,
            version: parts.version,
            scheme: url.scheme().to_string(),
            destination: Destination { hostname, port },
            url,
            headers: parts.headers,
            raw_headers,
            peer_addr,
            keep_alive,
            body: BodyHandle::new(body, max_body_size),
            tags: Mutex::new(connection_tags.to_vec()),
            matched_rule_id: OnceLock::new(),
            extensions: Mutex::new(Some(parts.extensions)),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        util::find_header(&self.raw_headers, name)
    }

    pub fn content_encoding(&self) -> Option<String> {
        self.header("content-encoding").map(|v| v.to_string())
    }

    pub async fn decoded_body(&self) -> Result<Bytes, Error> {
        let encoding = self.content_encoding();
        self.body.decoded(encoding.as_deref()).await
    }

    pub fn add_tag(&self, tag: String) {
        self.tags.lock().unwrap().push(tag);
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.lock().unwrap().clone()
    }

    pub fn set_matched_rule(&self, rule_id: usize) {
        let _ = self.matched_rule_id.set(rule_id);
    }

    pub fn matched_rule(&self) -> Option<usize> {
        self.matched_rule_id.get().copied()
    }

    /// Takes the original request extensions (header case map and friends)
    /// for reuse on the upstream request. Only the first caller gets them.
    pub fn take_extensions(&self) -> http::Extensions {
        self.extensions.lock().unwrap().take().unwrap_or_default()
    }

    /// Builds a detached request for unit tests and internal callers that
    /// need a request without a live connection.
    pub(crate) fn synthetic(
        method: Method,
        url: Url,
        raw_headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        let hostname = url.host_str().unwrap_or("localhost").to_string();
        let port = url
            .port()
            .unwrap_or_else(|| util::default_port(url.scheme()));
        let mut headers = HeaderMap::new();
        for (name, value) in &raw_headers {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        OngoingRequest {
            id: Uuid::new_v4(),
            timing: TimingEvents::new(),
            method,
            version: Version::HTTP_11,
            scheme: url.scheme().to_string(),
            destination: Destination { hostname, port },
            url,
            headers,
            raw_headers,
            peer_addr: None,
            keep_alive: true,
            body: BodyHandle::from_bytes(body),
            tags: Mutex::new(Vec::new()),
            matched_rule_id: OnceLock::new(),
            extensions: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id,
            method: self.method.to_string(),
            url: self.url.to_string(),
            path: self.url.path().to_string(),
            scheme: self.scheme.clone(),
            hostname: self.destination.hostname.clone(),
            port: self.destination.port,
            headers: self.raw_headers.clone(),
            peer_addr: self.peer_addr,
            tags: self.tags(),
            matched_rule_id: self.matched_rule(),
            timing: self.timing.clone(),
        }
    }
}

/// Builds the canonical absolute URL for a request, regardless of whether it
/// arrived in absolute form (explicit proxying) or origin form (transparent
/// interception). The scheme comes from the socket unless the request said
/// otherwise.
pub fn canonical_url(
    uri: &Uri,
    headers: &HeaderMap,
    socket_scheme: &str,
    connect_authority: Option<&str>,
) -> Result<Url, Error> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).map_err(|err| UrlInvalid(err.to_string()));
    }

    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .or_else(|| connect_authority.map(|a| a.to_string()))
        .ok_or(MissingAuthority)?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let absolute = format!("{}://{}{}", socket_scheme, authority, path_and_query);
    Url::parse(&absolute).map_err(|err| UrlInvalid(err.to_string()))
}

fn detect_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    match version {
        Version::HTTP_10 => connection.contains("keep-alive"),
        Version::HTTP_2 | Version::HTTP_3 => true,
        _ => !connection.contains("close"),
    }
}

/// Body of a synthesised or mirrored response.
pub enum ResponseBody {
    Full(Bytes),
    Boxed(BoxBody<Bytes, hyper::Error>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Full(Bytes::new())
    }

    pub fn len(&self) -> Option<u64> {
        match self {
            ResponseBody::Full(bytes) => Some(bytes.len() as u64),
            ResponseBody::Boxed(_) => None,
        }
    }

    pub fn into_boxed(self) -> BoxBody<Bytes, hyper::Error> {
        match self {
            ResponseBody::Full(bytes) => {
                if bytes.is_empty() {
                    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
                } else {
                    Full::new(bytes).map_err(|never| match never {}).boxed()
                }
            }
            ResponseBody::Boxed(body) => body,
        }
    }
}

/// A response a step produced, not yet written to the wire.
pub struct ProxyResponse {
    pub status: http::StatusCode,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
    pub trailers: Option<HeaderMap>,
}

impl ProxyResponse {
    pub fn new(status: http::StatusCode) -> Self {
        ProxyResponse {
            status,
            status_message: None,
            headers: Vec::new(),
            body: ResponseBody::empty(),
            trailers: None,
        }
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_url_from_origin_form() {
        let uri: Uri = "/some/path?q=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "example.com:8080".parse().unwrap());

        let url = canonical_url(&uri, &headers, "http", None).unwrap();

        assert_eq!(url.as_str(), "http://example.com:8080/some/path?q=1");
    }

    #[test]
    fn canonical_url_prefers_absolute_form() {
        let uri: Uri = "http://other.test/abs".parse().unwrap();
        let headers = HeaderMap::new();

        let url = canonical_url(&uri, &headers, "https", None).unwrap();

        assert_eq!(url.as_str(), "http://other.test/abs");
    }

    #[test]
    fn canonical_url_falls_back_to_connect_authority() {
        let uri: Uri = "/".parse().unwrap();
        let headers = HeaderMap::new();

        let url = canonical_url(&uri, &headers, "https", Some("tunnel.test:8443")).unwrap();

        assert_eq!(url.as_str(), "https://tunnel.test:8443/");
    }

    #[test]
    fn canonical_url_requires_some_authority() {
        let uri: Uri = "/".parse().unwrap();
        let headers = HeaderMap::new();

        assert!(canonical_url(&uri, &headers, "http", None).is_err());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let empty = HeaderMap::new();
        assert!(detect_keep_alive(Version::HTTP_11, &empty));
        assert!(!detect_keep_alive(Version::HTTP_10, &empty));
        assert!(detect_keep_alive(Version::HTTP_2, &empty));

        let mut close = HeaderMap::new();
        close.insert(http::header::CONNECTION, "close".parse().unwrap());
        assert!(!detect_keep_alive(Version::HTTP_11, &close));

        let mut ka = HeaderMap::new();
        ka.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(detect_keep_alive(Version::HTTP_10, &ka));
    }

    #[tokio::test]
    async fn buffered_body_raw_and_decoded_views() {
        let plain = b"view me";
        let encoded = crate::common::util::encode_body(Some("gzip"), plain).unwrap();
        let handle = BodyHandle::from_bytes(encoded.clone());

        assert_eq!(handle.raw().await.unwrap(), encoded);
        assert_eq!(&handle.decoded(Some("gzip")).await.unwrap()[..], plain);
    }
}
