use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

use crate::common::data::MatcherConfig;
use crate::server::intake::OngoingRequest;

#[derive(Error, Debug)]
pub enum Error {
    #[error("matcher cannot read request body: {0}")]
    BodyError(#[from] crate::server::intake::Error),
    #[error("custom matcher failed: {0}")]
    CallbackError(String),
}

/// A pure predicate on a request. `explain` renders the requirement for
/// diagnostics on unmatched requests.
#[async_trait]
pub trait Matcher: Send + Sync {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error>;
    fn explain(&self) -> String;
}

pub struct MethodMatcher {
    pub method: String,
}

#[async_trait]
impl Matcher for MethodMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.method.as_str().eq_ignore_ascii_case(&self.method))
    }

    fn explain(&self) -> String {
        format!("making {}s", self.method.to_uppercase())
    }
}

pub struct ProtocolMatcher {
    pub scheme: String,
}

#[async_trait]
impl Matcher for ProtocolMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.scheme.eq_ignore_ascii_case(&self.scheme))
    }

    fn explain(&self) -> String {
        format!("for {}", self.scheme)
    }
}

/// Matches `host[:port]` against the request destination.
pub struct HostMatcher {
    pub host: String,
}

#[async_trait]
impl Matcher for HostMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let (hostname, port) = crate::common::util::split_host_port(&self.host);
        let hostname_matches = req
            .destination
            .hostname
            .eq_ignore_ascii_case(&hostname);
        Ok(match port {
            Some(port) => hostname_matches && req.destination.port == port,
            None => hostname_matches,
        })
    }

    fn explain(&self) -> String {
        format!("for host {}", self.host)
    }
}

pub struct HostnameMatcher {
    pub hostname: String,
}

#[async_trait]
impl Matcher for HostnameMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req
            .destination
            .hostname
            .eq_ignore_ascii_case(&self.hostname))
    }

    fn explain(&self) -> String {
        format!("for hostname {}", self.hostname)
    }
}

pub struct PortMatcher {
    pub port: u16,
}

#[async_trait]
impl Matcher for PortMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.destination.port == self.port)
    }

    fn explain(&self) -> String {
        format!("for port {}", self.port)
    }
}

pub struct PathMatcher {
    pub path: String,
}

#[async_trait]
impl Matcher for PathMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.url.path() == self.path)
    }

    fn explain(&self) -> String {
        format!("for {}", self.path)
    }
}

pub struct PathRegexMatcher {
    pub regex: Regex,
}

#[async_trait]
impl Matcher for PathRegexMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(self.regex.is_match(req.url.path()))
    }

    fn explain(&self) -> String {
        format!("for paths matching /{}/", self.regex)
    }
}

/// The request query must contain every configured parameter with the given
/// value; extra parameters are allowed.
pub struct QueryMatcher {
    pub params: Vec<(String, String)>,
}

#[async_trait]
impl Matcher for QueryMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let actual: Vec<(String, String)> =
            form_urlencoded::parse(req.url.query().unwrap_or("").as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        Ok(self
            .params
            .iter()
            .all(|(name, value)| actual.iter().any(|(n, v)| n == name && v == value)))
    }

    fn explain(&self) -> String {
        let rendered: Vec<String> = self
            .params
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect();
        format!("with query {}", rendered.join("&"))
    }
}

pub struct HeaderMatcher {
    pub name: String,
    pub value: String,
}

#[async_trait]
impl Matcher for HeaderMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(crate::common::util::find_header_values(&req.raw_headers, &self.name)
            .any(|v| v == self.value))
    }

    fn explain(&self) -> String {
        format!("with header {}: {}", self.name, self.value)
    }
}

pub struct HeaderExistsMatcher {
    pub name: String,
}

#[async_trait]
impl Matcher for HeaderExistsMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.header(&self.name).is_some())
    }

    fn explain(&self) -> String {
        format!("with a {} header", self.name)
    }
}

pub struct BodyIncludesMatcher {
    pub content: String,
}

#[async_trait]
impl Matcher for BodyIncludesMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let body = req.decoded_body().await?;
        Ok(String::from_utf8_lossy(&body).contains(&self.content))
    }

    fn explain(&self) -> String {
        format!("with a body including {:?}", self.content)
    }
}

pub struct BodyEqualsMatcher {
    pub content: Bytes,
}

#[async_trait]
impl Matcher for BodyEqualsMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.decoded_body().await? == self.content)
    }

    fn explain(&self) -> String {
        format!("with a {} byte body", self.content.len())
    }
}

pub struct BodyRegexMatcher {
    pub regex: Regex,
}

#[async_trait]
impl Matcher for BodyRegexMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let body = req.decoded_body().await?;
        Ok(self.regex.is_match(&String::from_utf8_lossy(&body)))
    }

    fn explain(&self) -> String {
        format!("with a body matching /{}/", self.regex)
    }
}

pub struct JsonBodyMatcher {
    pub value: serde_json::Value,
}

#[async_trait]
impl Matcher for JsonBodyMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let body = req.decoded_body().await?;
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(actual) => Ok(actual == self.value),
            Err(_) => Ok(false),
        }
    }

    fn explain(&self) -> String {
        format!("with a JSON body equivalent to {}", self.value)
    }
}

/// Structural subset match: every key/element in the expectation must appear
/// in the request body with the same value; extra fields are allowed.
pub struct JsonBodyIncludingMatcher {
    pub value: serde_json::Value,
}

pub(crate) fn json_includes(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected.iter().all(|(key, value)| {
            actual
                .get(key)
                .map(|actual_value| json_includes(actual_value, value))
                .unwrap_or(false)
        }),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|value| actual.iter().any(|actual_value| json_includes(actual_value, value))),
        (actual, expected) => actual == expected,
    }
}

#[async_trait]
impl Matcher for JsonBodyIncludingMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        let body = req.decoded_body().await?;
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(actual) => Ok(json_includes(&actual, &self.value)),
            Err(_) => Ok(false),
        }
    }

    fn explain(&self) -> String {
        format!("with a JSON body including {}", self.value)
    }
}

pub struct TagMatcher {
    pub tag: String,
}

#[async_trait]
impl Matcher for TagMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        Ok(req.tags().iter().any(|t| t == &self.tag))
    }

    fn explain(&self) -> String {
        format!("tagged {:?}", self.tag)
    }
}

pub struct AnythingMatcher;

#[async_trait]
impl Matcher for AnythingMatcher {
    async fn matches(&self, _req: &OngoingRequest) -> Result<bool, Error> {
        Ok(true)
    }

    fn explain(&self) -> String {
        "for anything".to_string()
    }
}

pub type MatcherCallback =
    Arc<dyn for<'a> Fn(&'a OngoingRequest) -> BoxFuture<'a, Result<bool, String>> + Send + Sync>;

/// User-supplied predicate; builder-only since it carries a closure.
pub struct CallbackMatcher {
    pub callback: MatcherCallback,
    pub description: String,
}

#[async_trait]
impl Matcher for CallbackMatcher {
    async fn matches(&self, req: &OngoingRequest) -> Result<bool, Error> {
        (self.callback)(req).await.map_err(Error::CallbackError)
    }

    fn explain(&self) -> String {
        self.description.clone()
    }
}

/// Compiles a declarative matcher config into a live matcher.
pub fn from_config(config: MatcherConfig) -> Box<dyn Matcher> {
    match config {
        MatcherConfig::Method { method } => Box::new(MethodMatcher { method }),
        MatcherConfig::Protocol { scheme } => Box::new(ProtocolMatcher { scheme }),
        MatcherConfig::Host { host } => Box::new(HostMatcher { host }),
        MatcherConfig::Hostname { hostname } => Box::new(HostnameMatcher { hostname }),
        MatcherConfig::Port { port } => Box::new(PortMatcher { port }),
        MatcherConfig::Path { path } => Box::new(PathMatcher { path }),
        MatcherConfig::PathRegex { regex } => Box::new(PathRegexMatcher { regex }),
        MatcherConfig::Query { params } => Box::new(QueryMatcher { params }),
        MatcherConfig::Header { name, value } => Box::new(HeaderMatcher { name, value }),
        MatcherConfig::HeaderExists { name } => Box::new(HeaderExistsMatcher { name }),
        MatcherConfig::BodyIncludes { content } => Box::new(BodyIncludesMatcher { content }),
        MatcherConfig::BodyEquals { content } => Box::new(BodyEqualsMatcher { content }),
        MatcherConfig::BodyRegex { regex } => Box::new(BodyRegexMatcher { regex }),
        MatcherConfig::JsonBody { value } => Box::new(JsonBodyMatcher { value }),
        MatcherConfig::JsonBodyIncluding { value } => Box::new(JsonBodyIncludingMatcher { value }),
        MatcherConfig::Tag { tag } => Box::new(TagMatcher { tag }),
        MatcherConfig::Anything => Box::new(AnythingMatcher),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_includes_checks_structural_subsets() {
        let actual = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2, 3]});

        assert!(json_includes(&actual, &json!({"a": 1})));
        assert!(json_includes(&actual, &json!({"b": {"d": 3}})));
        assert!(json_includes(&actual, &json!({"list": [3, 1]})));
        assert!(!json_includes(&actual, &json!({"a": 2})));
        assert!(!json_includes(&actual, &json!({"missing": 1})));
        assert!(!json_includes(&actual, &json!({"list": [4]})));
    }

    #[test]
    fn explanations_read_naturally() {
        let m = MethodMatcher {
            method: "get".to_string(),
        };
        assert_eq!(m.explain(), "making GETs");

        let p = PathMatcher {
            path: "/hi".to_string(),
        };
        assert_eq!(p.explain(), "for /hi");
    }
}
