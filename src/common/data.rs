use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializes binary bodies as base64 so definitions stay JSON-safe.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A match-replace pattern: either a literal (replacing the first occurrence)
/// or a regex with flags (`g` switches to replace-all, the rest are inline
/// regex flags).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum MatchPattern {
    Literal(String),
    Regex {
        #[serde(rename = "regexSource")]
        source: String,
        #[serde(default)]
        flags: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MatchReplacePair {
    pub pattern: MatchPattern,
    pub replacement: String,
}

impl MatchReplacePair {
    pub fn literal<S: Into<String>>(pattern: S, replacement: S) -> Self {
        MatchReplacePair {
            pattern: MatchPattern::Literal(pattern.into()),
            replacement: replacement.into(),
        }
    }

    pub fn regex<S: Into<String>>(source: S, flags: S, replacement: S) -> Self {
        MatchReplacePair {
            pattern: MatchPattern::Regex {
                source: source.into(),
                flags: flags.into(),
            },
            replacement: replacement.into(),
        }
    }
}

/// Controls how the `Host` / `:authority` header follows a host rewrite.
/// Serialized as `true`, `false` or a verbatim replacement string.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum UpdateHostHeader {
    #[default]
    True,
    False,
    Custom(String),
}

impl From<bool> for UpdateHostHeader {
    fn from(v: bool) -> Self {
        if v {
            UpdateHostHeader::True
        } else {
            UpdateHostHeader::False
        }
    }
}

impl Serialize for UpdateHostHeader {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UpdateHostHeader::True => serializer.serialize_bool(true),
            UpdateHostHeader::False => serializer.serialize_bool(false),
            UpdateHostHeader::Custom(value) => serializer.serialize_str(value),
        }
    }
}

impl<'de> Deserialize<'de> for UpdateHostHeader {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Custom(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => UpdateHostHeader::from(flag),
            Raw::Custom(value) => UpdateHostHeader::Custom(value),
        })
    }
}

/// One RFC 6902 JSON-Patch operation.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum JsonPatchOp {
    Add { path: String, value: serde_json::Value },
    Remove { path: String },
    Replace { path: String, value: serde_json::Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: serde_json::Value },
}

/// Declarative mutation of the upstream request, applied in a fixed order:
/// protocol, host, host header, path, query, headers, body.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestTransform {
    pub set_protocol: Option<String>,
    /// `host[:port]`; mutually exclusive with `match_replace_host`.
    pub replace_host: Option<String>,
    pub match_replace_host: Vec<MatchReplacePair>,
    pub update_host_header: UpdateHostHeader,
    pub match_replace_path: Vec<MatchReplacePair>,
    pub match_replace_query: Vec<MatchReplacePair>,
    /// `(name, Some(value))` sets, `(name, None)` removes.
    pub update_headers: Vec<(String, Option<String>)>,
    /// Replaces the full header set; defaults are dropped first.
    pub replace_headers: Option<Vec<(String, String)>>,
    #[serde(with = "option_base64", skip_serializing_if = "Option::is_none")]
    pub replace_body: Option<Bytes>,
    pub replace_body_from_file: Option<std::path::PathBuf>,
    pub update_json_body: Option<serde_json::Value>,
    pub patch_json_body: Option<Vec<JsonPatchOp>>,
    pub match_replace_body: Vec<MatchReplacePair>,
}

mod option_base64 {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => super::base64_bytes::serialize(b, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                use base64::{engine::general_purpose::STANDARD, Engine};
                STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// Declarative mutation of the mirrored response.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseTransform {
    pub set_status: Option<u16>,
    pub update_headers: Vec<(String, Option<String>)>,
    pub replace_headers: Option<Vec<(String, String)>>,
    #[serde(with = "option_base64", skip_serializing_if = "Option::is_none")]
    pub replace_body: Option<Bytes>,
    pub replace_body_from_file: Option<std::path::PathBuf>,
    pub update_json_body: Option<serde_json::Value>,
    pub patch_json_body: Option<Vec<JsonPatchOp>>,
    pub match_replace_body: Vec<MatchReplacePair>,
}

impl RequestTransform {
    pub fn has_body_transform(&self) -> bool {
        self.replace_body.is_some()
            || self.replace_body_from_file.is_some()
            || self.update_json_body.is_some()
            || self.patch_json_body.is_some()
            || !self.match_replace_body.is_empty()
    }
}

impl ResponseTransform {
    pub fn has_body_transform(&self) -> bool {
        self.replace_body.is_some()
            || self.replace_body_from_file.is_some()
            || self.update_json_body.is_some()
            || self.patch_json_body.is_some()
            || !self.match_replace_body.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.set_status.is_none()
            && self.update_headers.is_empty()
            && self.replace_headers.is_none()
            && !self.has_body_transform()
    }
}

/// One upstream proxy to route passthrough traffic over.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySetting {
    /// `http://`, `https://`, `socks4://`, `socks4a://`, `socks5://` or
    /// `socks5h://` URL, optionally carrying userinfo credentials.
    pub proxy_url: String,
    /// Hosts to bypass: a domain (matches subdomains), `domain:port`, or a
    /// bare IP. A leading `.` or `*.` is stripped.
    pub no_proxy: Vec<String>,
    /// Replaces the trust roots used to verify the proxy and upstream.
    /// Mutually exclusive with `additional_trusted_cas`.
    pub trusted_cas: Option<Vec<String>>,
    /// PEM CAs appended to the system roots.
    pub additional_trusted_cas: Option<Vec<String>>,
}

impl ProxySetting {
    pub fn new<S: Into<String>>(proxy_url: S) -> Self {
        ProxySetting {
            proxy_url: proxy_url.into(),
            ..Default::default()
        }
    }
}

pub type ProxyCallback =
    std::sync::Arc<dyn Fn(&str) -> Option<ProxySetting> + Send + Sync + 'static>;

/// Proxy configuration source, resolved per request. A list is walked in
/// order and the first entry producing a setting wins.
#[derive(Clone)]
pub enum ProxyConfig {
    Setting(ProxySetting),
    Callback(ProxyCallback),
    List(Vec<ProxyConfig>),
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyConfig::Setting(s) => f.debug_tuple("Setting").field(s).finish(),
            ProxyConfig::Callback(_) => f.write_str("Callback(..)"),
            ProxyConfig::List(l) => f.debug_tuple("List").field(l).finish(),
        }
    }
}

impl ProxyConfig {
    /// Resolves the effective setting for a hostname, skipping entries whose
    /// `no_proxy` list covers the target.
    pub fn resolve(&self, hostname: &str, port: u16) -> Option<ProxySetting> {
        match self {
            ProxyConfig::Setting(setting) => {
                if crate::server::passthrough::agent::no_proxy_matches(
                    &setting.no_proxy,
                    hostname,
                    port,
                ) {
                    None
                } else {
                    Some(setting.clone())
                }
            }
            ProxyConfig::Callback(cb) => {
                let setting = cb(hostname)?;
                if crate::server::passthrough::agent::no_proxy_matches(
                    &setting.no_proxy,
                    hostname,
                    port,
                ) {
                    None
                } else {
                    Some(setting)
                }
            }
            ProxyConfig::List(entries) => {
                entries.iter().find_map(|entry| entry.resolve(hostname, port))
            }
        }
    }
}

/// Which upstream certificate errors to tolerate.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(untagged)]
pub enum IgnoreHttpsErrors {
    #[default]
    None,
    All(bool),
    /// `host` or `host:port` entries.
    Hosts(Vec<String>),
}

impl IgnoreHttpsErrors {
    pub fn covers(&self, hostname: &str, port: u16) -> bool {
        match self {
            IgnoreHttpsErrors::None => false,
            IgnoreHttpsErrors::All(all) => *all,
            IgnoreHttpsErrors::Hosts(hosts) => hosts.iter().any(|entry| {
                let (host, entry_port) = crate::common::util::split_host_port(entry);
                host.eq_ignore_ascii_case(hostname)
                    && entry_port.map(|p| p == port).unwrap_or(true)
            }),
        }
    }
}

/// Completion policy for a rule. `Unset` defers to the list-position
/// heuristic: a rule with no checker that has handled at least one request is
/// exhausted only if a later rule also matches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionPolicy {
    Always,
    Once,
    Twice,
    Thrice,
    Times(u64),
    #[default]
    Unset,
}

impl CompletionPolicy {
    pub fn limit(&self) -> Option<u64> {
        match self {
            CompletionPolicy::Always | CompletionPolicy::Unset => None,
            CompletionPolicy::Once => Some(1),
            CompletionPolicy::Twice => Some(2),
            CompletionPolicy::Thrice => Some(3),
            CompletionPolicy::Times(n) => Some(*n),
        }
    }
}

/// Declarative request predicates. Every configured matcher must hold for a
/// rule to apply.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum MatcherConfig {
    Method {
        method: String,
    },
    Protocol {
        scheme: String,
    },
    Host {
        host: String,
    },
    Hostname {
        hostname: String,
    },
    Port {
        port: u16,
    },
    Path {
        path: String,
    },
    PathRegex {
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
    Query {
        params: Vec<(String, String)>,
    },
    Header {
        name: String,
        value: String,
    },
    HeaderExists {
        name: String,
    },
    BodyIncludes {
        content: String,
    },
    BodyEquals {
        #[serde(with = "base64_bytes")]
        content: Bytes,
    },
    BodyRegex {
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
    JsonBody {
        value: serde_json::Value,
    },
    JsonBodyIncluding {
        value: serde_json::Value,
    },
    Tag {
        tag: String,
    },
    Anything,
}

/// Webhook targets receive a POST with a request summary once the step runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub include_body: bool,
}

/// Declarative steps. Callback, stream and passthrough-with-hooks steps are
/// builder-only because they carry closures or channels.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum StepConfig {
    Reply {
        status: u16,
        #[serde(default)]
        status_message: Option<String>,
        #[serde(default)]
        headers: Option<Vec<(String, String)>>,
        #[serde(with = "base64_bytes", default = "Bytes::new")]
        body: Bytes,
        #[serde(default)]
        trailers: Option<Vec<(String, String)>>,
    },
    File {
        status: u16,
        #[serde(default)]
        headers: Option<Vec<(String, String)>>,
        path: std::path::PathBuf,
    },
    JsonRpcResponse {
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
    Passthrough(Box<PassthroughStepConfig>),
    CloseConnection,
    ResetConnection,
    Timeout,
    Delay {
        #[serde(rename = "milliseconds")]
        ms: u64,
    },
    WaitForRequestBody,
    Webhook(WebhookConfig),
}

/// The serializable part of a passthrough step. Callback hooks
/// (`before_request` / `before_response`) live on the builder.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PassthroughStepConfig {
    pub transform_request: Option<RequestTransform>,
    pub transform_response: Option<ResponseTransform>,
    #[serde(skip)]
    pub proxy: Option<ProxyConfig>,
    pub ignore_host_https_errors: IgnoreHttpsErrors,
    pub trusted_cas: Option<Vec<String>>,
    pub additional_trusted_cas: Option<Vec<String>>,
    pub simulate_connection_errors: bool,
    pub dns: Option<DnsConfig>,
}

/// Resolver tuning for passthrough DNS lookups.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    #[serde(with = "humantime_ms", skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<Duration>,
    #[serde(with = "humantime_ms", skip_serializing_if = "Option::is_none")]
    pub error_ttl: Option<Duration>,
    pub servers: Option<Vec<std::net::IpAddr>>,
}

mod humantime_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// A complete declarative rule, compilable into a live [`crate::RuleSpec`].
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    #[serde(default)]
    pub priority: i32,
    pub matchers: Vec<MatcherConfig>,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub completion: CompletionPolicy,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rule_definition_round_trips_through_json() {
        // Arrange
        let definition = RuleDefinition {
            priority: 5,
            matchers: vec![
                MatcherConfig::Method {
                    method: "GET".to_string(),
                },
                MatcherConfig::Path {
                    path: "/hi".to_string(),
                },
            ],
            steps: vec![StepConfig::Reply {
                status: 200,
                status_message: None,
                headers: None,
                body: Bytes::from_static(b"ok"),
                trailers: None,
            }],
            completion: CompletionPolicy::Once,
        };

        // Act
        let json = serde_json::to_string(&definition).unwrap();
        let parsed: RuleDefinition = serde_json::from_str(&json).unwrap();

        // Assert
        assert_eq!(parsed.priority, 5);
        assert_eq!(parsed.matchers.len(), 2);
        assert!(json.contains("\"b2s=\"")); // "ok" as base64
        assert_eq!(parsed.completion, CompletionPolicy::Once);
    }

    #[test]
    fn ignore_https_errors_host_matching() {
        let cfg = IgnoreHttpsErrors::Hosts(vec![
            "self-signed.test".to_string(),
            "pinned.test:8443".to_string(),
        ]);
        assert!(cfg.covers("self-signed.test", 443));
        assert!(cfg.covers("self-signed.test", 9999));
        assert!(cfg.covers("pinned.test", 8443));
        assert!(!cfg.covers("pinned.test", 443));
        assert!(!cfg.covers("other.test", 443));
    }

    #[test]
    fn completion_policy_limits() {
        assert_eq!(CompletionPolicy::Once.limit(), Some(1));
        assert_eq!(CompletionPolicy::Thrice.limit(), Some(3));
        assert_eq!(CompletionPolicy::Times(7).limit(), Some(7));
        assert_eq!(CompletionPolicy::Always.limit(), None);
        assert_eq!(CompletionPolicy::Unset.limit(), None);
    }
}
