use bytes::Bytes;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::common::data::{
    JsonPatchOp, MatchPattern, MatchReplacePair, RequestTransform, ResponseTransform,
    UpdateHostHeader,
};
use crate::common::util;

use self::Error::{
    BodyNotText, ConflictingTransforms, FileError, JsonError, PatchError, RegexInvalid,
    UrlRewriteError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid transform regex {source_text:?}: {message}")]
    RegexInvalid { source_text: String, message: String },
    #[error("replaceHost and matchReplaceHost are mutually exclusive")]
    ConflictingTransforms,
    #[error("cannot rewrite URL: {0}")]
    UrlRewriteError(String),
    #[error("matchReplaceBody requires a text-decodable body")]
    BodyNotText,
    #[error("body is not valid JSON: {0}")]
    JsonError(String),
    #[error("JSON patch failed: {0}")]
    PatchError(String),
    #[error("cannot read replacement body file: {0}")]
    FileError(std::io::Error),
}

/// Applies an ordered match-replace list. Literal patterns replace the first
/// occurrence; regex patterns honour their flags (`g` meaning replace-all)
/// and `$1`..`$9` back-references.
pub fn apply_match_replace(input: &str, pairs: &[MatchReplacePair]) -> Result<String, Error> {
    let mut current = input.to_string();
    for pair in pairs {
        current = match &pair.pattern {
            MatchPattern::Literal(pattern) => current.replacen(pattern, &pair.replacement, 1),
            MatchPattern::Regex { source, flags } => {
                let regex = build_regex(source, flags)?;
                let replacement = brace_backrefs(&pair.replacement);
                if flags.contains('g') {
                    regex.replace_all(&current, replacement.as_str()).to_string()
                } else {
                    regex.replace(&current, replacement.as_str()).to_string()
                }
            }
        };
    }
    Ok(current)
}

fn build_regex(source: &str, flags: &str) -> Result<Regex, Error> {
    let inline: String = flags.chars().filter(|c| "imsx".contains(*c)).collect();
    let pattern = if inline.is_empty() {
        source.to_string()
    } else {
        format!("(?{}){}", inline, source)
    };
    Regex::new(&pattern).map_err(|err| RegexInvalid {
        source_text: source.to_string(),
        message: err.to_string(),
    })
}

/// `$1` is ambiguous to the regex crate when followed by more word
/// characters, so digit back-references become `${n}`.
fn brace_backrefs(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if let Some(digit) = chars.peek().filter(|c| c.is_ascii_digit()).copied() {
                chars.next();
                out.push_str(&format!("${{{}}}", digit));
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// How the `Host` / `:authority` header should be handled after URL
/// rewriting.
#[derive(Debug, Clone, PartialEq)]
pub enum HostHeaderAction {
    /// Leave whatever the client sent.
    Keep,
    /// Replace with this value.
    Set(String),
}

pub struct ResolvedTarget {
    pub url: Url,
    pub host_header: HostHeaderAction,
}

/// Resolves the effective upstream URL by applying the request transform's
/// URL parts in their fixed order: protocol, host, path, query.
pub fn resolve_destination(
    original: &Url,
    transform: Option<&RequestTransform>,
) -> Result<ResolvedTarget, Error> {
    let mut url = original.clone();

    let Some(transform) = transform else {
        return Ok(ResolvedTarget {
            url,
            host_header: HostHeaderAction::Keep,
        });
    };

    if transform.replace_host.is_some() && !transform.match_replace_host.is_empty() {
        return Err(ConflictingTransforms);
    }

    if let Some(scheme) = &transform.set_protocol {
        // A port the client never spelled out stays defaulted, so it tracks
        // the new scheme automatically; url::Url keeps explicit ports.
        url.set_scheme(scheme)
            .map_err(|_| UrlRewriteError(format!("cannot set scheme to {:?}", scheme)))?;
    }

    if let Some(replacement) = &transform.replace_host {
        set_authority(&mut url, replacement)?;
    } else if !transform.match_replace_host.is_empty() {
        let current = authority_of(&url);
        let rewritten = apply_match_replace(&current, &transform.match_replace_host)?;
        set_authority(&mut url, &rewritten)?;
    }

    if !transform.match_replace_path.is_empty() {
        let rewritten = apply_match_replace(url.path(), &transform.match_replace_path)?;
        url.set_path(&rewritten);
    }

    if !transform.match_replace_query.is_empty() {
        let rewritten = apply_match_replace(url.query().unwrap_or(""), &transform.match_replace_query)?;
        url.set_query(if rewritten.is_empty() {
            None
        } else {
            Some(&rewritten)
        });
    }

    let host_changed = url.host_str() != original.host_str()
        || url.port_or_known_default() != original.port_or_known_default();

    let host_header = match &transform.update_host_header {
        UpdateHostHeader::Custom(value) => HostHeaderAction::Set(value.clone()),
        UpdateHostHeader::False => HostHeaderAction::Keep,
        UpdateHostHeader::True => {
            if host_changed {
                let hostname = url.host_str().unwrap_or_default().trim_matches(|c| c == '[' || c == ']');
                let port = url
                    .port()
                    .unwrap_or_else(|| util::default_port(url.scheme()));
                HostHeaderAction::Set(util::format_host_header(hostname, port, url.scheme()))
            } else {
                HostHeaderAction::Keep
            }
        }
    };

    Ok(ResolvedTarget { url, host_header })
}

fn authority_of(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    }
}

fn set_authority(url: &mut Url, authority: &str) -> Result<(), Error> {
    let (host, port) = util::split_host_port(authority);
    url.set_host(Some(&host))
        .map_err(|err| UrlRewriteError(format!("invalid host {:?}: {}", host, err)))?;
    url.set_port(port)
        .map_err(|_| UrlRewriteError(format!("invalid port in {:?}", authority)))?;
    Ok(())
}

/// Merges `patch` into `target`. Null values in the patch remove the key,
/// objects merge recursively, everything else overwrites.
pub fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;

    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Some(target_map) = target.as_object_mut() else {
        unreachable!()
    };

    for (key, value) in patch_map {
        match value {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(_) => {
                let slot = target_map
                    .entry(key.clone())
                    .or_insert(Value::Object(serde_json::Map::new()));
                merge_json(slot, value);
            }
            other => {
                target_map.insert(key.clone(), other.clone());
            }
        }
    }
}

fn split_pointer(path: &str) -> Result<Vec<String>, Error> {
    if path.is_empty() {
        return Ok(vec![]);
    }
    if !path.starts_with('/') {
        return Err(PatchError(format!("pointer {:?} must start with '/'", path)));
    }
    Ok(path[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn pointer_get(value: &serde_json::Value, tokens: &[String]) -> Result<serde_json::Value, Error> {
    let mut current = value;
    for token in tokens {
        current = match current {
            serde_json::Value::Object(map) => map
                .get(token)
                .ok_or_else(|| PatchError(format!("missing key {:?}", token)))?,
            serde_json::Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| PatchError(format!("bad array index {:?}", token)))?;
                items
                    .get(index)
                    .ok_or_else(|| PatchError(format!("index {} out of bounds", index)))?
            }
            _ => return Err(PatchError(format!("cannot traverse into {:?}", token))),
        };
    }
    Ok(current.clone())
}

fn pointer_insert(
    value: &mut serde_json::Value,
    tokens: &[String],
    new_value: serde_json::Value,
    replace: bool,
) -> Result<(), Error> {
    if tokens.is_empty() {
        *value = new_value;
        return Ok(());
    }
    let (last, parents) = tokens.split_last().unwrap();
    let parent = navigate_mut(value, parents)?;
    match parent {
        serde_json::Value::Object(map) => {
            if replace && !map.contains_key(last) {
                return Err(PatchError(format!("cannot replace missing key {:?}", last)));
            }
            map.insert(last.clone(), new_value);
        }
        serde_json::Value::Array(items) => {
            if last == "-" {
                items.push(new_value);
            } else {
                let index: usize = last
                    .parse()
                    .map_err(|_| PatchError(format!("bad array index {:?}", last)))?;
                if replace {
                    if index >= items.len() {
                        return Err(PatchError(format!("index {} out of bounds", index)));
                    }
                    items[index] = new_value;
                } else {
                    if index > items.len() {
                        return Err(PatchError(format!("index {} out of bounds", index)));
                    }
                    items.insert(index, new_value);
                }
            }
        }
        _ => return Err(PatchError("patch target parent is a scalar".to_string())),
    }
    Ok(())
}

fn pointer_remove(value: &mut serde_json::Value, tokens: &[String]) -> Result<serde_json::Value, Error> {
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| PatchError("cannot remove the document root".to_string()))?;
    let parent = navigate_mut(value, parents)?;
    match parent {
        serde_json::Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError(format!("missing key {:?}", last))),
        serde_json::Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| PatchError(format!("bad array index {:?}", last)))?;
            if index >= items.len() {
                return Err(PatchError(format!("index {} out of bounds", index)));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError("patch target parent is a scalar".to_string())),
    }
}

fn navigate_mut<'a>(
    value: &'a mut serde_json::Value,
    tokens: &[String],
) -> Result<&'a mut serde_json::Value, Error> {
    let mut current = value;
    for token in tokens {
        current = match current {
            serde_json::Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError(format!("missing key {:?}", token)))?,
            serde_json::Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| PatchError(format!("bad array index {:?}", token)))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError(format!("index {} out of bounds", index)))?
            }
            _ => return Err(PatchError(format!("cannot traverse into {:?}", token))),
        };
    }
    Ok(current)
}

/// Applies an RFC 6902 patch document in place.
pub fn apply_json_patch(target: &mut serde_json::Value, ops: &[JsonPatchOp]) -> Result<(), Error> {
    for op in ops {
        match op {
            JsonPatchOp::Add { path, value } => {
                pointer_insert(target, &split_pointer(path)?, value.clone(), false)?;
            }
            JsonPatchOp::Remove { path } => {
                pointer_remove(target, &split_pointer(path)?)?;
            }
            JsonPatchOp::Replace { path, value } => {
                pointer_insert(target, &split_pointer(path)?, value.clone(), true)?;
            }
            JsonPatchOp::Move { from, path } => {
                let value = pointer_remove(target, &split_pointer(from)?)?;
                pointer_insert(target, &split_pointer(path)?, value, false)?;
            }
            JsonPatchOp::Copy { from, path } => {
                let value = pointer_get(target, &split_pointer(from)?)?;
                pointer_insert(target, &split_pointer(path)?, value, false)?;
            }
            JsonPatchOp::Test { path, value } => {
                let actual = pointer_get(target, &split_pointer(path)?)?;
                if &actual != value {
                    return Err(PatchError(format!(
                        "test failed at {:?}: {} != {}",
                        path, actual, value
                    )));
                }
            }
        }
    }
    Ok(())
}

/// The body-mutating subset shared by request and response transforms.
pub struct BodyTransformSpec<'a> {
    pub replace_body: Option<&'a Bytes>,
    pub replace_body_from_file: Option<&'a std::path::Path>,
    pub update_json_body: Option<&'a serde_json::Value>,
    pub patch_json_body: Option<&'a [JsonPatchOp]>,
    pub match_replace_body: &'a [MatchReplacePair],
}

impl RequestTransform {
    pub fn body_spec(&self) -> BodyTransformSpec<'_> {
        BodyTransformSpec {
            replace_body: self.replace_body.as_ref(),
            replace_body_from_file: self.replace_body_from_file.as_deref(),
            update_json_body: self.update_json_body.as_ref(),
            patch_json_body: self.patch_json_body.as_deref(),
            match_replace_body: &self.match_replace_body,
        }
    }
}

impl ResponseTransform {
    pub fn body_spec(&self) -> BodyTransformSpec<'_> {
        BodyTransformSpec {
            replace_body: self.replace_body.as_ref(),
            replace_body_from_file: self.replace_body_from_file.as_deref(),
            update_json_body: self.update_json_body.as_ref(),
            patch_json_body: self.patch_json_body.as_deref(),
            match_replace_body: &self.match_replace_body,
        }
    }
}

/// Applies body mutations to a decoded body, in order: replacement, JSON
/// merge, JSON patch, match-replace.
pub async fn apply_body_transform(
    decoded: Bytes,
    spec: &BodyTransformSpec<'_>,
) -> Result<Bytes, Error> {
    let mut body = if let Some(replacement) = spec.replace_body {
        replacement.clone()
    } else if let Some(path) = spec.replace_body_from_file {
        Bytes::from(tokio::fs::read(path).await.map_err(FileError)?)
    } else {
        decoded
    };

    if let Some(patch) = spec.update_json_body {
        let mut value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|err| JsonError(err.to_string()))?;
        merge_json(&mut value, patch);
        body = Bytes::from(serde_json::to_vec(&value).map_err(|err| JsonError(err.to_string()))?);
    }

    if let Some(ops) = spec.patch_json_body {
        let mut value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|err| JsonError(err.to_string()))?;
        apply_json_patch(&mut value, ops)?;
        body = Bytes::from(serde_json::to_vec(&value).map_err(|err| JsonError(err.to_string()))?);
    }

    if !spec.match_replace_body.is_empty() {
        let text = std::str::from_utf8(&body).map_err(|_| BodyNotText)?;
        let replaced = apply_match_replace(text, spec.match_replace_body)?;
        body = Bytes::from(replaced);
    }

    Ok(body)
}

/// Applies `update_headers` / `replace_headers` to an ordered header list.
/// Returns true when the defaults were replaced wholesale.
pub fn apply_header_transform(
    headers: &mut Vec<(String, String)>,
    update: &[(String, Option<String>)],
    replace: &Option<Vec<(String, String)>>,
) -> bool {
    if let Some(replacement) = replace {
        *headers = replacement.clone();
        return true;
    }
    for (name, value) in update {
        match value {
            Some(value) => util::set_header(headers, name, value),
            None => util::remove_header(headers, name),
        }
    }
    false
}

/// Corrects HTTP/1 framing after a body changed: exactly one of
/// `transfer-encoding: chunked` or an accurate `content-length` must remain.
/// HEAD and HTTP/2 messages are left untouched. Returns a warning when an
/// explicit, disagreeing length was overwritten.
pub fn fix_framing(
    headers: &mut Vec<(String, String)>,
    body_len: u64,
    is_h2: bool,
    is_head: bool,
) -> Option<String> {
    if is_h2 || is_head {
        return None;
    }

    let chunked = util::find_header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return None;
    }

    match util::find_header(headers, "content-length") {
        Some(existing) if existing == body_len.to_string() => None,
        Some(existing) => {
            let warning = format!(
                "content-length was {} but the body is {} bytes; overwriting",
                existing, body_len
            );
            util::set_header(headers, "content-length", &body_len.to_string());
            Some(warning)
        }
        None => {
            util::set_header(headers, "content-length", &body_len.to_string());
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_replace_is_order_sensitive() {
        let pairs = vec![
            MatchReplacePair::literal("a", "b"),
            MatchReplacePair::literal("b", "c"),
        ];
        assert_eq!(apply_match_replace("aaa", &pairs).unwrap(), "caa");
    }

    #[test]
    fn regex_replace_honours_global_flag_and_backrefs() {
        let global = vec![MatchReplacePair::regex("o", "g", "0")];
        assert_eq!(apply_match_replace("foo", &global).unwrap(), "f00");

        let first_only = vec![MatchReplacePair::regex("o", "", "0")];
        assert_eq!(apply_match_replace("foo", &first_only).unwrap(), "f0o");

        let backref = vec![MatchReplacePair::regex(
            "(\\w+)@example",
            "",
            "$1@internal",
        )];
        assert_eq!(
            apply_match_replace("me@example.com", &backref).unwrap(),
            "me@internal.com"
        );
    }

    #[test]
    fn resolve_destination_replaces_host_and_sets_host_header() {
        let original = Url::parse("https://origin.test/api?x=1").unwrap();
        let transform = RequestTransform {
            replace_host: Some("example.com:443".to_string()),
            ..Default::default()
        };

        let resolved = resolve_destination(&original, Some(&transform)).unwrap();

        assert_eq!(resolved.url.host_str(), Some("example.com"));
        assert_eq!(resolved.url.port_or_known_default(), Some(443));
        assert_eq!(
            resolved.host_header,
            HostHeaderAction::Set("example.com".to_string())
        );
    }

    #[test]
    fn resolve_destination_keeps_host_header_when_asked() {
        let original = Url::parse("http://origin.test/").unwrap();
        let transform = RequestTransform {
            replace_host: Some("example.com".to_string()),
            update_host_header: UpdateHostHeader::False,
            ..Default::default()
        };

        let resolved = resolve_destination(&original, Some(&transform)).unwrap();

        assert_eq!(resolved.host_header, HostHeaderAction::Keep);
    }

    #[test]
    fn resolve_destination_custom_host_header_is_verbatim() {
        let original = Url::parse("http://origin.test/").unwrap();
        let transform = RequestTransform {
            replace_host: Some("example.com".to_string()),
            update_host_header: UpdateHostHeader::Custom("spoofed.test".to_string()),
            ..Default::default()
        };

        let resolved = resolve_destination(&original, Some(&transform)).unwrap();

        assert_eq!(
            resolved.host_header,
            HostHeaderAction::Set("spoofed.test".to_string())
        );
    }

    #[test]
    fn set_protocol_rescales_only_defaulted_ports() {
        let defaulted = Url::parse("http://host.test/").unwrap();
        let transform = RequestTransform {
            set_protocol: Some("https".to_string()),
            ..Default::default()
        };
        let resolved = resolve_destination(&defaulted, Some(&transform)).unwrap();
        assert_eq!(resolved.url.port_or_known_default(), Some(443));

        let explicit = Url::parse("http://host.test:8080/").unwrap();
        let resolved = resolve_destination(&explicit, Some(&transform)).unwrap();
        assert_eq!(resolved.url.port_or_known_default(), Some(8080));
    }

    #[test]
    fn conflicting_host_transforms_are_rejected() {
        let original = Url::parse("http://host.test/").unwrap();
        let transform = RequestTransform {
            replace_host: Some("a.test".to_string()),
            match_replace_host: vec![MatchReplacePair::literal("host", "other")],
            ..Default::default()
        };
        assert!(matches!(
            resolve_destination(&original, Some(&transform)),
            Err(Error::ConflictingTransforms)
        ));
    }

    #[test]
    fn merge_json_removes_null_keys_and_merges_deeply() {
        let mut target = json!({"keep": 1, "drop": 2, "nested": {"a": 1, "b": 2}});
        merge_json(
            &mut target,
            &json!({"drop": null, "nested": {"b": 3}, "new": true}),
        );
        assert_eq!(
            target,
            json!({"keep": 1, "nested": {"a": 1, "b": 3}, "new": true})
        );
    }

    #[test]
    fn json_patch_supports_the_op_set() {
        let mut doc = json!({"a": {"b": [1, 2]}, "c": 3});
        let ops = vec![
            JsonPatchOp::Add {
                path: "/a/b/-".to_string(),
                value: json!(4),
            },
            JsonPatchOp::Replace {
                path: "/c".to_string(),
                value: json!(30),
            },
            JsonPatchOp::Copy {
                from: "/c".to_string(),
                path: "/copied".to_string(),
            },
            JsonPatchOp::Move {
                from: "/a/b/0".to_string(),
                path: "/moved".to_string(),
            },
            JsonPatchOp::Test {
                path: "/moved".to_string(),
                value: json!(1),
            },
        ];

        apply_json_patch(&mut doc, &ops).unwrap();

        assert_eq!(doc, json!({"a": {"b": [2, 4]}, "c": 30, "copied": 30, "moved": 1}));
    }

    #[test]
    fn json_patch_test_failure_aborts() {
        let mut doc = json!({"a": 1});
        let ops = vec![JsonPatchOp::Test {
            path: "/a".to_string(),
            value: json!(2),
        }];
        assert!(apply_json_patch(&mut doc, &ops).is_err());
    }

    #[tokio::test]
    async fn body_transform_applies_in_order() {
        let spec_transform = ResponseTransform {
            update_json_body: Some(json!({"added": true})),
            match_replace_body: vec![MatchReplacePair::literal("true", "false")],
            ..Default::default()
        };
        let spec = spec_transform.body_spec();

        let out = apply_body_transform(Bytes::from_static(b"{\"x\":1}"), &spec)
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value, json!({"x": 1, "added": false}));
    }

    #[test]
    fn framing_fix_sets_exact_content_length() {
        let mut headers = vec![("x".to_string(), "y".to_string())];
        assert!(fix_framing(&mut headers, 9, false, false).is_none());
        assert_eq!(util::find_header(&headers, "content-length"), Some("9"));
    }

    #[test]
    fn framing_fix_warns_on_disagreeing_length() {
        let mut headers = vec![("Content-Length".to_string(), "5".to_string())];
        let warning = fix_framing(&mut headers, 9, false, false);
        assert!(warning.is_some());
        assert_eq!(util::find_header(&headers, "content-length"), Some("9"));
    }

    #[test]
    fn framing_fix_leaves_chunked_h2_and_head_alone() {
        let mut chunked = vec![("transfer-encoding".to_string(), "chunked".to_string())];
        assert!(fix_framing(&mut chunked, 9, false, false).is_none());
        assert!(util::find_header(&chunked, "content-length").is_none());

        let mut h2 = vec![];
        assert!(fix_framing(&mut h2, 9, true, false).is_none());
        assert!(h2.is_empty());

        let mut head = vec![("content-length".to_string(), "100".to_string())];
        assert!(fix_framing(&mut head, 0, false, true).is_none());
        assert_eq!(util::find_header(&head, "content-length"), Some("100"));
    }
}
