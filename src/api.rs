//! Fluent rule construction: pick requests with `match_*` predicates, decide
//! what happens with a terminal `then_*` step, and bound repetition with a
//! completion policy.

use bytes::Bytes;
use regex::Regex;
use std::time::Duration;

use crate::common::data::{
    CompletionPolicy, PassthroughStepConfig, StepConfig, WebhookConfig,
};
use crate::server::passthrough::{PassthroughHooks, PassthroughOptions};
use crate::server::rules::matchers::{
    AnythingMatcher, BodyEqualsMatcher, BodyIncludesMatcher, BodyRegexMatcher, CallbackMatcher,
    HeaderExistsMatcher, HeaderMatcher, HostMatcher, HostnameMatcher, JsonBodyIncludingMatcher,
    JsonBodyMatcher, Matcher, MatcherCallback, MethodMatcher, PathMatcher, PathRegexMatcher,
    PortMatcher, ProtocolMatcher, QueryMatcher, TagMatcher,
};
use crate::server::rules::steps::{
    self, CallbackStep, CloseConnectionStep, DelayStep, FileStep, JsonRpcResponseStep,
    PassthroughStep, ReplyStep, ResetConnectionStep, Step, StepCallback, StreamStep, StreamWriter,
    TimeoutStep, WaitForBodyStep, WebhookStep,
};
use crate::server::rules::RuleSpec;

/// Builds one rule. Matcher calls accumulate (all must match); the first
/// terminal `then_*` call usually ends the chain, followed by `build()`.
pub struct RuleBuilder {
    priority: i32,
    completion: CompletionPolicy,
    matchers: Vec<Box<dyn Matcher>>,
    steps: Vec<Box<dyn Step>>,
    error: Option<steps::Error>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        RuleBuilder {
            priority: 0,
            completion: CompletionPolicy::Unset,
            matchers: Vec::new(),
            steps: Vec::new(),
            error: None,
        }
    }

    /// Matches `GET` requests for a path.
    pub fn get<S: Into<String>>(path: S) -> Self {
        Self::new().match_method("GET").match_path(path)
    }

    pub fn post<S: Into<String>>(path: S) -> Self {
        Self::new().match_method("POST").match_path(path)
    }

    pub fn put<S: Into<String>>(path: S) -> Self {
        Self::new().match_method("PUT").match_path(path)
    }

    pub fn delete<S: Into<String>>(path: S) -> Self {
        Self::new().match_method("DELETE").match_path(path)
    }

    /// Matches any method for a path.
    pub fn any<S: Into<String>>(path: S) -> Self {
        Self::new().match_path(path)
    }

    /// Matches every request.
    pub fn anything() -> Self {
        let mut builder = Self::new();
        builder.matchers.push(Box::new(AnythingMatcher));
        builder
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn match_method<S: Into<String>>(mut self, method: S) -> Self {
        self.matchers.push(Box::new(MethodMatcher {
            method: method.into(),
        }));
        self
    }

    pub fn match_path<S: Into<String>>(mut self, path: S) -> Self {
        self.matchers.push(Box::new(PathMatcher { path: path.into() }));
        self
    }

    pub fn match_path_regex(mut self, regex: Regex) -> Self {
        self.matchers.push(Box::new(PathRegexMatcher { regex }));
        self
    }

    /// Matches `host[:port]` of the request destination.
    pub fn match_host<S: Into<String>>(mut self, host: S) -> Self {
        self.matchers.push(Box::new(HostMatcher { host: host.into() }));
        self
    }

    pub fn match_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.matchers.push(Box::new(HostnameMatcher {
            hostname: hostname.into(),
        }));
        self
    }

    pub fn match_port(mut self, port: u16) -> Self {
        self.matchers.push(Box::new(PortMatcher { port }));
        self
    }

    pub fn match_protocol<S: Into<String>>(mut self, scheme: S) -> Self {
        self.matchers.push(Box::new(ProtocolMatcher {
            scheme: scheme.into(),
        }));
        self
    }

    pub fn match_query_param<S: Into<String>>(mut self, name: S, value: S) -> Self {
        self.matchers.push(Box::new(QueryMatcher {
            params: vec![(name.into(), value.into())],
        }));
        self
    }

    pub fn match_header<S: Into<String>>(mut self, name: S, value: S) -> Self {
        self.matchers.push(Box::new(HeaderMatcher {
            name: name.into(),
            value: value.into(),
        }));
        self
    }

    pub fn match_header_exists<S: Into<String>>(mut self, name: S) -> Self {
        self.matchers
            .push(Box::new(HeaderExistsMatcher { name: name.into() }));
        self
    }

    pub fn match_body_including<S: Into<String>>(mut self, content: S) -> Self {
        self.matchers.push(Box::new(BodyIncludesMatcher {
            content: content.into(),
        }));
        self
    }

    pub fn match_body<B: Into<Bytes>>(mut self, content: B) -> Self {
        self.matchers.push(Box::new(BodyEqualsMatcher {
            content: content.into(),
        }));
        self
    }

    pub fn match_body_regex(mut self, regex: Regex) -> Self {
        self.matchers.push(Box::new(BodyRegexMatcher { regex }));
        self
    }

    pub fn match_json_body(mut self, value: serde_json::Value) -> Self {
        self.matchers.push(Box::new(JsonBodyMatcher { value }));
        self
    }

    pub fn match_json_body_including(mut self, value: serde_json::Value) -> Self {
        self.matchers
            .push(Box::new(JsonBodyIncludingMatcher { value }));
        self
    }

    /// Matches connection tags, e.g. ones attached via SOCKS metadata.
    pub fn match_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.matchers.push(Box::new(TagMatcher { tag: tag.into() }));
        self
    }

    /// Custom predicate with a human description for diagnostics.
    pub fn matching<S: Into<String>>(mut self, description: S, callback: MatcherCallback) -> Self {
        self.matchers.push(Box::new(CallbackMatcher {
            callback,
            description: description.into(),
        }));
        self
    }

    // ---- completion ----

    /// The rule handles exactly one request.
    pub fn once(mut self) -> Self {
        self.completion = CompletionPolicy::Once;
        self
    }

    pub fn twice(mut self) -> Self {
        self.completion = CompletionPolicy::Twice;
        self
    }

    pub fn thrice(mut self) -> Self {
        self.completion = CompletionPolicy::Thrice;
        self
    }

    pub fn times(mut self, n: u64) -> Self {
        self.completion = CompletionPolicy::Times(n);
        self
    }

    /// Never exhausted, even when later rules also match.
    pub fn always(mut self) -> Self {
        self.completion = CompletionPolicy::Always;
        self
    }

    // ---- continuing steps ----

    /// Sleeps before the next step runs.
    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Box::new(DelayStep { duration }));
        self
    }

    /// Waits for the full request body before continuing.
    pub fn wait_for_body(mut self) -> Self {
        self.steps.push(Box::new(WaitForBodyStep));
        self
    }

    /// POSTs a request summary to a URL; failures are tolerated.
    pub fn with_webhook<S: Into<String>>(mut self, url: S, include_body: bool) -> Self {
        self.steps.push(Box::new(WebhookStep {
            config: WebhookConfig {
                url: url.into(),
                include_body,
            },
        }));
        self
    }

    // ---- terminal steps ----

    pub fn then_reply<B: Into<Bytes>>(mut self, status: u16, body: B) -> Self {
        self.steps.push(Box::new(ReplyStep::text(status, body.into())));
        self
    }

    pub fn then_reply_with_headers<B: Into<Bytes>>(
        mut self,
        status: u16,
        headers: Vec<(String, String)>,
        body: B,
    ) -> Self {
        self.steps.push(Box::new(ReplyStep {
            status: http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::OK),
            status_message: None,
            headers: Some(headers),
            body: body.into(),
            trailers: None,
        }));
        self
    }

    pub fn then_json(self, status: u16, value: serde_json::Value) -> Self {
        self.then_reply_with_headers(
            status,
            vec![("content-type".to_string(), "application/json".to_string())],
            serde_json::to_vec(&value).unwrap_or_default(),
        )
    }

    /// Responds from a user callback.
    pub fn then_callback(mut self, callback: StepCallback) -> Self {
        self.steps.push(Box::new(CallbackStep { callback }));
        self
    }

    /// Serves a file, re-read per request.
    pub fn then_file<P: Into<std::path::PathBuf>>(mut self, status: u16, path: P) -> Self {
        self.steps.push(Box::new(FileStep {
            status: http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::OK),
            headers: None,
            path: path.into(),
        }));
        self
    }

    /// Streams chunks written through the returned handle. Single-shot.
    pub fn then_stream(
        mut self,
        status: u16,
        headers: Option<Vec<(String, String)>>,
    ) -> (Self, StreamWriter) {
        let (step, writer) = StreamStep::new(status, headers);
        self.steps.push(Box::new(step));
        (self, writer)
    }

    pub fn then_json_rpc_result(mut self, result: serde_json::Value) -> Self {
        self.steps.push(Box::new(JsonRpcResponseStep {
            result: Some(result),
            error: None,
        }));
        self
    }

    pub fn then_json_rpc_error(mut self, error: serde_json::Value) -> Self {
        self.steps.push(Box::new(JsonRpcResponseStep {
            result: None,
            error: Some(error),
        }));
        self
    }

    /// Forwards the request to its real destination.
    pub fn then_passthrough(self) -> Self {
        self.then_passthrough_with(PassthroughStepConfig::default())
    }

    pub fn then_passthrough_with(mut self, config: PassthroughStepConfig) -> Self {
        match PassthroughStep::new(PassthroughOptions::from_config(config)) {
            Ok(step) => self.steps.push(Box::new(step)),
            Err(err) => self.error = Some(err),
        }
        self
    }

    pub fn then_passthrough_with_hooks(
        mut self,
        config: PassthroughStepConfig,
        hooks: PassthroughHooks,
    ) -> Self {
        match PassthroughStep::new(PassthroughOptions::from_config(config).with_hooks(hooks)) {
            Ok(step) => self.steps.push(Box::new(step)),
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Ends the connection cleanly, with no response.
    pub fn then_close(mut self) -> Self {
        self.steps.push(Box::new(CloseConnectionStep));
        self
    }

    /// RSTs the connection. Fails at build time on platforms without RST
    /// support.
    pub fn then_reset(mut self) -> Self {
        match ResetConnectionStep::new() {
            Ok(step) => self.steps.push(Box::new(step)),
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Accepts the request and never responds.
    pub fn then_timeout(mut self) -> Self {
        self.steps.push(Box::new(TimeoutStep));
        self
    }

    /// Appends a pre-built step.
    pub fn with_step(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a declarative step config.
    pub fn with_step_config(mut self, config: StepConfig) -> Self {
        match steps::from_config(config) {
            Ok(step) => self.steps.push(step),
            Err(err) => self.error = Some(err),
        }
        self
    }

    pub fn build(self) -> Result<RuleSpec, steps::Error> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.steps.is_empty() {
            return Err(steps::Error::ConfigError(
                "a rule needs at least one step".to_string(),
            ));
        }
        Ok(RuleSpec {
            priority: self.priority,
            matchers: self.matchers,
            steps: self.steps,
            completion: self.completion,
        })
    }
}

impl Default for RuleBuilder {
    fn default() -> Self {
        RuleBuilder::new()
    }
}

/// Convenience for hook construction.
pub fn proxy_hooks() -> PassthroughHooks {
    PassthroughHooks::default()
}

pub use crate::server::rules::steps::{CallbackAction, CallbackResponse};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_produces_a_complete_spec() {
        let spec = RuleBuilder::get("/hi")
            .match_header("accept", "text/plain")
            .once()
            .then_reply(200, "ok")
            .build()
            .unwrap();

        assert_eq!(spec.matchers.len(), 3);
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.completion, CompletionPolicy::Once);
    }

    #[test]
    fn builder_without_steps_fails() {
        assert!(RuleBuilder::get("/hi").build().is_err());
    }

    #[test]
    fn builder_surfaces_step_config_errors() {
        let mut config = PassthroughStepConfig::default();
        config.proxy = Some(crate::common::data::ProxyConfig::Setting(
            crate::common::data::ProxySetting::new("pac+https://x.test/proxy.pac"),
        ));
        let result = RuleBuilder::anything().then_passthrough_with(config).build();
        assert!(result.is_err());
    }
}
