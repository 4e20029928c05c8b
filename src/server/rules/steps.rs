use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::common::data::{StepConfig, WebhookConfig};
use crate::common::util;
use crate::server::events::EventBus;
use crate::server::intake::{OngoingRequest, ProxyResponse, ResponseBody};
use crate::server::passthrough::{self, agent::AgentCache, dns::CachingResolver, PassthroughOptions};
use crate::server::rules::Rule;

use self::Error::{ConfigError, StepFailed};

#[derive(Error, Debug)]
pub enum Error {
    #[error("step configuration error: {0}")]
    ConfigError(String),
    #[error("step failed: {0}")]
    StepFailed(String),
    #[error("cannot read request body: {0}")]
    BodyError(#[from] crate::server::intake::Error),
    #[error("{0}")]
    EncodingError(#[from] crate::common::util::Error),
    #[error("cannot read response file: {0}")]
    FileError(std::io::Error),
}

/// Shared infrastructure handed to every step execution.
pub struct StepContext {
    pub events: Arc<EventBus>,
    pub dns: Arc<CachingResolver>,
    pub agents: Arc<AgentCache>,
}

/// What a step decided. `Continue` hands over to the next step; everything
/// else is terminal for the request.
pub enum StepOutcome {
    Continue,
    Respond(ProxyResponse),
    /// End the connection cleanly without a response.
    Close,
    /// RST the connection without a response.
    Reset,
}

/// A unit of work inside a rule, executed in order until one is terminal.
#[async_trait]
pub trait Step: Send + Sync {
    async fn handle(&self, req: &OngoingRequest, ctx: &StepContext) -> Result<StepOutcome, Error>;
    fn explain(&self) -> String;
    fn dispose(&self) {}

    /// Set for passthrough steps, so upgrade requests can divert to the
    /// WebSocket pipe with the same destination configuration.
    fn passthrough_options(&self) -> Option<Arc<PassthroughOptions>> {
        None
    }
}

/// Runs a rule's steps in order. A failing step produces a best-effort 500
/// carrying the error; close/reset outcomes propagate without a response.
pub async fn run_steps(rule: &Rule, req: &OngoingRequest, ctx: &StepContext) -> StepOutcome {
    for step in rule.steps() {
        match step.handle(req, ctx).await {
            Ok(StepOutcome::Continue) => continue,
            Ok(outcome) => return outcome,
            Err(err) => {
                log::warn!("rule step failed: {}", err);
                return StepOutcome::Respond(
                    ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                        .with_body(err.to_string()),
                );
            }
        }
    }

    log::warn!("rule {} ran out of steps without responding", rule.id());
    StepOutcome::Respond(
        ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_body("rule completed without a terminal step"),
    )
}

/// Fixed response. The body is re-encoded to match any `content-encoding`
/// the configured headers declare, and configured headers replace the
/// default set entirely.
pub struct ReplyStep {
    pub status: StatusCode,
    pub status_message: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Bytes,
    pub trailers: Option<Vec<(String, String)>>,
}

impl ReplyStep {
    pub fn text<B: Into<Bytes>>(status: u16, body: B) -> Self {
        ReplyStep {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            status_message: None,
            headers: None,
            body: body.into(),
            trailers: None,
        }
    }
}

#[async_trait]
impl Step for ReplyStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        let headers = self.headers.clone().unwrap_or_default();

        let encoding = util::find_header(&headers, "content-encoding").map(|v| v.to_string());
        let body = util::encode_body(encoding.as_deref(), &self.body)?;

        let trailers = match &self.trailers {
            Some(pairs) => Some(build_trailer_map(pairs)?),
            None => None,
        };

        Ok(StepOutcome::Respond(ProxyResponse {
            status: self.status,
            status_message: self.status_message.clone(),
            headers,
            body: ResponseBody::Full(body),
            trailers,
        }))
    }

    fn explain(&self) -> String {
        format!("respond with status {}", self.status.as_u16())
    }
}

fn build_trailer_map(pairs: &[(String, String)]) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let name = http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ConfigError(format!("invalid trailer name {:?}: {}", name, err)))?;
        let value = http::header::HeaderValue::from_str(value)
            .map_err(|err| ConfigError(format!("invalid trailer value: {}", err)))?;
        map.append(name, value);
    }
    Ok(map)
}

/// A response synthesised by user code.
pub struct CallbackResponse {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Bytes,
}

pub enum CallbackAction {
    Response(CallbackResponse),
    Close,
    Reset,
}

pub type StepCallback = Arc<
    dyn for<'a> Fn(&'a OngoingRequest) -> BoxFuture<'a, Result<CallbackAction, String>>
        + Send
        + Sync,
>;

pub struct CallbackStep {
    pub callback: StepCallback,
}

#[async_trait]
impl Step for CallbackStep {
    async fn handle(&self, req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        match (self.callback)(req).await.map_err(StepFailed)? {
            CallbackAction::Response(response) => {
                let headers = response.headers.unwrap_or_default();
                let encoding =
                    util::find_header(&headers, "content-encoding").map(|v| v.to_string());
                let body = util::encode_body(encoding.as_deref(), &response.body)?;
                Ok(StepOutcome::Respond(ProxyResponse {
                    status: StatusCode::from_u16(response.status)
                        .map_err(|err| StepFailed(format!("invalid status: {}", err)))?,
                    status_message: response.status_message,
                    headers,
                    body: ResponseBody::Full(body),
                    trailers: None,
                }))
            }
            CallbackAction::Close => Ok(StepOutcome::Close),
            CallbackAction::Reset => Ok(StepOutcome::Reset),
        }
    }

    fn explain(&self) -> String {
        "respond using a callback".to_string()
    }
}

/// Serves the contents of a file, read fresh on every execution so repeated
/// rule use observes file changes.
pub struct FileStep {
    pub status: StatusCode,
    pub headers: Option<Vec<(String, String)>>,
    pub path: std::path::PathBuf,
}

#[async_trait]
impl Step for FileStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        let contents = tokio::fs::read(&self.path).await.map_err(Error::FileError)?;
        Ok(StepOutcome::Respond(ProxyResponse {
            status: self.status,
            status_message: None,
            headers: self.headers.clone().unwrap_or_default(),
            body: ResponseBody::Full(Bytes::from(contents)),
            trailers: None,
        }))
    }

    fn explain(&self) -> String {
        format!("respond with the contents of {}", self.path.display())
    }
}

/// Handle for feeding a stream step from test code. Dropping it ends the
/// response body.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Bytes>,
}

impl StreamWriter {
    pub async fn send<B: Into<Bytes>>(&self, chunk: B) -> Result<(), Error> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| StepFailed("stream response is no longer being read".to_string()))
    }
}

struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(hyper::body::Frame::data(bytes))))
    }
}

/// Streams chunks fed through a [`StreamWriter`]. Explicitly single-shot: a
/// second execution fails because the channel was already consumed.
pub struct StreamStep {
    pub status: StatusCode,
    pub headers: Option<Vec<(String, String)>>,
    receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
    used: AtomicBool,
}

impl StreamStep {
    pub fn new(status: u16, headers: Option<Vec<(String, String)>>) -> (Self, StreamWriter) {
        let (tx, rx) = mpsc::channel(16);
        (
            StreamStep {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                headers,
                receiver: Mutex::new(Some(rx)),
                used: AtomicBool::new(false),
            },
            StreamWriter { tx },
        )
    }
}

#[async_trait]
impl Step for StreamStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(StepFailed(
                "stream steps are single-shot and cannot handle a second request".to_string(),
            ));
        }
        let rx = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| StepFailed("stream response already consumed".to_string()))?;

        let body = ChannelBody { rx }
            .map_err(|never| match never {})
            .boxed();

        Ok(StepOutcome::Respond(ProxyResponse {
            status: self.status,
            status_message: None,
            headers: self.headers.clone().unwrap_or_default(),
            body: ResponseBody::Boxed(body),
            trailers: None,
        }))
    }

    fn explain(&self) -> String {
        format!("stream a {} response", self.status.as_u16())
    }
}

/// Replies to JSON-RPC 2.0 requests, mirroring the request id.
pub struct JsonRpcResponseStep {
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

#[async_trait]
impl Step for JsonRpcResponseStep {
    async fn handle(&self, req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        let body = req.decoded_body().await?;
        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| StepFailed(format!("request is not valid JSON-RPC: {}", err)))?;
        let id = parsed.get("id").cloned().unwrap_or(serde_json::Value::Null);

        let mut reply = serde_json::json!({ "jsonrpc": "2.0", "id": id });
        if let Some(error) = &self.error {
            reply["error"] = error.clone();
        } else {
            reply["result"] = self.result.clone().unwrap_or(serde_json::Value::Null);
        }

        Ok(StepOutcome::Respond(
            ProxyResponse::new(StatusCode::OK)
                .with_header("content-type", "application/json")
                .with_body(serde_json::to_vec(&reply).unwrap_or_default()),
        ))
    }

    fn explain(&self) -> String {
        if self.error.is_some() {
            "respond with a JSON-RPC error".to_string()
        } else {
            "respond with a JSON-RPC result".to_string()
        }
    }
}

/// Forwards the request upstream; the heavy lifting lives in
/// [`crate::server::passthrough`].
pub struct PassthroughStep {
    pub options: Arc<PassthroughOptions>,
}

impl PassthroughStep {
    pub fn new(options: PassthroughOptions) -> Result<Self, Error> {
        options
            .validate()
            .map_err(|err| ConfigError(err.to_string()))?;
        Ok(PassthroughStep {
            options: Arc::new(options),
        })
    }
}

#[async_trait]
impl Step for PassthroughStep {
    async fn handle(&self, req: &OngoingRequest, ctx: &StepContext) -> Result<StepOutcome, Error> {
        Ok(passthrough::execute(req, &self.options, ctx).await)
    }

    fn explain(&self) -> String {
        "pass the request through to the target host".to_string()
    }

    fn passthrough_options(&self) -> Option<Arc<PassthroughOptions>> {
        Some(self.options.clone())
    }
}

pub struct CloseConnectionStep;

#[async_trait]
impl Step for CloseConnectionStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Close)
    }

    fn explain(&self) -> String {
        "close the connection".to_string()
    }
}

pub struct ResetConnectionStep;

impl ResetConnectionStep {
    /// RST requires SO_LINGER(0) support, which we only wire up on Unix.
    /// Configuration fails up front elsewhere.
    pub fn new() -> Result<Self, Error> {
        #[cfg(unix)]
        {
            Ok(ResetConnectionStep)
        }
        #[cfg(not(unix))]
        {
            Err(ConfigError(
                "reset-connection steps require a platform with RST support".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Step for ResetConnectionStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Reset)
    }

    fn explain(&self) -> String {
        "reset the connection".to_string()
    }
}

/// Never responds. The future parks until the client gives up and the
/// connection task drops it.
pub struct TimeoutStep;

#[async_trait]
impl Step for TimeoutStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        futures_util::future::pending::<()>().await;
        unreachable!("pending future resolved")
    }

    fn explain(&self) -> String {
        "time out with no response".to_string()
    }
}

pub struct DelayStep {
    pub duration: Duration,
}

#[async_trait]
impl Step for DelayStep {
    async fn handle(&self, _req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        tokio::time::sleep(self.duration).await;
        Ok(StepOutcome::Continue)
    }

    fn explain(&self) -> String {
        format!("wait {}ms", self.duration.as_millis())
    }
}

pub struct WaitForBodyStep;

#[async_trait]
impl Step for WaitForBodyStep {
    async fn handle(&self, req: &OngoingRequest, _ctx: &StepContext) -> Result<StepOutcome, Error> {
        req.body.raw().await?;
        Ok(StepOutcome::Continue)
    }

    fn explain(&self) -> String {
        "wait for the full request body".to_string()
    }
}

/// POSTs a request summary to the configured URL. Failures are logged and
/// tolerated; the step always continues.
pub struct WebhookStep {
    pub config: WebhookConfig,
}

#[async_trait]
impl Step for WebhookStep {
    async fn handle(&self, req: &OngoingRequest, ctx: &StepContext) -> Result<StepOutcome, Error> {
        let mut summary = serde_json::json!({
            "id": req.id.to_string(),
            "method": req.method.as_str(),
            "url": req.url.to_string(),
            "headers": req.raw_headers,
            "tags": req.tags(),
        });
        if self.config.include_body {
            if let Ok(body) = req.decoded_body().await {
                summary["body"] = serde_json::Value::String(
                    String::from_utf8_lossy(&body).to_string(),
                );
            }
        }

        match passthrough::agent::post_json(&self.config.url, summary.to_string(), &ctx.dns).await {
            Ok(status) => log::debug!("webhook to {} answered {}", self.config.url, status),
            Err(err) => log::warn!("webhook to {} failed: {}", self.config.url, err),
        }
        Ok(StepOutcome::Continue)
    }

    fn explain(&self) -> String {
        format!("notify {}", self.config.url)
    }
}

/// Compiles a declarative step config. Fails fast on configurations the
/// platform or the engine cannot honour.
pub fn from_config(config: StepConfig) -> Result<Box<dyn Step>, Error> {
    Ok(match config {
        StepConfig::Reply {
            status,
            status_message,
            headers,
            body,
            trailers,
        } => Box::new(ReplyStep {
            status: StatusCode::from_u16(status)
                .map_err(|err| ConfigError(format!("invalid status {}: {}", status, err)))?,
            status_message,
            headers,
            body,
            trailers,
        }),
        StepConfig::File {
            status,
            headers,
            path,
        } => Box::new(FileStep {
            status: StatusCode::from_u16(status)
                .map_err(|err| ConfigError(format!("invalid status {}: {}", status, err)))?,
            headers,
            path,
        }),
        StepConfig::JsonRpcResponse { result, error } => {
            Box::new(JsonRpcResponseStep { result, error })
        }
        StepConfig::Passthrough(config) => {
            Box::new(PassthroughStep::new(PassthroughOptions::from_config(*config))?)
        }
        StepConfig::CloseConnection => Box::new(CloseConnectionStep),
        StepConfig::ResetConnection => Box::new(ResetConnectionStep::new()?),
        StepConfig::Timeout => Box::new(TimeoutStep),
        StepConfig::Delay { ms } => Box::new(DelayStep {
            duration: Duration::from_millis(ms),
        }),
        StepConfig::WaitForRequestBody => Box::new(WaitForBodyStep),
        StepConfig::Webhook(config) => Box::new(WebhookStep { config }),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::passthrough::{agent::AgentCache, dns::CachingResolver};
    use http::Method;

    fn test_ctx() -> StepContext {
        StepContext {
            events: Arc::new(EventBus::new()),
            dns: Arc::new(CachingResolver::default_resolver()),
            agents: Arc::new(AgentCache::new()),
        }
    }

    fn test_request(body: &str) -> OngoingRequest {
        OngoingRequest::synthetic(
            Method::POST,
            url::Url::parse("http://localhost/rpc").unwrap(),
            vec![],
            Bytes::from(body.to_string()),
        )
    }

    #[tokio::test]
    async fn reply_step_encodes_body_to_declared_encoding() {
        let step = ReplyStep {
            status: StatusCode::OK,
            status_message: None,
            headers: Some(vec![("content-encoding".to_string(), "gzip".to_string())]),
            body: Bytes::from_static(b"hello"),
            trailers: None,
        };

        let outcome = step.handle(&test_request(""), &test_ctx()).await.unwrap();

        match outcome {
            StepOutcome::Respond(response) => match response.body {
                ResponseBody::Full(bytes) => {
                    let decoded =
                        crate::common::util::decode_body(Some("gzip"), &bytes, 1024).unwrap();
                    assert_eq!(&decoded[..], b"hello");
                }
                _ => panic!("expected buffered body"),
            },
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn json_rpc_step_mirrors_request_id() {
        let step = JsonRpcResponseStep {
            result: Some(serde_json::json!({"answer": 42})),
            error: None,
        };
        let req = test_request(r#"{"jsonrpc":"2.0","id":7,"method":"ask"}"#);

        let outcome = step.handle(&req, &test_ctx()).await.unwrap();

        match outcome {
            StepOutcome::Respond(response) => match response.body {
                ResponseBody::Full(bytes) => {
                    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                    assert_eq!(value["id"], 7);
                    assert_eq!(value["result"]["answer"], 42);
                }
                _ => panic!("expected buffered body"),
            },
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn stream_step_is_single_shot() {
        let (step, writer) = StreamStep::new(200, None);
        drop(writer);

        let first = step.handle(&test_request(""), &test_ctx()).await;
        assert!(matches!(first, Ok(StepOutcome::Respond(_))));

        let second = step.handle(&test_request(""), &test_ctx()).await;
        assert!(matches!(second, Err(Error::StepFailed(_))));
    }

    #[tokio::test]
    async fn delay_step_continues() {
        let step = DelayStep {
            duration: Duration::from_millis(1),
        };
        let outcome = step.handle(&test_request(""), &test_ctx()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Continue));
    }

    #[cfg(unix)]
    #[test]
    fn reset_step_constructs_on_unix() {
        assert!(ResetConnectionStep::new().is_ok());
    }
}
