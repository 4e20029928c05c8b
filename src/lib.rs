//! Interactive HTTP/HTTPS/HTTP2 and WebSocket mocking and intercepting
//! proxy.
//!
//! Point a process under test at the proxy (directly, via `HTTP_PROXY` /
//! `HTTPS_PROXY`, or through its SOCKS front-end) and configure an ordered
//! rule list deciding what happens to each request: synthesise a response,
//! pass it through to a real upstream with transformations, or close/reset
//! the connection for fault injection.
//!
//! # Features
//! * One listening port speaking HTTP/1.1, HTTP/2, WebSocket, TLS (with
//!   on-the-fly certificate minting from a CA) and SOCKS4/4a/5, detected
//!   from the first byte of each connection.
//! * Ordered rule matching with priorities and completion policies
//!   (`once`, `times(n)`, `always`).
//! * A passthrough engine with URL/header/body transforms, upstream proxy
//!   chaining (HTTP CONNECT and SOCKS), DNS caching and connection
//!   pooling.
//! * Two-way WebSocket frame piping with subprotocol negotiation.
//! * A typed, asynchronous event stream covering the request lifecycle.
//!
//! # Getting started
//!
//! ```no_run
//! use mockproxy::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = MockProxyBuilder::new().build()?;
//! let port = proxy.start().await?;
//!
//! proxy.add_rule(
//!     RuleBuilder::get("/hi")
//!         .once()
//!         .then_reply(200, "ok")
//!         .build()?,
//! );
//!
//! let response = reqwest::get(format!("http://127.0.0.1:{port}/hi")).await?;
//! assert_eq!(response.status(), 200);
//! # Ok(())
//! # }
//! ```
//!
//! # Passing through
//!
//! Rules can forward matched traffic to the real upstream, optionally
//! rewriting the destination and both message bodies on the way:
//!
//! ```no_run
//! use mockproxy::prelude::*;
//! use mockproxy::common::data::{PassthroughStepConfig, RequestTransform};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = PassthroughStepConfig::default();
//! config.transform_request = Some(RequestTransform {
//!     replace_host: Some("example.com:443".to_string()),
//!     ..Default::default()
//! });
//!
//! let rule = RuleBuilder::any("/")
//!     .then_passthrough_with(config)
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Debugging
//!
//! The crate logs through the [`log`](https://crates.io/crates/log) facade;
//! `debug` shows matching decisions, `trace` shows wire-level chatter.

pub mod api;
pub mod common;
pub mod server;

pub use crate::api::RuleBuilder;
pub use crate::server::builder::MockProxyBuilder;
pub use crate::server::rules::{MockedEndpoint, RuleSpec};
pub use crate::server::MockProxy;

/// The things almost every test needs in scope.
pub mod prelude {
    pub use crate::api::RuleBuilder;
    pub use crate::common::data::{
        CompletionPolicy, IgnoreHttpsErrors, MatchReplacePair, PassthroughStepConfig,
        ProxyConfig, ProxySetting, RequestTransform, ResponseTransform, RuleDefinition,
        UpdateHostHeader,
    };
    pub use crate::server::builder::MockProxyBuilder;
    pub use crate::server::events::{Event, EventKind};
    pub use crate::server::rules::{MockedEndpoint, RuleSpec};
    pub use crate::server::socks::SocksAuthMethod;
    pub use crate::server::MockProxy;
}
