pub mod builder;
pub mod events;
pub mod intake;
pub mod passthrough;
pub mod rules;
pub mod server;
pub mod socks;
pub mod tls;
pub mod websocket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::server::events::{Event, EventBus, EventKind};
use crate::server::passthrough::agent::AgentCache;
use crate::server::passthrough::dns::CachingResolver;
use crate::server::rules::steps::StepContext;
use crate::server::rules::{MockedEndpoint, RuleSet, RuleSpec};
use crate::server::socks::SocksAuthMethod;
use crate::server::tls::{CertAuthority, KeylogSink};

use self::Error::{AllPortsInUse, NotStarted, SocketBindError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("no free port in {0}..={1}")]
    AllPortsInUse(u16, u16),
    #[error("cannot read local socket address: {0}")]
    LocalAddrError(std::io::Error),
    #[error("server has not been started")]
    NotStarted,
    #[error("rule configuration error: {0}")]
    RuleError(#[from] rules::steps::Error),
}

/// Where to listen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PortConfig {
    /// Any port the OS picks.
    Any,
    Fixed(u16),
    /// First free port in the inclusive range, retrying on EADDRINUSE.
    Range(u16, u16),
}

impl Default for PortConfig {
    fn default() -> Self {
        // Mock servers get any free port from 8000 up.
        PortConfig::Range(8000, 65535)
    }
}

/// Server-wide settings resolved by the builder.
pub struct RuntimeConfig {
    pub port: PortConfig,
    pub expose: bool,
    pub http2: bool,
    pub max_body_size: usize,
    pub socks_auth: Vec<SocksAuthMethod>,
    pub keylog: Option<Arc<dyn KeylogSink>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            port: PortConfig::default(),
            expose: false,
            http2: true,
            max_body_size: 10 * 1024 * 1024,
            socks_auth: vec![
                SocksAuthMethod::CustomMetadata,
                SocksAuthMethod::UserPasswordMetadata,
                SocksAuthMethod::NoAuth,
            ],
            keylog: None,
        }
    }
}

/// The proxy-agent cache is process-wide: rules on different servers
/// targeting the same proxies share configs and pooled connections.
fn global_agent_cache() -> Arc<AgentCache> {
    static CACHE: OnceLock<Arc<AgentCache>> = OnceLock::new();
    CACHE.get_or_init(|| Arc::new(AgentCache::new())).clone()
}

/// Shared mutable state of one server instance: the rule list and the event
/// listener table, each behind its own lock.
pub struct ServerState {
    pub rules: RuleSet,
    pub events: Arc<EventBus>,
    pub cert_authority: Arc<CertAuthority>,
    pub dns: Arc<CachingResolver>,
    pub agents: Arc<AgentCache>,
    pub config: RuntimeConfig,
}

impl ServerState {
    pub fn new(cert_authority: Arc<CertAuthority>, config: RuntimeConfig) -> Self {
        ServerState {
            rules: RuleSet::new(),
            events: Arc::new(EventBus::new()),
            cert_authority,
            dns: Arc::new(CachingResolver::default_resolver()),
            agents: global_agent_cache(),
            config,
        }
    }

    pub(crate) fn step_context(&self) -> StepContext {
        StepContext {
            events: self.events.clone(),
            dns: self.dns.clone(),
            agents: self.agents.clone(),
        }
    }
}

struct BoundServer {
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
    connections: Arc<Mutex<JoinSet<()>>>,
}

/// The mocking/intercepting proxy. Configure rules, point a client at
/// [`MockProxy::url`] (or use [`MockProxy::proxy_env`]), and inspect what
/// happened through events and endpoint handles.
pub struct MockProxy {
    state: Arc<ServerState>,
    bound: Mutex<Option<BoundServer>>,
}

impl MockProxy {
    pub(crate) fn from_state(state: Arc<ServerState>) -> Self {
        MockProxy {
            state,
            bound: Mutex::new(None),
        }
    }

    /// Binds the configured port (retrying across a range on EADDRINUSE)
    /// and starts accepting connections. Returns the bound port.
    pub async fn start(&self) -> Result<u16, Error> {
        let host = if self.state.config.expose {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };

        let listener = match self.state.config.port {
            PortConfig::Any => bind(host, 0).await?,
            PortConfig::Fixed(port) => bind(host, port).await?,
            PortConfig::Range(start, end) => {
                let mut bound = None;
                for port in start..=end {
                    match bind(host, port).await {
                        Ok(listener) => {
                            bound = Some(listener);
                            break;
                        }
                        Err(SocketBindError(_, err))
                            if err.kind() == std::io::ErrorKind::AddrInUse =>
                        {
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                bound.ok_or(AllPortsInUse(start, end))?
            }
        };

        let addr = listener.local_addr().map_err(Error::LocalAddrError)?;
        log::info!("listening on {}", addr);

        let connections: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));
        let accept_state = self.state.clone();
        let accept_connections = connections.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let state = accept_state.clone();
                        accept_connections.lock().unwrap().spawn(async move {
                            if let Err(err) =
                                server::handle_connection(state, stream, peer_addr).await
                            {
                                log::debug!("connection from {} ended: {}", peer_addr, err);
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("accept failed: {}", err);
                    }
                }
            }
        });

        *self.bound.lock().unwrap() = Some(BoundServer {
            addr,
            accept_task,
            connections,
        });
        Ok(addr.port())
    }

    /// Stops accepting and force-destroys the connections still open.
    pub async fn stop(&self) {
        let bound = self.bound.lock().unwrap().take();
        if let Some(bound) = bound {
            bound.accept_task.abort();
            bound.connections.lock().unwrap().abort_all();
            log::info!("server on {} stopped", bound.addr);
        }
    }

    /// Clears all rules, disposing them and their in-flight steps.
    pub fn reset(&self) {
        self.state.rules.reset();
    }

    /// Replaces the rule list atomically.
    pub fn set_rules(&self, specs: Vec<RuleSpec>) -> Vec<MockedEndpoint> {
        self.state
            .rules
            .set(specs)
            .into_iter()
            .map(MockedEndpoint::new)
            .collect()
    }

    pub fn add_rules(&self, specs: Vec<RuleSpec>) -> Vec<MockedEndpoint> {
        self.state
            .rules
            .add(specs)
            .into_iter()
            .map(MockedEndpoint::new)
            .collect()
    }

    pub fn add_rule(&self, spec: RuleSpec) -> MockedEndpoint {
        self.add_rules(vec![spec])
            .pop()
            .expect("one spec in, one endpoint out")
    }

    pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
        self.state
            .rules
            .all()
            .into_iter()
            .map(MockedEndpoint::new)
            .collect()
    }

    /// Endpoints still expecting requests.
    pub fn pending_endpoints(&self) -> Vec<MockedEndpoint> {
        self.mocked_endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.is_pending())
            .collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.state.events.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.state.events.on(kind, callback)
    }

    pub fn port(&self) -> Result<u16, Error> {
        self.bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|bound| bound.addr.port())
            .ok_or(NotStarted)
    }

    pub fn url(&self) -> Result<String, Error> {
        Ok(format!("http://127.0.0.1:{}", self.port()?))
    }

    /// `HTTP_PROXY` / `HTTPS_PROXY` values for pointing a subprocess here.
    pub fn proxy_env(&self) -> Result<HashMap<String, String>, Error> {
        let url = self.url()?;
        Ok(HashMap::from([
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url),
        ]))
    }

    /// The CA certificate clients must trust to intercept TLS.
    pub fn ca_cert_pem(&self) -> String {
        self.state.cert_authority.ca_cert_pem().to_string()
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.lock().unwrap().take() {
            bound.accept_task.abort();
            bound.connections.lock().unwrap().abort_all();
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, Error> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("host and port always form a socket address");
    TcpListener::bind(addr)
        .await
        .map_err(|err| SocketBindError(addr, err))
}
