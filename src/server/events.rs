use std::net::SocketAddr;
use std::time::{Instant, SystemTime};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Timing marks captured for one request. All `Instant`s come from the same
/// monotonic clock, so marks are ordered within a request.
#[derive(Debug, Clone)]
pub struct TimingEvents {
    pub start_time: SystemTime,
    pub start_timestamp: Instant,
    pub body_received: Option<Instant>,
    pub headers_sent: Option<Instant>,
    pub response_sent: Option<Instant>,
    pub aborted: Option<Instant>,
}

impl TimingEvents {
    pub fn new() -> Self {
        TimingEvents {
            start_time: SystemTime::now(),
            start_timestamp: Instant::now(),
            body_received: None,
            headers_sent: None,
            response_sent: None,
            aborted: None,
        }
    }
}

impl Default for TimingEvents {
    fn default() -> Self {
        TimingEvents::new()
    }
}

/// Immutable copy of a request at emission time. Subscribers never observe
/// later mutations of the ongoing request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub path: String,
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub headers: Vec<(String, String)>,
    pub peer_addr: Option<SocketAddr>,
    pub tags: Vec<String>,
    pub matched_rule_id: Option<usize>,
    pub timing: TimingEvents,
}

#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub id: Uuid,
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body_size: Option<u64>,
    pub timing: TimingEvents,
}

#[derive(Debug, Clone)]
pub struct AbortSnapshot {
    pub id: Uuid,
    pub error_code: Option<String>,
    pub message: String,
    pub tags: Vec<String>,
    pub timing: TimingEvents,
}

/// Downstream failures outside a parsed request: TLS handshake problems
/// before setup completed, or HTTP parse/framing errors.
#[derive(Debug, Clone)]
pub struct ClientErrorSnapshot {
    pub peer_addr: Option<SocketAddr>,
    pub error_code: Option<String>,
    pub message: String,
    /// Parsed request skeleton, when enough bytes arrived to build one.
    pub request: Option<RequestSnapshot>,
}

#[derive(Debug, Clone)]
pub struct PassthroughAbortSnapshot {
    pub id: Uuid,
    pub error_code: String,
    pub message: String,
    /// `passthrough-error:<code>` plus any recognised
    /// `passthrough-tls-error:<name>` tags.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Event {
    RequestInitiated(RequestSnapshot),
    Request(RequestSnapshot),
    Response(ResponseSnapshot),
    Abort(AbortSnapshot),
    TlsClientError(ClientErrorSnapshot),
    ClientError(ClientErrorSnapshot),
    PassthroughAbort(PassthroughAbortSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestInitiated,
    Request,
    Response,
    Abort,
    TlsClientError,
    ClientError,
    PassthroughAbort,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RequestInitiated(_) => EventKind::RequestInitiated,
            Event::Request(_) => EventKind::Request,
            Event::Response(_) => EventKind::Response,
            Event::Abort(_) => EventKind::Abort,
            Event::TlsClientError(_) => EventKind::TlsClientError,
            Event::ClientError(_) => EventKind::ClientError,
            Event::PassthroughAbort(_) => EventKind::PassthroughAbort,
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-server fan-out of lifecycle events. Emission never blocks the request
/// path: events go into a broadcast channel and subscribers consume at their
/// own pace (slow subscribers lose old events rather than applying
/// backpressure).
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { tx }
    }

    /// Events emitted from the same request task keep their order; ordering
    /// across requests is unspecified.
    pub fn emit(&self, event: Event) {
        log::trace!("emitting event: {:?}", event.kind());
        // An error just means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Spawns a task invoking `callback` for every event of `kind`. The task
    /// ends when the server (and with it the sender) is dropped.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.kind() == kind {
                            callback(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("event subscriber lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
