//! Diagnostic log sink
//!
//! Human-readable event lines are mirrored into `tracing` and pushed onto a
//! small bounded queue. Producers never wait: when the queue is full the
//! new line is dropped. A pump task fans queued lines out to every
//! subscriber of the `/logs` Server-Sent Events endpoint.

use axum::{
    extract::State,
    response::{sse::Event, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use ssh2proxy_proto::is_network_noise;
use ssh2proxy_transport::EventSink;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn, Level};

/// Default queue depth
pub const LOG_CHANNEL_CAPACITY: usize = 100;

const SUBSCRIBER_BUFFER: usize = 256;

/// Cloneable handle for emitting diagnostic lines
///
/// Lines are not retained for later readers: a line pumped while no
/// `/logs` subscriber is connected is discarded, and a new subscriber only
/// sees lines emitted after it connects. Everything still reaches
/// `tracing`.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    tx: mpsc::Sender<String>,
    feed: broadcast::Sender<String>,
    dropped: Arc<AtomicU64>,
}

/// Moves queued lines to subscribers; see [`DiagnosticLog::new`]
#[derive(Debug)]
pub struct LogPump {
    rx: mpsc::Receiver<String>,
    feed: broadcast::Sender<String>,
}

impl DiagnosticLog {
    /// Create a log with a queue of `capacity` lines. Nothing reaches
    /// subscribers until the returned pump is running.
    pub fn new(capacity: usize) -> (Self, LogPump) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (feed, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let log = Self {
            tx,
            feed: feed.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (log, LogPump { rx, feed })
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);
        self.enqueue(message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!("{}", message);
        self.enqueue(message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!("{}", message);
        self.enqueue(message);
    }

    /// Debug lines are queued like the others
    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{}", message);
        self.enqueue(message);
    }

    /// Log an error, downgrading routine disconnect churn to `debug` and
    /// keeping it off the queue
    pub fn failure(&self, context: &str, err: &dyn std::fmt::Display) {
        let message = format!("{}: {}", context, err);
        if is_network_noise(&message) {
            debug!("{}", message);
        } else {
            self.warn(message);
        }
    }

    /// Non-blocking enqueue. Noise is filtered; a full queue drops the line.
    pub fn enqueue(&self, message: &str) -> bool {
        if is_network_noise(message) {
            return false;
        }
        match self.tx.try_send(message.to_string()) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Lines dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Lines waiting for the pump
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

impl EventSink for DiagnosticLog {
    fn record(&self, _level: Level, message: &str) {
        self.enqueue(message);
    }
}

impl LogPump {
    /// Forward until every [`DiagnosticLog`] handle is gone
    pub async fn run(mut self) {
        while let Some(line) = self.rx.recv().await {
            // No subscribers is fine
            let _ = self.feed.send(line);
        }
        debug!("Diagnostic log pump stopped");
    }
}

/// `GET /logs` Server-Sent Events endpoint
pub struct LogServer {
    listener: TcpListener,
    log: DiagnosticLog,
}

impl LogServer {
    /// Bind the endpoint. Serving starts with [`LogServer::run`].
    pub async fn bind(addr: &str, log: DiagnosticLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, log })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Subscriber streams end when `cancel` fires
    pub fn router(log: DiagnosticLog, cancel: CancellationToken) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/logs", get(handle_logs))
            .layer(cors)
            .with_state(LogState { log, cancel })
    }

    /// Serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Diagnostic log stream on http://{}/logs", addr);
        }
        let app = Self::router(self.log, cancel.clone());
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    }
}

#[derive(Clone)]
struct LogState {
    log: DiagnosticLog,
    cancel: CancellationToken,
}

/// Each line becomes one `data: <line>` frame
async fn handle_logs(
    State(state): State<LogState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Log subscriber connected");

    let stream = BroadcastStream::new(state.log.subscribe()).filter_map(|result| match result {
        Ok(line) => Some(Ok(Event::default().data(line))),
        // Lagged subscriber: skip what it missed
        Err(_) => None,
    });

    Sse::new(futures::StreamExt::take_until(
        stream,
        state.cancel.cancelled_owned(),
    ))
}
