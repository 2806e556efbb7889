//! Transport connection manager
//!
//! Owns the primary transport: dials it at startup, probes it on a timer,
//! and replaces it when it dies. Callers that need a transport go through
//! [`TransportManager::ensure_healthy`].

use crate::backoff::{Backoff, BackoffStop, ReconnectPolicy};
use crate::error::{TransportError, TransportResult};
use crate::events::{emit, NullSink, SharedSink};
use crate::transport::{SharedTransport, TransportConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};

pub struct TransportManager {
    connector: Arc<dyn TransportConnector>,
    policy: ReconnectPolicy,
    probe_timeout: Duration,
    primary: Mutex<Option<SharedTransport>>,
    reconnecting: AtomicBool,
    events: SharedSink,
}

/// Clears the reconnect flag when the reconnect finishes, however it ends
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TransportManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        policy: ReconnectPolicy,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            policy,
            probe_timeout,
            primary: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            events: Arc::new(NullSink),
        }
    }

    /// Forward reconnect and health events to a diagnostic sink
    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    pub fn connector(&self) -> Arc<dyn TransportConnector> {
        self.connector.clone()
    }

    /// Dial the primary transport once. No retry: a failure here is fatal
    /// to startup.
    pub async fn connect_primary(&self) -> TransportResult<SharedTransport> {
        let conn = self.connector.connect().await?;
        self.install(conn.clone()).await;
        emit(
            self.events.as_ref(),
            Level::INFO,
            &format!("Connected to SSH server {}", self.connector.remote_address()),
        );
        Ok(conn)
    }

    /// Probe `conn`, bounded by the probe timeout. Errors and timeouts both
    /// count as dead.
    pub async fn health_check(&self, conn: &SharedTransport) -> bool {
        if conn.is_closed() {
            return false;
        }
        match tokio::time::timeout(self.probe_timeout, conn.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(connection_id = %conn.connection_id(), "Health probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(
                    connection_id = %conn.connection_id(),
                    "Health probe timed out after {:?}", self.probe_timeout
                );
                false
            }
        }
    }

    /// Return a healthy primary, reconnecting if the current one is dead
    ///
    /// If another task is already reconnecting this returns
    /// [`TransportError::Reconnecting`] right away instead of queueing.
    pub async fn ensure_healthy(&self, cancel: &CancellationToken) -> TransportResult<SharedTransport> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let stale = {
            let mut slot = self.primary.lock().await;
            if let Some(conn) = slot.as_ref() {
                if self.health_check(conn).await {
                    return Ok(conn.clone());
                }
            }
            slot.take()
        };

        if let Some(stale) = stale {
            emit(
                self.events.as_ref(),
                Level::WARN,
                &format!(
                    "SSH connection {} is unhealthy, reconnecting",
                    stale.connection_id()
                ),
            );
            stale.close().await;
        }

        self.reconnect(cancel).await
    }

    /// Dial a replacement primary with bounded exponential backoff
    ///
    /// Runs without holding the primary slot lock; the new transport is
    /// installed once it has authenticated.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> TransportResult<SharedTransport> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::Reconnecting);
        }
        let _guard = ReconnectGuard(&self.reconnecting);

        let mut backoff = Backoff::new(self.policy.clone());
        let mut last_error = String::from("no attempt made");

        loop {
            let attempt = match backoff.next_attempt(cancel).await {
                Ok(attempt) => attempt,
                Err(BackoffStop::Cancelled) => return Err(TransportError::Cancelled),
                Err(BackoffStop::Exhausted) => {
                    emit(
                        self.events.as_ref(),
                        Level::ERROR,
                        &format!(
                            "Failed to reconnect to {} after {} attempts: {}",
                            self.connector.remote_address(),
                            backoff.attempt(),
                            last_error
                        ),
                    );
                    return Err(TransportError::ReconnectExhausted {
                        attempts: backoff.attempt(),
                        last_error,
                    });
                }
            };

            emit(
                self.events.as_ref(),
                Level::INFO,
                &format!(
                    "Reconnecting to {} (attempt {}/{})",
                    self.connector.remote_address(),
                    attempt,
                    backoff.max_attempts()
                ),
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = self.connector.connect() => result,
            };

            match result {
                Ok(conn) => {
                    if cancel.is_cancelled() {
                        conn.close().await;
                        return Err(TransportError::Cancelled);
                    }
                    self.install(conn.clone()).await;
                    emit(
                        self.events.as_ref(),
                        Level::INFO,
                        &format!(
                            "Reconnected to {} (connection {})",
                            self.connector.remote_address(),
                            conn.connection_id()
                        ),
                    );
                    return Ok(conn);
                }
                Err(TransportError::Authentication(reason)) => {
                    // Credentials will not get better on retry
                    emit(
                        self.events.as_ref(),
                        Level::ERROR,
                        &format!("Reconnect authentication failed: {}", reason),
                    );
                    return Err(TransportError::Authentication(reason));
                }
                Err(e) => {
                    emit(
                        self.events.as_ref(),
                        Level::WARN,
                        &format!("Reconnect attempt {} failed: {}", attempt, e),
                    );
                    last_error = e.to_string();
                }
            }
        }
    }

    /// Periodically probe the primary and replace it when it is dead
    pub async fn run_monitor(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = self.primary.lock().await.clone();
            match current {
                Some(conn) if self.health_check(&conn).await => {
                    debug!(
                        connection_id = %conn.connection_id(),
                        remote = %self.connector.remote_address(),
                        "Primary transport healthy"
                    );
                    continue;
                }
                Some(conn) => {
                    emit(
                        self.events.as_ref(),
                        Level::WARN,
                        &format!("Health check failed for SSH connection {}", conn.connection_id()),
                    );
                    let stale = {
                        let mut slot = self.primary.lock().await;
                        let same = slot
                            .as_ref()
                            .map(|current| Arc::ptr_eq(current, &conn))
                            .unwrap_or(false);
                        if same {
                            slot.take()
                        } else {
                            None
                        }
                    };
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                }
                None => {
                    debug!("No primary transport, reconnecting");
                }
            }

            match self.reconnect(&cancel).await {
                Ok(_) => {}
                Err(TransportError::Cancelled) => break,
                Err(TransportError::Reconnecting) => {
                    debug!("Reconnect already in progress, skipping this tick");
                }
                Err(e) => {
                    emit(
                        self.events.as_ref(),
                        Level::ERROR,
                        &format!("Primary transport unavailable, retrying next check: {}", e),
                    );
                }
            }
        }

        debug!("Transport monitor stopped");
    }

    /// Whether a primary transport is installed and not known to be closed
    pub async fn is_connected(&self) -> bool {
        self.primary
            .lock()
            .await
            .as_ref()
            .map(|conn| !conn.is_closed())
            .unwrap_or(false)
    }

    pub async fn primary(&self) -> Option<SharedTransport> {
        self.primary.lock().await.clone()
    }

    /// Close and forget the primary transport
    pub async fn shutdown(&self) {
        let conn = self.primary.lock().await.take();
        if let Some(conn) = conn {
            debug!(connection_id = %conn.connection_id(), "Closing primary transport");
            conn.close().await;
        }
    }

    async fn install(&self, conn: SharedTransport) {
        let previous = self.primary.lock().await.replace(conn);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("remote", &self.connector.remote_address())
            .field("reconnecting", &self.reconnecting.load(Ordering::Relaxed))
            .finish()
    }
}
