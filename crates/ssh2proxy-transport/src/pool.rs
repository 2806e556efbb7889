//! Spare transport connections
//!
//! The pool keeps a few pre-authenticated transports around so a dial can
//! skip the primary when it is busy reconnecting. Taking a connection out
//! is destructive: whoever takes it owns it.

use crate::events::{emit, NullSink, SharedSink};
use crate::transport::{SharedTransport, TransportConnector};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};

#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<VecDeque<SharedTransport>>,
    capacity: usize,
    target: usize,
    events: SharedSink,
}

impl ConnectionPool {
    /// `target` is clamped to `capacity`
    pub fn new(capacity: usize, target: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            target: target.min(capacity),
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    /// Pop the oldest spare without waiting
    pub fn try_take(&self) -> Option<SharedTransport> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Add a spare. When the pool is full the connection is handed back so
    /// the caller can close it.
    pub fn offer(&self, conn: SharedTransport) -> Result<(), SharedTransport> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.capacity {
            return Err(conn);
        }
        idle.push_back(conn);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Close and remove every spare
    pub async fn drain(&self) -> usize {
        let drained: Vec<SharedTransport> = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = drained.len();
        for conn in drained {
            conn.close().await;
        }
        if count > 0 {
            debug!("Drained {} pooled transport(s)", count);
        }
        count
    }

    /// Top the pool up to its target depth
    ///
    /// Returns the number of transports added. A dial failure ends the
    /// top-up for this round.
    pub async fn fill(&self, connector: &dyn TransportConnector, cancel: &CancellationToken) -> usize {
        let mut added = 0;
        while self.len() < self.target && !cancel.is_cancelled() {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connector.connect() => result,
            };

            match result {
                Ok(conn) => {
                    if cancel.is_cancelled() {
                        conn.close().await;
                        break;
                    }
                    debug!(connection_id = %conn.connection_id(), "Adding spare transport to pool");
                    if let Err(rejected) = self.offer(conn) {
                        rejected.close().await;
                        break;
                    }
                    added += 1;
                }
                Err(e) => {
                    emit(
                        self.events.as_ref(),
                        Level::WARN,
                        &format!("Failed to create pooled SSH connection: {}", e),
                    );
                    break;
                }
            }
        }
        added
    }

    /// Background loop: top up every `interval` until cancelled, then drain
    pub async fn run_maintainer(
        self: Arc<Self>,
        connector: Arc<dyn TransportConnector>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let added = self.fill(connector.as_ref(), &cancel).await;
            if added > 0 {
                debug!("Pool topped up by {} (now {}/{})", added, self.len(), self.target);
            }
        }

        self.drain().await;
        debug!("Pool maintainer stopped");
    }
}
