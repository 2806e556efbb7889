//! Stream dispatcher
//!
//! Turns a `(network, address)` target into a [`TrackedStream`]: reserves a
//! slot, picks a transport (spare from the pool, else the primary), opens
//! a channel and wraps it. Picking the transport and opening the channel
//! are bounded together by the dial timeout, so a request never waits out
//! a slow reconnect.

use crate::accounting::{ConnectionAccounting, DeadlineStream, TrackedStream};
use crate::error::DispatchError;
use crate::logsink::DiagnosticLog;
use async_trait::async_trait;
use ssh2proxy_proto::split_host_port;
use ssh2proxy_transport::{ConnectionPool, SharedTransport, TransportError, TransportManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capability handed to the front ends: open a stream to a target
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// `network` is `tcp`, `tcp4` or `tcp6`; `address` is `host:port`
    async fn open(&self, network: &str, address: &str) -> Result<TrackedStream, DispatchError>;

    /// Cheap pre-check used before replying to a client
    fn has_capacity(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct DispatchTimeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
}

pub struct StreamDispatcher {
    manager: Arc<TransportManager>,
    pool: Arc<ConnectionPool>,
    accounting: Arc<ConnectionAccounting>,
    timeouts: DispatchTimeouts,
    log: DiagnosticLog,
    shutdown: CancellationToken,
}

impl StreamDispatcher {
    pub fn new(
        manager: Arc<TransportManager>,
        pool: Arc<ConnectionPool>,
        accounting: Arc<ConnectionAccounting>,
        timeouts: DispatchTimeouts,
        log: DiagnosticLog,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            pool,
            accounting,
            timeouts,
            log,
            shutdown,
        }
    }

    pub fn accounting(&self) -> &Arc<ConnectionAccounting> {
        &self.accounting
    }

    /// A healthy spare from the pool, else the primary. A spare that is
    /// handed out is also recorded in `pooled` so the caller can close it.
    async fn acquire_transport(
        &self,
        address: &str,
        pooled: &mut Option<SharedTransport>,
    ) -> Result<SharedTransport, DispatchError> {
        if let Some(spare) = self.pool.try_take() {
            if self.manager.health_check(&spare).await {
                debug!(connection_id = %spare.connection_id(), "Using pooled transport for {}", address);
                *pooled = Some(spare.clone());
                return Ok(spare);
            }
            debug!(connection_id = %spare.connection_id(), "Discarding dead pooled transport");
            spare.close().await;
        }

        match self.manager.ensure_healthy(&self.shutdown).await {
            Ok(primary) => Ok(primary),
            Err(TransportError::Cancelled) => Err(DispatchError::Shutdown),
            Err(e) => Err(DispatchError::Transport(e)),
        }
    }
}

#[async_trait]
impl StreamOpener for StreamDispatcher {
    async fn open(&self, network: &str, address: &str) -> Result<TrackedStream, DispatchError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(DispatchError::Protocol(format!(
                "unsupported network '{}'",
                network
            )));
        }
        let (host, port) = split_host_port(address)
            .ok_or_else(|| DispatchError::Protocol(format!("invalid address '{}'", address)))?;

        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Shutdown);
        }

        let slot = self
            .accounting
            .try_reserve()
            .ok_or(DispatchError::Capacity {
                limit: self.accounting.ceiling(),
            })?;

        // Transport acquisition (including any reconnect it triggers) and
        // the channel open share one dial deadline
        let mut pooled = None;
        let acquire = async {
            let transport = self.acquire_transport(address, &mut pooled).await?;
            let channel = transport
                .open_channel(&host, port)
                .await
                .map_err(DispatchError::Transport)?;
            Ok::<_, DispatchError>((transport, channel))
        };
        let acquired = tokio::select! {
            _ = self.shutdown.cancelled() => Err(DispatchError::Shutdown),
            result = tokio::time::timeout(self.timeouts.dial, acquire) => match result {
                Ok(result) => result,
                Err(_) => Err(DispatchError::DialTimeout {
                    target: address.to_string(),
                    timeout: self.timeouts.dial,
                }),
            },
        };

        let (transport, channel) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                slot.release();
                if let Some(spare) = pooled {
                    spare.close().await;
                }
                self.log.failure(&format!("Failed to dial {}", address), &e);
                return Err(e);
            }
        };

        debug!(
            connection_id = %transport.connection_id(),
            active = slot.active(),
            "Opened channel to {}", address
        );

        let inner = DeadlineStream::new(channel, self.timeouts.read, self.timeouts.write);
        let stream = TrackedStream::new(inner, slot, address.to_string(), self.log.clone());
        Ok(match pooled {
            Some(spare) => stream.owning(spare),
            None => stream,
        })
    }

    fn has_capacity(&self) -> bool {
        self.accounting.has_capacity()
    }
}
