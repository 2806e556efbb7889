//! In-process transport for tests
//!
//! Channels are plain TCP connections made from this process, so the
//! proxy front ends can be exercised end to end without an SSH server.
//! The connector exposes switches to make dials fail, hang, or produce
//! transports that are already dead or stop answering.

use crate::error::{TransportError, TransportResult};
use crate::transport::{BoxedStream, SharedTransport, TransportConnector, TunnelTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;

#[derive(Debug, Default)]
struct LoopbackState {
    fail_connect: AtomicBool,
    hang_connect: AtomicBool,
    dead_on_arrival: AtomicBool,
    hang_channels: AtomicBool,
    /// Transports created before this generation never answer a probe
    stalled_before: AtomicUsize,
    /// Transports created before this generation count as dead
    killed_before: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    channels: AtomicUsize,
}

/// Connector producing [`LoopbackTransport`]s
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<LoopbackState>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail with a connect error
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls never complete
    pub fn set_hang_connect(&self, hang: bool) {
        self.state.hang_connect.store(hang, Ordering::SeqCst);
    }

    /// New transports fail their probe and refuse channels
    pub fn set_dead_on_arrival(&self, dead: bool) {
        self.state.dead_on_arrival.store(dead, Ordering::SeqCst);
    }

    /// `open_channel` never completes
    pub fn set_hang_channels(&self, hang: bool) {
        self.state.hang_channels.store(hang, Ordering::SeqCst);
    }

    /// Simulate every session created so far going half-open: it still
    /// looks connected but its probes never complete
    pub fn set_stall_probes(&self, stall: bool) {
        let before = if stall {
            self.state.connects.load(Ordering::SeqCst) + 1
        } else {
            0
        };
        self.state.stalled_before.store(before, Ordering::SeqCst);
    }

    /// Simulate the remote end dropping every session created so far
    pub fn kill_existing(&self) {
        let current = self.state.connects.load(Ordering::SeqCst);
        self.state.killed_before.store(current + 1, Ordering::SeqCst);
    }

    /// Successful connects so far
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Transports closed so far
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Channels opened so far
    pub fn channels(&self) -> usize {
        self.state.channels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn connect(&self) -> TransportResult<SharedTransport> {
        if self.state.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: self.remote_address(),
                reason: "loopback connect disabled".to_string(),
            });
        }

        let n = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(LoopbackTransport {
            id: format!("loopback-{}", n),
            generation: n,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(self.state.dead_on_arrival.load(Ordering::SeqCst)),
        }))
    }

    fn remote_address(&self) -> String {
        "loopback".to_string()
    }
}

/// Transport whose channels are direct local TCP connections
#[derive(Debug)]
pub struct LoopbackTransport {
    id: String,
    generation: usize,
    state: Arc<LoopbackState>,
    closed: AtomicBool,
    dead: AtomicBool,
}

#[async_trait]
impl TunnelTransport for LoopbackTransport {
    async fn open_channel(&self, host: &str, port: u16) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.state.hang_channels.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let stream = TcpStream::connect((host, port)).await?;
        self.state.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    async fn probe(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.generation < self.state.stalled_before.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.dead.load(Ordering::SeqCst)
            || self.generation < self.state.killed_before.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> &str {
        &self.id
    }
}
