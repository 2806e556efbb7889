//! Transport traits

use crate::error::TransportResult;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carried by one logical channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed channel streams
pub type BoxedStream = Box<dyn ChannelIo>;

/// A live, authenticated, multiplexed connection to the remote host
///
/// Channels opened on it are independent; closing one does not affect the
/// others. Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait TunnelTransport: Send + Sync + Debug {
    /// Open a logical channel that the remote end connects to `host:port`
    async fn open_channel(&self, host: &str, port: u16) -> TransportResult<BoxedStream>;

    /// Lightweight liveness probe (keep-alive request)
    async fn probe(&self) -> TransportResult<()>;

    /// Tear the connection down. Calling it twice is harmless.
    async fn close(&self);

    /// Whether the connection is already known to be gone
    fn is_closed(&self) -> bool;

    /// Stable identifier for logging
    fn connection_id(&self) -> &str;
}

/// Shared handle to a transport connection
pub type SharedTransport = Arc<dyn TunnelTransport>;

/// Dials and authenticates new transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    async fn connect(&self) -> TransportResult<SharedTransport>;

    /// Human-readable remote address for log lines
    fn remote_address(&self) -> String;
}
