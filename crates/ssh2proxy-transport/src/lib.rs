//! SSH transport layer for the local proxy
//!
//! One authenticated SSH session acts as a multiplexed tunnel: every proxied
//! TCP connection becomes a `direct-tcpip` channel on it. This crate owns
//! that session's lifecycle.
//!
//! ```text
//!   StreamDispatcher (ssh2proxy-server)
//!          │
//!          ├── ConnectionPool ──── spare sessions, topped up in the background
//!          │
//!          └── TransportManager ── primary session: health probe, reconnect
//!                    │
//!                    └── TransportConnector ── SshConnector (russh)
//! ```
//!
//! The [`TunnelTransport`] / [`TransportConnector`] traits keep the manager
//! and pool independent of russh so they can be exercised with in-process
//! transports.

pub mod backoff;
pub mod error;
pub mod events;
pub mod manager;
pub mod pool;
pub mod ssh;
pub mod transport;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use backoff::{Backoff, BackoffStop, ReconnectPolicy};
pub use error::{TransportError, TransportResult};
pub use events::{EventSink, NullSink, SharedSink};
pub use manager::TransportManager;
pub use pool::ConnectionPool;
pub use ssh::{SshAuth, SshConnector, SshSettings};
pub use transport::{BoxedStream, ChannelIo, SharedTransport, TransportConnector, TunnelTransport};
