//! Local SOCKS5 / HTTP proxy over a single SSH session
//!
//! ```text
//!   client ──► Socks5Server / HttpProxyServer
//!                     │
//!                     ▼
//!              StreamDispatcher ── ConnectionAccounting (ceiling)
//!                     │
//!                     ▼
//!   TransportManager / ConnectionPool ──► direct-tcpip channel ──► target
//! ```
//!
//! Start an instance with [`ProxyServer`], or keep several in a
//! [`ProxyRegistry`]. Human-readable events are streamed on `GET /logs`
//! (Server-Sent Events) when a log address is configured.

pub mod accounting;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod logsink;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socks5;

pub use accounting::{ActiveSlot, ConnectionAccounting, DeadlineStream, TrackedStream};
pub use config::{KeySource, ProxyConfig, ProxyLimits, ProxyMode, ProxyTimeouts};
pub use dispatcher::{DispatchTimeouts, StreamDispatcher, StreamOpener};
pub use error::{ConfigError, DispatchError, ProxyError};
pub use logsink::{DiagnosticLog, LogPump, LogServer, LOG_CHANNEL_CAPACITY};
pub use registry::{ProxyId, ProxyRegistry};
pub use server::ProxyServer;
