use ssh2proxy_transport::TransportError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SSH host must not be empty")]
    MissingHost,

    #[error("SSH user must not be empty")]
    MissingUser,

    #[error("Either a password or a private key is required")]
    MissingCredentials,

    #[error("Password and private key are mutually exclusive")]
    ConflictingCredentials,

    #[error("Failed to read private key {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Unknown proxy mode '{0}' (expected socks5 or http)")]
    UnknownMode(String),
}

/// Errors from opening a tracked stream to a target
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Connection limit reached ({limit} active)")]
    Capacity { limit: usize },

    #[error("Dial to {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Proxy is shutting down")]
    Shutdown,

    #[error("{0}")]
    Protocol(String),
}

impl DispatchError {
    /// The target actively refused the connection
    pub fn is_refused(&self) -> bool {
        match self {
            DispatchError::Transport(TransportError::Io(e)) => {
                e.kind() == io::ErrorKind::ConnectionRefused
            }
            DispatchError::Transport(TransportError::Channel { reason, .. }) => {
                let reason = reason.to_ascii_lowercase();
                reason.contains("refused") || reason.contains("connectfailed")
            }
            _ => false,
        }
    }

    /// The target network could not be reached at all
    pub fn is_network_unreachable(&self) -> bool {
        let message = self.to_string().to_ascii_lowercase();
        message.contains("network is unreachable") || message.contains("no route to host")
    }
}

/// Lifecycle errors returned by `ProxyServer::start`
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Proxy instance not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Authentication(reason) => ProxyError::Authentication(reason),
            other => ProxyError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_classification() {
        let err = DispatchError::from(TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        )));
        assert!(err.is_refused());
        assert!(!err.is_network_unreachable());

        let err = DispatchError::from(TransportError::Channel {
            target: "10.0.0.1:80".to_string(),
            reason: "Channel open failure: ConnectFailed".to_string(),
        });
        assert!(err.is_refused());
    }

    #[test]
    fn test_unreachable_classification() {
        let err = DispatchError::from(TransportError::Io(io::Error::new(
            io::ErrorKind::Other,
            "Network is unreachable (os error 101)",
        )));
        assert!(err.is_network_unreachable());
        assert!(!DispatchError::Capacity { limit: 1 }.is_network_unreachable());
    }

    #[test]
    fn test_authentication_maps_to_proxy_error() {
        let err = ProxyError::from(TransportError::Authentication("denied".to_string()));
        assert!(matches!(err, ProxyError::Authentication(_)));

        let err = ProxyError::from(TransportError::Closed);
        assert!(matches!(err, ProxyError::Transport(TransportError::Closed)));
    }
}
