//! Classification of benign network errors
//!
//! Clients routinely hang up mid-transfer. Those errors are expected churn
//! and get logged at debug level instead of reaching the diagnostic stream.

const NOISE_PATTERNS: &[&str] = &[
    "broken pipe",
    "connection reset",
    "reset by peer",
    "eof",
    "timed out",
    "timeout",
    "use of closed network connection",
    "connection closed",
    "channel closed",
];

/// True if `message` describes routine disconnect churn
pub fn is_network_noise(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NOISE_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_is_recognised() {
        assert!(is_network_noise("write: Broken pipe (os error 32)"));
        assert!(is_network_noise("Connection reset by peer (os error 104)"));
        assert!(is_network_noise("unexpected EOF"));
        assert!(is_network_noise("read timed out"));
        assert!(is_network_noise("i/o timeout"));
        assert!(is_network_noise("use of closed network connection"));
    }

    #[test]
    fn test_real_failures_are_not_noise() {
        assert!(!is_network_noise("Authentication failed: permission denied"));
        assert!(!is_network_noise("Failed to open channel to example.com:443: administratively prohibited"));
        assert!(!is_network_noise("Connected to SSH server host:22"));
    }
}
