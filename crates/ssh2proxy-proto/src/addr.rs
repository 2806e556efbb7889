//! `host:port` helpers shared by the SOCKS5 and HTTP front ends

use std::net::Ipv6Addr;

/// Split a `host:port` string where the port is mandatory.
///
/// IPv6 literals must be bracketed (`[::1]:443`). Returns `None` when the
/// port is missing or not a valid `u16`.
pub fn split_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = address.rsplit_once(':')?;
        // A bare IPv6 literal has more than one colon and no brackets
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

/// Split an HTTP authority, falling back to `default_port` when it carries none.
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(parsed) = split_host_port(authority) {
        return Some(parsed);
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let host = rest.strip_suffix(']')?;
        return (!host.is_empty()).then(|| (host.to_string(), default_port));
    }

    if authority.parse::<Ipv6Addr>().is_ok() {
        return Some((authority.to_string(), default_port));
    }

    if authority.contains(':') {
        // Had a colon but the port did not parse
        return None;
    }

    Some((authority.to_string(), default_port))
}

/// Inverse of [`split_host_port`]: brackets IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            split_host_port("10.0.0.1:80"),
            Some(("10.0.0.1".to_string(), 80))
        );
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1".to_string(), 8080)));
        assert_eq!(split_host_port("example.com"), None);
        assert_eq!(split_host_port("example.com:http"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("::1:80"), None);
    }

    #[test]
    fn test_split_authority_defaults() {
        assert_eq!(
            split_authority("example.com", 443),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            split_authority("example.com:8443", 443),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(split_authority("[2001:db8::1]", 80), Some(("2001:db8::1".to_string(), 80)));
        assert_eq!(split_authority("", 80), None);
        assert_eq!(split_authority("example.com:abc", 80), None);
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
    }
}
