//! ssh2proxy - local SOCKS5 / HTTP proxy tunnelled through SSH
//!
//! Every connection accepted on the local port is forwarded over one
//! authenticated SSH session, which is health-checked and re-established
//! automatically.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ssh2proxy_server::{KeySource, ProxyConfig, ProxyMode, ProxyServer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SSH2PROXY_COMMIT"),
    ", built ",
    env!("SSH2PROXY_BUILT_AT"),
    ")"
);

/// ssh2proxy - Tunnel a local SOCKS5 or HTTP proxy through an SSH server
#[derive(Parser, Debug)]
#[command(name = "ssh2proxy")]
#[command(version = VERSION)]
#[command(long_about = r#"
Run a local SOCKS5 or HTTP/HTTPS (CONNECT) proxy whose traffic leaves
through an SSH server. Only password and private key authentication
are supported. The SSH host key is not verified.

EXAMPLES:
  # SOCKS5 on 127.0.0.1:1080 using a key
  ssh2proxy --host ssh.example.com --user alice --key ~/.ssh/id_ed25519

  # HTTP proxy on port 8080 using a password from the environment
  SSH2PROXY_PASSWORD=secret ssh2proxy --host 203.0.113.7 --user bob \
    --proxy-type http --lport 8080

  # Everything from a YAML file, overriding the local port
  ssh2proxy --config proxy.yaml --lport 1081
"#)]
struct Cli {
    /// SSH server address
    #[arg(long, env = "SSH2PROXY_HOST")]
    host: Option<String>,

    /// SSH server port [default: 22]
    #[arg(long, env = "SSH2PROXY_PORT")]
    port: Option<u16>,

    /// SSH username
    #[arg(long, env = "SSH2PROXY_USER")]
    user: Option<String>,

    /// SSH password (ignored when --key is given)
    #[arg(long, env = "SSH2PROXY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Path to an SSH private key
    #[arg(long, env = "SSH2PROXY_KEY")]
    key: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "SSH2PROXY_KEY_PASSPHRASE", hide_env_values = true)]
    key_passphrase: Option<String>,

    /// Local proxy port [default: 1080]
    #[arg(long, env = "SSH2PROXY_LPORT")]
    lport: Option<u16>,

    /// Local address to bind [default: 0.0.0.0]
    #[arg(long, env = "SSH2PROXY_BIND")]
    bind: Option<String>,

    /// Proxy protocol: socks5 or http [default: socks5]
    #[arg(long, alias = "proxyType", env = "SSH2PROXY_PROXY_TYPE")]
    proxy_type: Option<ProxyMode>,

    /// Address of the diagnostic log stream (GET /logs) [default: 0.0.0.0:1792]
    #[arg(long, env = "SSH2PROXY_LOG_ADDR")]
    log_addr: Option<String>,

    /// Do not serve the diagnostic log stream
    #[arg(long, env = "SSH2PROXY_NO_LOG_SERVER")]
    no_log_server: bool,

    /// Maximum concurrent proxied connections [default: 100]
    #[arg(long, env = "SSH2PROXY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// YAML config file; command-line flags override its values
    #[arg(long, short = 'c', env = "SSH2PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. info, debug, ssh2proxy_transport=trace)
    #[arg(long, env = "SSH2PROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds to wait for a clean shutdown
    #[arg(long, env = "SSH2PROXY_SHUTDOWN_TIMEOUT", default_value = "1")]
    shutdown_timeout: f64,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config_file(path: &PathBuf) -> Result<ProxyConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Config file (if any) with the command-line flags applied on top
fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => {
            let (Some(host), Some(user)) = (&cli.host, &cli.user) else {
                bail!("Must specify host, user, and either password or key");
            };
            let mut config = ProxyConfig::with_password(host.clone(), user.clone(), String::new());
            config.password = None;
            config
        }
    };

    if let Some(host) = &cli.host {
        config.ssh_host = host.clone();
    }
    if let Some(user) = &cli.user {
        config.ssh_user = user.clone();
    }
    if let Some(port) = cli.port {
        config.ssh_port = port;
    }
    if let Some(key) = &cli.key {
        if cli.password.is_some() {
            warn!("Both --key and --password given; using the key, the password is ignored");
        }
        config.private_key = Some(KeySource::Path(key.clone()));
        config.password = None;
    } else if let Some(password) = &cli.password {
        config.password = Some(password.clone());
        config.private_key = None;
    }
    if let Some(passphrase) = &cli.key_passphrase {
        config.key_passphrase = Some(passphrase.clone());
    }
    if let Some(lport) = cli.lport {
        config.local_port = lport;
    }
    if let Some(bind) = &cli.bind {
        config.bind_host = bind.clone();
    }
    if let Some(mode) = cli.proxy_type {
        config.proxy_mode = mode;
    }
    if let Some(addr) = &cli.log_addr {
        config.log_addr = Some(addr.clone());
    }
    if cli.no_log_server {
        config.log_addr = None;
    }
    if let Some(max) = cli.max_connections {
        config.limits.max_connections = max;
    }

    config
        .validate()
        .context("Invalid configuration")?;
    Ok(config)
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let config = build_config(&cli)?;
    let shutdown_timeout = Duration::try_from_secs_f64(cli.shutdown_timeout)
        .context("Invalid --shutdown-timeout")?;

    info!("ssh2proxy {} starting", VERSION);
    let server = ProxyServer::new(config).context("Failed to create proxy")?;

    if let Err(e) = server.start().await {
        error!("SSH connection error: {}", e);
        return Err(e.into());
    }

    if let Some(addr) = server.local_addr() {
        info!("Proxy listening on {}", addr);
    }
    if let Some(addr) = server.log_addr() {
        info!("Diagnostic logs at http://{}/logs", addr);
    }

    wait_for_signal().await?;
    info!("Shutting down gracefully...");

    match tokio::time::timeout(shutdown_timeout, server.stop()).await {
        Ok(()) => info!("Shutdown completed successfully"),
        Err(_) => warn!("Shutdown timed out"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_build_password_config() {
        let cli = Cli::parse_from([
            "ssh2proxy", "--host", "ssh.example.com", "--user", "alice", "--password", "pw",
            "--proxy-type", "http", "--lport", "8080", "--no-log-server",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.ssh_host, "ssh.example.com");
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.proxy_mode, ProxyMode::Http);
        assert_eq!(config.local_port, 8080);
        assert_eq!(config.log_addr, None);
    }

    #[test]
    fn test_key_wins_over_password() {
        let cli = Cli::parse_from([
            "ssh2proxy", "--host", "h", "--user", "u", "--password", "pw", "--key", "/tmp/id_ed25519",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.password, None);
        assert_eq!(
            config.private_key,
            Some(KeySource::Path(PathBuf::from("/tmp/id_ed25519")))
        );
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let cli = Cli::parse_from(["ssh2proxy", "--user", "u", "--password", "pw"]);
        assert!(build_config(&cli).is_err());
    }
}
