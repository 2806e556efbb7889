//! Proxy lifecycle
//!
//! [`ProxyServer`] wires the pieces together: diagnostic log endpoint,
//! transport manager, spare pool, dispatcher and the front end for the
//! configured mode. Everything it spawns runs on one [`TaskTracker`] so
//! [`ProxyServer::stop`] can wait for it.

use crate::accounting::ConnectionAccounting;
use crate::config::{ProxyConfig, ProxyMode};
use crate::dispatcher::{DispatchTimeouts, StreamDispatcher};
use crate::error::ProxyError;
use crate::http::HttpProxyServer;
use crate::logsink::{DiagnosticLog, LogPump, LogServer, LOG_CHANNEL_CAPACITY};
use crate::relay::FrontendContext;
use crate::socks5::Socks5Server;
use ssh2proxy_transport::{
    ConnectionPool, SharedSink, SshConnector, TransportConnector, TransportManager,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State of one started instance
struct Running {
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tasks: TaskTracker,
    manager: Arc<TransportManager>,
    pool: Arc<ConnectionPool>,
    accounting: Arc<ConnectionAccounting>,
    local_addr: SocketAddr,
    log_addr: Option<SocketAddr>,
}

pub struct ProxyServer {
    config: ProxyConfig,
    connector: Arc<dyn TransportConnector>,
    log: DiagnosticLog,
    pump: Mutex<Option<LogPump>>,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
    state: watch::Sender<bool>,
}

impl ProxyServer {
    /// Validate the config and prepare an SSH connector. Nothing is dialed
    /// until [`ProxyServer::start`].
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let settings = config.ssh_settings()?;
        let connector = SshConnector::new(settings)?;
        Ok(Self::build(config, Arc::new(connector)))
    }

    /// Use `connector` instead of SSH
    pub fn with_connector(
        config: ProxyConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        Ok(Self::build(config, connector))
    }

    fn build(config: ProxyConfig, connector: Arc<dyn TransportConnector>) -> Self {
        let (log, pump) = DiagnosticLog::new(LOG_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(false);
        Self {
            config,
            connector,
            log,
            pump: Mutex::new(Some(pump)),
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
            state,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn log(&self) -> &DiagnosticLog {
        &self.log
    }

    /// Bring the proxy up. Returns once the front-end listener is bound;
    /// fails without leaving anything listening if the first SSH session
    /// cannot be established.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning);
        }
        self.spawn_pump();

        let config = &self.config;
        let timeouts = &config.timeouts;
        let events: SharedSink = Arc::new(self.log.clone());

        self.log.info(format!(
            "Starting {} proxy via {}@{}:{}",
            config.proxy_mode, config.ssh_user, config.ssh_host, config.ssh_port
        ));

        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let force_close = CancellationToken::new();

        // Stopped on its own if the primary never comes up
        let log_cancel = shutdown.child_token();
        let log_addr = match &config.log_addr {
            Some(addr) => {
                let server = LogServer::bind(addr, self.log.clone())
                    .await
                    .map_err(|e| ProxyError::Bind {
                        address: addr.clone(),
                        reason: e.to_string(),
                    })?;
                let bound = server.local_addr()?;
                let cancel = log_cancel.clone();
                tasks.spawn(async move {
                    if let Err(e) = server.run(cancel).await {
                        warn!("Diagnostic log endpoint failed: {}", e);
                    }
                });
                Some(bound)
            }
            None => None,
        };

        let manager = Arc::new(
            TransportManager::new(
                self.connector.clone(),
                timeouts.reconnect_policy(),
                timeouts.health_probe,
            )
            .with_events(events.clone()),
        );

        if let Err(e) = manager.connect_primary().await {
            self.log
                .error(format!("Failed to establish SSH connection: {}", e));
            log_cancel.cancel();
            tasks.close();
            tasks.wait().await;
            return Err(e.into());
        }
        self.log.info(format!(
            "SSH connection established to {}",
            self.connector.remote_address()
        ));

        let pool = Arc::new(
            ConnectionPool::new(config.limits.pool_capacity, config.limits.pool_target)
                .with_events(events),
        );
        tasks.spawn(pool.clone().run_maintainer(
            self.connector.clone(),
            timeouts.pool_tick,
            shutdown.clone(),
        ));
        tasks.spawn(
            manager
                .clone()
                .run_monitor(timeouts.health_interval, shutdown.clone()),
        );

        let accounting = ConnectionAccounting::new(config.limits.max_connections);
        tasks.spawn(report_status(
            manager.clone(),
            accounting.clone(),
            timeouts.health_interval,
            shutdown.clone(),
        ));

        let listen_addr = config.listen_addr();
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                shutdown.cancel();
                manager.shutdown().await;
                tasks.close();
                tasks.wait().await;
                self.log
                    .error(format!("Failed to listen on {}: {}", listen_addr, e));
                return Err(ProxyError::Bind {
                    address: listen_addr,
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = listener.local_addr()?;

        let dispatcher = StreamDispatcher::new(
            manager.clone(),
            pool.clone(),
            accounting.clone(),
            DispatchTimeouts {
                dial: timeouts.dial,
                read: timeouts.read,
                write: timeouts.write,
            },
            self.log.clone(),
            shutdown.clone(),
        );

        let ctx = FrontendContext {
            opener: Arc::new(dispatcher),
            tasks: tasks.clone(),
            shutdown: shutdown.clone(),
            force_close: force_close.clone(),
            log: self.log.clone(),
            handshake_timeout: timeouts.header_read,
        };
        match config.proxy_mode {
            ProxyMode::Socks5 => tasks.spawn(Socks5Server::new(ctx).serve(listener)),
            ProxyMode::Http => tasks.spawn(HttpProxyServer::new(ctx).serve(listener)),
        };

        self.log.info(format!(
            "{} proxy listening on {}",
            config.proxy_mode, local_addr
        ));

        *self.lock_running() = Some(Running {
            shutdown,
            force_close,
            tasks,
            manager,
            pool,
            accounting,
            local_addr,
            log_addr,
        });
        self.state.send_replace(true);
        Ok(())
    }

    /// Shut everything down. Relays get the configured grace period before
    /// they are forced closed. Calling this on a stopped proxy is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.lock_running().take() else {
            debug!("Proxy already stopped");
            return;
        };

        self.log.info("Stopping proxy");
        running.shutdown.cancel();

        let drained = running.pool.drain().await;
        if drained > 0 {
            debug!("Closed {} pooled SSH connections", drained);
        }
        running.manager.shutdown().await;

        running.tasks.close();
        let grace = self.config.timeouts.shutdown_grace;
        if tokio::time::timeout(grace, running.tasks.wait()).await.is_err() {
            warn!(
                "{} connections still open after {:?}, closing them",
                running.accounting.active(),
                grace
            );
            running.force_close.cancel();
            if tokio::time::timeout(grace, running.tasks.wait())
                .await
                .is_err()
            {
                warn!("{} proxy tasks did not finish", running.tasks.len());
            }
        }

        info!("Proxy stopped");
        self.state.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Resolves once the proxy is not running
    pub async fn wait_stopped(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|running| !running).await;
    }

    /// Bound front-end address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.local_addr)
    }

    /// Bound diagnostic endpoint address while running
    pub fn log_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().and_then(|r| r.log_addr)
    }

    pub fn active_connections(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map(|r| r.accounting.active())
            .unwrap_or(0)
    }

    /// Spare transports currently pooled
    pub fn pooled_connections(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map(|r| r.pool.len())
            .unwrap_or(0)
    }

    fn spawn_pump(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            tokio::spawn(pump.run());
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.shutdown.cancel();
            running.force_close.cancel();
        }
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("mode", &self.config.proxy_mode)
            .field("remote", &self.connector.remote_address())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Periodic status line
async fn report_status(
    manager: Arc<TransportManager>,
    accounting: Arc<ConnectionAccounting>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let connected = manager.is_connected().await;
        debug!(
            active = accounting.active(),
            ceiling = accounting.ceiling(),
            connected,
            "Proxy status"
        );
    }
}
