//! Table of running proxy instances keyed by an opaque id

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::server::ProxyServer;
use serde::{Deserialize, Serialize};
use ssh2proxy_transport::TransportConnector;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyId(Uuid);

impl ProxyId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: RwLock<HashMap<ProxyId, Arc<ProxyServer>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an SSH-backed proxy and register it
    pub async fn start(&self, config: ProxyConfig) -> Result<ProxyId, ProxyError> {
        let server = ProxyServer::new(config)?;
        self.register(server).await
    }

    pub async fn start_with_connector(
        &self,
        config: ProxyConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<ProxyId, ProxyError> {
        let server = ProxyServer::with_connector(config, connector)?;
        self.register(server).await
    }

    async fn register(&self, server: ProxyServer) -> Result<ProxyId, ProxyError> {
        server.start().await?;
        let id = ProxyId::new();
        info!(proxy_id = %id, "Registered proxy on {:?}", server.local_addr());
        self.proxies.write().await.insert(id, Arc::new(server));
        Ok(id)
    }

    pub async fn get(&self, id: ProxyId) -> Option<Arc<ProxyServer>> {
        self.proxies.read().await.get(&id).cloned()
    }

    /// Stop and forget one instance
    pub async fn stop(&self, id: ProxyId) -> Result<(), ProxyError> {
        let server = self
            .proxies
            .write()
            .await
            .remove(&id)
            .ok_or(ProxyError::NotFound)?;
        server.stop().await;
        info!(proxy_id = %id, "Proxy removed");
        Ok(())
    }

    /// Stop every instance; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let servers: Vec<_> = self.proxies.write().await.drain().collect();
        let count = servers.len();
        for (id, server) in servers {
            server.stop().await;
            info!(proxy_id = %id, "Proxy removed");
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proxies.read().await.is_empty()
    }
}
