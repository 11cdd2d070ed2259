// src/server/groups.rs
use crate::config::ProxyConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{EngineState, ProxyEngine, ProxyError};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("No proxy group on port {0}")]
    NotFound(u16),

    #[error("Proxy group on port {0} is not listening")]
    NotListening(u16),

    #[error("Proxy group on port {0} is already listening")]
    AlreadyOpen(u16),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Proxy engines keyed by the TCP port they listen on.
pub struct ProxyGroups {
    config: ProxyConfig,
    metrics: Option<Arc<MetricsCollector>>,
    engines: DashMap<u16, Arc<ProxyEngine>>,
}

impl ProxyGroups {
    pub fn new(config: ProxyConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            config,
            metrics,
            engines: DashMap::new(),
        }
    }

    /// Create and start a fresh engine on `port`. A stopped engine on the
    /// same port is replaced; a listening one is an error.
    pub async fn open(&self, port: u16) -> Result<SocketAddr, GroupError> {
        if let Some(existing) = self.get(port) {
            if matches!(existing.state(), EngineState::Listening | EngineState::NotStarted) {
                return Err(GroupError::AlreadyOpen(port));
            }
        }

        let engine = ProxyEngine::new(self.config.clone(), self.metrics.clone())?;
        let addr = engine.start(Some(port)).await?;
        self.engines.insert(addr.port(), engine);

        info!(%addr, "opened proxy group");
        Ok(addr)
    }

    pub async fn close(&self, port: u16) -> Result<(), GroupError> {
        let engine = self.listening(port)?;
        engine.stop().await;
        info!(port, "closed proxy group");
        Ok(())
    }

    pub async fn heartbeat(&self, port: u16, backend: &str) -> Result<(), GroupError> {
        self.listening(port)?.record_heartbeat(backend).await;
        Ok(())
    }

    pub async fn list(&self, port: u16) -> Result<Vec<String>, GroupError> {
        Ok(self.listening(port)?.all_alive().await)
    }

    pub fn get(&self, port: u16) -> Option<Arc<ProxyEngine>> {
        self.engines.get(&port).map(|e| e.clone())
    }

    /// Ports of the groups that are currently listening, sorted.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .engines
            .iter()
            .filter(|entry| entry.value().state() == EngineState::Listening)
            .map(|entry| *entry.key())
            .collect();
        ports.sort_unstable();
        ports
    }

    pub async fn stop_all(&self) {
        let engines: Vec<Arc<ProxyEngine>> =
            self.engines.iter().map(|entry| entry.value().clone()).collect();

        for engine in engines {
            engine.stop().await;
        }
    }

    fn listening(&self, port: u16) -> Result<Arc<ProxyEngine>, GroupError> {
        let engine = self.get(port).ok_or(GroupError::NotFound(port))?;
        if engine.state() != EngineState::Listening {
            return Err(GroupError::NotListening(port));
        }
        Ok(engine)
    }
}
