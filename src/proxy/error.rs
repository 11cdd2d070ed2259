// src/proxy/error.rs
use crate::config::ConfigError;
use crate::load_balancer::LoadBalancerError;
use crate::proxy::envelope::EnvelopeError;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No backend available")]
    NoBackendAvailable,

    #[error("Failed to dial backend {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to proxy at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Policy(#[from] LoadBalancerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Proxy engine is already started")]
    AlreadyStarted,

    #[error("Proxy engine has stopped")]
    EngineStopped,

    #[error("Proxy engine must be created inside a tokio runtime")]
    NoRuntime,

    #[error("Proxy engine is not listening")]
    NotListening,

    #[error("Connection closed before a response arrived")]
    NoResponse,
}

impl ProxyError {
    /// Timeouts and resets are routine for a forwarding pairing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout(_)
                | ProxyError::Io(_)
                | ProxyError::Dial { .. }
                | ProxyError::Connect { .. }
        )
    }
}
