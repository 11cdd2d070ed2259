// src/proxy/client.rs
use crate::config::ControlFraming;
use crate::proxy::envelope::{decode_address_list, ControlMessage, EnvelopeCodec};
use crate::proxy::ProxyError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Speaks the control side of the wire protocol: each call dials a fresh
/// connection to the proxy port and writes one envelope.
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: String,
    timeout: Duration,
    codec: EnvelopeCodec,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            codec: EnvelopeCodec::default(),
        }
    }

    pub fn with_framing(mut self, framing: ControlFraming) -> Self {
        self.codec = EnvelopeCodec::new(framing);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Announce `backend_addr` as alive.
    pub async fn send_heartbeat(&self, backend_addr: &str) -> Result<(), ProxyError> {
        let mut conn = self.connect().await?;
        self.send(&mut conn, &ControlMessage::Heartbeat(backend_addr.to_string()))
            .await
    }

    /// Ask the proxy to stop listening and drop every session.
    pub async fn stop_listening(&self) -> Result<(), ProxyError> {
        let mut conn = self.connect().await?;
        self.send(&mut conn, &ControlMessage::StopListening).await
    }

    /// Fetch the sorted list of alive backends.
    pub async fn list_alive(&self) -> Result<Vec<String>, ProxyError> {
        let mut conn = self.connect().await?;
        self.send(&mut conn, &ControlMessage::ListAlive).await?;

        let deadline = Instant::now() + self.timeout;
        let mut received = Vec::new();
        let mut buffer = [0u8; 1024];

        loop {
            let n = match tokio::time::timeout_at(deadline, conn.read(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Err(ProxyError::Timeout("alive list read")),
            };
            if n == 0 {
                return decode_address_list(&received).map_err(|_| ProxyError::NoResponse);
            }

            received.extend_from_slice(&buffer[..n]);
            // the reply is unframed, keep reading until it parses
            if let Ok(addresses) = decode_address_list(&received) {
                return Ok(addresses);
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, ProxyError> {
        let conn = match timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(ProxyError::Connect {
                    addr: self.addr.clone(),
                    source,
                })
            }
            Err(_) => return Err(ProxyError::Timeout("proxy dial")),
        };

        debug!(local = ?conn.local_addr().ok(), remote = %self.addr, "Create a client connection");
        Ok(conn)
    }

    async fn send(&self, conn: &mut TcpStream, message: &ControlMessage) -> Result<(), ProxyError> {
        let data = self.codec.encode(message)?;
        match timeout(self.timeout, conn.write_all(&data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout("control write")),
        }
    }
}
