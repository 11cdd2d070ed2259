// src/proxy/session.rs
use crate::metrics::MetricsCollector;
use crate::proxy::ProxyError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

/// One accepted client connection.
///
/// The read half stays with the session's read loop; the write half lives
/// here so control replies and the backend-to-client copy can share it.
#[derive(Debug)]
pub struct ProxySession {
    id: Uuid,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl ProxySession {
    pub fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Session table key and the client identity handed to the balancer.
    pub fn key(&self) -> String {
        self.peer.to_string()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn write_all(&self, data: &[u8], deadline: Duration) -> Result<(), ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Io(std::io::ErrorKind::NotConnected.into()));
        }

        let mut writer = self.writer.lock().await;
        match timeout(deadline, writer.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout("client write")),
        }
    }

    /// Shut the write side down. Returns false if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "client socket already gone");
        }
        true
    }
}

/// Sole owner of the live sessions, keyed by remote address.
pub struct SessionTable {
    sessions: DashMap<String, Arc<ProxySession>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SessionTable {
    pub fn new(metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            sessions: DashMap::new(),
            metrics,
        }
    }

    pub fn add(&self, session: Arc<ProxySession>) {
        if let Some(metrics) = &self.metrics {
            metrics.session_opened();
        }

        if let Some(previous) = self.sessions.insert(session.key(), session) {
            tracing::warn!(
                peer = %previous.peer(),
                "replaced a stale session for the same address"
            );
            if let Some(metrics) = &self.metrics {
                metrics.session_closed();
            }
        }
    }

    /// Remove and close `session`. Closing twice is a no-op.
    pub async fn close(&self, session: &Arc<ProxySession>) {
        let removed = self
            .sessions
            .remove_if(&session.key(), |_, current| Arc::ptr_eq(current, session))
            .is_some();

        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.session_closed();
            }
        }

        if session.close().await {
            tracing::info!(
                peer = %session.peer(),
                session_id = %session.id(),
                "closed client connection"
            );
        }
    }

    /// Force-close every tracked session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<ProxySession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let count = sessions.len();
        for session in sessions {
            self.close(&session).await;
        }
        count
    }

    pub fn get(&self, key: &str) -> Option<Arc<ProxySession>> {
        self.sessions.get(key).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connected client addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn session_pair() -> (Arc<ProxySession>, TcpStream, tokio::net::tcp::OwnedReadHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        let (reader, writer) = server_side.into_split();
        (Arc::new(ProxySession::new(peer, writer)), client, reader)
    }

    #[tokio::test]
    async fn test_write_reaches_client() {
        let (session, mut client, _reader) = session_pair().await;

        session.write_all(b"hello", Duration::from_secs(1)).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let table = SessionTable::new(None);
        let (session, mut client, _reader) = session_pair().await;
        table.add(session.clone());
        assert_eq!(table.len(), 1);

        table.close(&session).await;
        table.close(&session).await;

        assert!(table.is_empty());
        assert!(session.is_closed());
        assert!(session.write_all(b"x", Duration::from_secs(1)).await.is_err());

        // client sees EOF once the write side is shut down
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_table() {
        let table = SessionTable::new(None);
        let (a, _ca, _ra) = session_pair().await;
        let (b, _cb, _rb) = session_pair().await;
        table.add(a.clone());
        table.add(b.clone());

        let mut expected = vec![a.key(), b.key()];
        expected.sort();
        assert_eq!(table.addresses(), expected);

        assert_eq!(table.close_all().await, 2);
        assert!(table.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}
