// src/proxy/forward.rs
use crate::metrics::{Direction, MetricsCollector};
use crate::proxy::{ProxyError, ProxySession};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};

/// How a pairing finished without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEnd {
    ClientClosed,
    BackendClosed,
    Shutdown,
}

impl PairingEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            PairingEnd::ClientClosed => "client_closed",
            PairingEnd::BackendClosed => "backend_closed",
            PairingEnd::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PairingSettings {
    pub rw_timeout: Duration,
    pub buffer_size: usize,
}

/// Resolve once the engine-wide shutdown flag is set (or its sender is gone).
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Last moment either direction of a pairing moved bytes.
///
/// Stored as milliseconds since the pairing began so both copy tasks can
/// push it forward without a lock.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis();
        self.last_ms
            .fetch_max(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Resolve once neither side has moved bytes for `window`.
async fn idle_expired(activity: &Activity, window: Duration) {
    loop {
        let deadline = activity.last() + window;
        if Instant::now() >= deadline {
            return;
        }
        sleep_until(deadline).await;
    }
}

/// Run the two copy directions between a client session and `backend`.
///
/// Client to backend runs inline on the session's read half; backend to
/// client runs as its own task. The read deadline belongs to the pairing as
/// a whole: traffic in either direction pushes it forward, so a silent
/// client does not cut off a backend that is still streaming. The first
/// direction to finish ends the pairing, the other one is aborted and the
/// backend socket is dropped.
pub(crate) async fn run_pairing(
    session: &Arc<ProxySession>,
    client_reader: &mut OwnedReadHalf,
    backend: TcpStream,
    first_chunk: &[u8],
    settings: PairingSettings,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<PairingEnd, ProxyError> {
    let (backend_reader, mut backend_writer) = backend.into_split();
    let activity = Arc::new(Activity::new());

    let mut downstream = tokio::spawn(copy_downstream(
        backend_reader,
        session.clone(),
        settings,
        activity.clone(),
        metrics.clone(),
    ));

    let upstream = copy_upstream(
        client_reader,
        &mut backend_writer,
        first_chunk,
        settings,
        &activity,
        metrics.as_deref(),
    );

    let (outcome, downstream_done) = tokio::select! {
        result = upstream => (result, false),
        joined = &mut downstream => {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
            };
            (result, true)
        }
        _ = idle_expired(&activity, settings.rw_timeout) => {
            (Err(ProxyError::Timeout("pairing idle")), false)
        }
        _ = wait_for_shutdown(shutdown_rx) => (Ok(PairingEnd::Shutdown), false),
    };

    if !downstream_done {
        downstream.abort();
        let _ = downstream.await;
    }
    let _ = backend_writer.shutdown().await;

    if let Some(metrics) = &metrics {
        let label = match &outcome {
            Ok(end) => end.as_str(),
            Err(_) => "error",
        };
        metrics.record_pairing(label);
    }

    outcome
}

async fn copy_upstream(
    client_reader: &mut OwnedReadHalf,
    backend_writer: &mut OwnedWriteHalf,
    first_chunk: &[u8],
    settings: PairingSettings,
    activity: &Activity,
    metrics: Option<&MetricsCollector>,
) -> Result<PairingEnd, ProxyError> {
    write_with_deadline(backend_writer, first_chunk, settings.rw_timeout).await?;
    activity.touch();
    if let Some(metrics) = metrics {
        metrics.record_bytes(Direction::Upstream, first_chunk.len());
    }

    let mut buffer = vec![0u8; settings.buffer_size];
    loop {
        let n = match client_reader.read(&mut buffer).await? {
            0 => return Ok(PairingEnd::ClientClosed),
            n => n,
        };
        activity.touch();

        write_with_deadline(backend_writer, &buffer[..n], settings.rw_timeout).await?;
        if let Some(metrics) = metrics {
            metrics.record_bytes(Direction::Upstream, n);
        }
    }
}

async fn copy_downstream(
    mut backend_reader: OwnedReadHalf,
    session: Arc<ProxySession>,
    settings: PairingSettings,
    activity: Arc<Activity>,
    metrics: Option<Arc<MetricsCollector>>,
) -> Result<PairingEnd, ProxyError> {
    let mut buffer = vec![0u8; settings.buffer_size];
    loop {
        let n = match backend_reader.read(&mut buffer).await? {
            0 => return Ok(PairingEnd::BackendClosed),
            n => n,
        };
        activity.touch();

        session.write_all(&buffer[..n], settings.rw_timeout).await?;
        if let Some(metrics) = &metrics {
            metrics.record_bytes(Direction::Downstream, n);
        }
    }
}

async fn write_with_deadline(
    writer: &mut OwnedWriteHalf,
    data: &[u8],
    deadline: Duration,
) -> Result<(), ProxyError> {
    match timeout(deadline, writer.write_all(data)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProxyError::Timeout("backend write")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Harness {
        session: Arc<ProxySession>,
        client: TcpStream,
        client_reader: OwnedReadHalf,
        backend_listener: TcpListener,
    }

    async fn harness() -> Harness {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (accepted, peer) = front.accept().await.unwrap();
        let (client_reader, writer) = accepted.into_split();

        Harness {
            session: Arc::new(ProxySession::new(peer, writer)),
            client,
            client_reader,
            backend_listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn settings() -> PairingSettings {
        PairingSettings {
            rw_timeout: Duration::from_secs(2),
            buffer_size: 64,
        }
    }

    #[tokio::test]
    async fn test_backend_close_ends_pairing() {
        let Harness {
            session,
            mut client,
            mut client_reader,
            backend_listener,
        } = harness().await;
        let backend_addr = backend_listener.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut conn, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong:").await.unwrap();
            conn.write_all(&buf).await.unwrap();
            // dropping conn closes the backend side
        });

        let backend = TcpStream::connect(backend_addr).await.unwrap();
        let (_tx, mut shutdown_rx) = watch::channel(false);
        let end = run_pairing(
            &session,
            &mut client_reader,
            backend,
            b"abc",
            settings(),
            None,
            &mut shutdown_rx,
        )
        .await
        .unwrap();

        assert_eq!(end, PairingEnd::BackendClosed);
        backend_task.await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong:abc");
        // the client connection itself survives the pairing
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_client_close_ends_pairing_and_backend() {
        let Harness {
            session,
            client,
            mut client_reader,
            backend_listener,
        } = harness().await;
        let backend_addr = backend_listener.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut conn, _) = backend_listener.accept().await.unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        drop(client);
        let backend = TcpStream::connect(backend_addr).await.unwrap();
        let (_tx, mut shutdown_rx) = watch::channel(false);
        let end = run_pairing(
            &session,
            &mut client_reader,
            backend,
            b"first",
            settings(),
            None,
            &mut shutdown_rx,
        )
        .await
        .unwrap();

        assert_eq!(end, PairingEnd::ClientClosed);
        assert_eq!(backend_task.await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pairing() {
        let Harness {
            session,
            client: _client,
            mut client_reader,
            backend_listener,
        } = harness().await;
        let backend_addr = backend_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (conn, _) = backend_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });

        let backend = TcpStream::connect(backend_addr).await.unwrap();
        let (tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let end = run_pairing(
            &session,
            &mut client_reader,
            backend,
            b"x",
            settings(),
            None,
            &mut shutdown_rx,
        )
        .await
        .unwrap();
        assert_eq!(end, PairingEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_streaming_backend_outlives_quiet_client() {
        let Harness {
            session,
            mut client,
            mut client_reader,
            backend_listener,
        } = harness().await;
        let backend_addr = backend_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = backend_listener.accept().await.unwrap();
            let mut request = [0u8; 3];
            conn.read_exact(&mut request).await.unwrap();
            for digit in b"012345" {
                tokio::time::sleep(Duration::from_millis(120)).await;
                conn.write_all(&[*digit]).await.unwrap();
            }
        });

        let settings = PairingSettings {
            rw_timeout: Duration::from_millis(300),
            buffer_size: 64,
        };
        let backend = TcpStream::connect(backend_addr).await.unwrap();
        let (_tx, mut shutdown_rx) = watch::channel(false);
        let end = run_pairing(
            &session,
            &mut client_reader,
            backend,
            b"GET",
            settings,
            None,
            &mut shutdown_rx,
        )
        .await
        .unwrap();
        assert_eq!(end, PairingEnd::BackendClosed);

        let mut received = [0u8; 6];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"012345");
    }

    #[tokio::test]
    async fn test_both_sides_idle_times_out() {
        let Harness {
            session,
            client: _client,
            mut client_reader,
            backend_listener,
        } = harness().await;
        let backend_addr = backend_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (conn, _) = backend_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });

        let settings = PairingSettings {
            rw_timeout: Duration::from_millis(200),
            buffer_size: 64,
        };
        let backend = TcpStream::connect(backend_addr).await.unwrap();
        let (_tx, mut shutdown_rx) = watch::channel(false);
        let started = Instant::now();
        let result = run_pairing(
            &session,
            &mut client_reader,
            backend,
            b"x",
            settings,
            None,
            &mut shutdown_rx,
        )
        .await;

        assert!(matches!(result, Err(ProxyError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pushes_deadline_forward() {
        let activity = Activity::new();
        let window = Duration::from_millis(500);

        tokio::time::sleep(Duration::from_millis(400)).await;
        activity.touch();
        assert!(
            tokio::time::timeout(Duration::from_millis(300), idle_expired(&activity, window))
                .await
                .is_err()
        );

        tokio::time::timeout(Duration::from_millis(300), idle_expired(&activity, window))
            .await
            .unwrap();
    }
}
