// src/proxy/engine.rs
use crate::config::ProxyConfig;
use crate::discovery::DiscoveryTracker;
use crate::load_balancer::{load_balancer_for_id, LoadBalancer};
use crate::metrics::MetricsCollector;
use crate::proxy::envelope::{encode_address_list, ControlMessage, EnvelopeCodec};
use crate::proxy::forward::{run_pairing, wait_for_shutdown, PairingEnd, PairingSettings};
use crate::proxy::session::{ProxySession, SessionTable};
use crate::proxy::ProxyError;
use crate::server::listener::bind_tcp;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Listening,
    Draining,
    Stopped,
}

/// Accepts client connections on one port, sniffs each read for control
/// envelopes and forwards everything else to a backend picked by the
/// configured balancer.
pub struct ProxyEngine {
    config: ProxyConfig,
    codec: EnvelopeCodec,
    tracker: Arc<DiscoveryTracker>,
    balancer: Arc<dyn LoadBalancer>,
    sessions: SessionTable,
    metrics: Option<Arc<MetricsCollector>>,
    state_tx: watch::Sender<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyEngine {
    /// Build an engine and start its discovery sweep, so heartbeats expire
    /// even before the engine listens. An unknown `lb_policy` refuses
    /// construction. Must be called inside a tokio runtime.
    pub fn new(
        config: ProxyConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Arc<Self>, ProxyError> {
        config.validate()?;
        let balancer = load_balancer_for_id(config.lb_policy)?;
        let runtime = Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;

        let (state_tx, _) = watch::channel(EngineState::NotStarted);
        let (shutdown_tx, _) = watch::channel(false);

        let engine = Arc::new(Self {
            codec: EnvelopeCodec::new(config.control_framing),
            tracker: Arc::new(DiscoveryTracker::from_config(&config, metrics.clone())),
            balancer,
            sessions: SessionTable::new(metrics.clone()),
            metrics,
            state_tx,
            shutdown_tx,
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
            config,
        });

        runtime.spawn(engine.tracker.clone().start(engine.shutdown_tx.subscribe()));
        Ok(engine)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    pub fn tracker(&self) -> &Arc<DiscoveryTracker> {
        &self.tracker
    }

    /// Bind the listener and spawn the accept loop and the status report.
    /// `None` listens on the configured `tcp_port`;
    /// `Some(0)` picks an ephemeral port.
    pub async fn start(self: &Arc<Self>, port: Option<u16>) -> Result<SocketAddr, ProxyError> {
        let mut accept_task = self.accept_task.lock().await;

        match self.state() {
            EngineState::NotStarted => {}
            EngineState::Listening => return Err(ProxyError::AlreadyStarted),
            EngineState::Draining | EngineState::Stopped => return Err(ProxyError::EngineStopped),
        }

        let addr = self.config.listen_addr(port.unwrap_or(self.config.tcp_port))?;
        let listener = bind_tcp(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let _ = self.local_addr.set(local_addr);
        self.state_tx.send_replace(EngineState::Listening);

        self.tracker.attach_group(local_addr.port().to_string()).await;
        tokio::spawn(self.clone().report_status(self.shutdown_tx.subscribe()));
        *accept_task = Some(tokio::spawn(
            self.clone().accept_loop(listener, self.shutdown_tx.subscribe()),
        ));

        info!(
            addr = %local_addr,
            policy = self.balancer.name(),
            framing = ?self.codec.framing(),
            "Start to listen tcp port"
        );
        Ok(local_addr)
    }

    /// Close the listener and every session, and stop the background tasks.
    ///
    /// Only the first call does anything; later calls return once the
    /// first one has finished.
    pub async fn stop(&self) {
        let mut accept_task = self.accept_task.lock().await;

        let first = self.shutdown_tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if !first {
            return;
        }

        if self.state() == EngineState::NotStarted {
            self.state_tx.send_replace(EngineState::Stopped);
            return;
        }

        info!("Stopping proxy service");
        self.state_tx.send_replace(EngineState::Draining);

        if let Some(handle) = accept_task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "accept loop ended abnormally");
            }
        }

        let closed = self.sessions.close_all().await;
        self.tracker.detach_group();
        self.state_tx.send_replace(EngineState::Stopped);
        info!(sessions_closed = closed, "Stopped proxy service");
    }

    /// Resolve once the engine reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state_tx.subscribe();
        while *state_rx.borrow() != EngineState::Stopped {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn record_heartbeat(&self, address: &str) {
        self.tracker.heartbeat(address).await;
    }

    pub async fn all_alive(&self) -> Vec<String> {
        self.tracker.all_alive().await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn client_addresses(&self) -> Vec<String> {
        self.sessions.addresses()
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.handle_conn(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Error to establish connection");
                    }
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        drop(listener);
        info!("Closed proxy listener");
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let session = Arc::new(ProxySession::new(peer, writer));
        self.sessions.add(session.clone());
        debug!(peer = %peer, session_id = %session.id(), "accepted client connection");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buffer = vec![0u8; self.config.handle_buffer];
        let rw_timeout = self.config.rw_timeout();

        loop {
            let n = tokio::select! {
                read = timeout(rw_timeout, reader.read(&mut buffer)) => match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        warn!(peer = %peer, error = %e, "Error to read client tcp package");
                        break;
                    }
                    Err(_) => {
                        debug!(peer = %peer, "client read deadline elapsed");
                        break;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            let chunk = &buffer[..n];
            match self.codec.decode(chunk) {
                Some(message) => self.dispatch(message, &session),
                None => {
                    let end = self
                        .forward(&session, &mut reader, chunk, &mut shutdown_rx)
                        .await;
                    if end == Some(PairingEnd::Shutdown) {
                        break;
                    }
                }
            }
        }

        self.sessions.close(&session).await;
    }

    fn dispatch(self: &Arc<Self>, message: ControlMessage, session: &Arc<ProxySession>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_control_message(message.kind().as_str());
        }

        match message {
            ControlMessage::Heartbeat(address) => {
                if address.trim().is_empty() {
                    warn!(peer = %session.peer(), "ignored heartbeat without an address");
                    return;
                }
                let tracker = self.tracker.clone();
                tokio::spawn(async move {
                    tracker.heartbeat(&address).await;
                });
            }
            ControlMessage::ListAlive => {
                let engine = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    engine.reply_alive(&session).await;
                });
            }
            ControlMessage::StopListening => {
                info!(peer = %session.peer(), "received stop listening request");
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.stop().await;
                });
            }
        }
    }

    async fn reply_alive(&self, session: &ProxySession) {
        let addresses = self.tracker.all_alive().await;
        let data = match encode_address_list(&addresses) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Error to encode alive backend addresses");
                return;
            }
        };

        if let Err(e) = session.write_all(&data, self.config.rw_timeout()).await {
            warn!(peer = %session.peer(), error = %e, "Error to write alive addresses to client");
        }
    }

    /// Forward one burst of client traffic. Returns how the pairing ended,
    /// or `None` if no pairing could be set up.
    async fn forward(
        &self,
        session: &Arc<ProxySession>,
        reader: &mut OwnedReadHalf,
        first_chunk: &[u8],
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<PairingEnd> {
        let client_id = session.key();
        let candidates = self.tracker.all_alive().await;

        let Some(backend) = self.balancer.select_backend(&client_id, &candidates).await else {
            warn!(peer = %client_id, "{}", ProxyError::NoBackendAvailable);
            return None;
        };

        let stream = match self.dial(&backend).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %client_id, backend = %backend, error = %e, "dropping client payload");
                if let Some(metrics) = &self.metrics {
                    metrics.record_dial_failure(&backend);
                }
                return None;
            }
        };

        info!(peer = %client_id, backend = %backend, "Create a server connection");

        let settings = PairingSettings {
            rw_timeout: self.config.rw_timeout(),
            buffer_size: self.config.handle_buffer,
        };
        let result = run_pairing(
            session,
            reader,
            stream,
            first_chunk,
            settings,
            self.metrics.clone(),
            shutdown_rx,
        )
        .await;

        match result {
            Ok(end) => {
                debug!(
                    peer = %client_id,
                    backend = %backend,
                    outcome = end.as_str(),
                    "Close a server connection"
                );
                Some(end)
            }
            Err(e) => {
                if e.is_transient() {
                    debug!(peer = %client_id, backend = %backend, error = %e, "pairing ended");
                } else {
                    warn!(peer = %client_id, backend = %backend, error = %e, "pairing failed");
                }
                None
            }
        }
    }

    async fn dial(&self, backend: &str) -> Result<TcpStream, ProxyError> {
        match timeout(self.config.rw_timeout(), TcpStream::connect(backend)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Dial {
                backend: backend.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout("backend dial")),
        }
    }

    async fn report_status(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.config.print_interval();
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let clients = self.sessions.addresses();
                    let servers = self.tracker.all_alive().await;
                    info!(?clients, ?servers, "proxy status");
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        debug!("Stopped proxy service periodical print");
    }
}
