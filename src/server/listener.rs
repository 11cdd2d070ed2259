// ────────────────────────────────
// src/server/listener.rs
// Low-level TCP bind shared by the proxy port and the management API.
// ────────────────────────────────
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub async fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "bound tcp listener");
    Ok(listener)
}
