// src/main.rs
use anyhow::Result;
use rust_tcp_balancer::{
    config,
    metrics::MetricsRegistry,
    server::{ApiHandler, ProxyGroups, ServerBuilder},
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rust_tcp_balancer=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics = config.metrics.enabled.then(|| metrics_registry.collector());

    let groups = Arc::new(ProxyGroups::new(config.proxy.clone(), metrics));
    let proxy_addr = groups.open(config.proxy.tcp_port).await?;
    info!(
        addr = %proxy_addr,
        policy = config.proxy.lb_policy,
        framing = ?config.proxy.control_framing,
        "TCP proxy started"
    );

    if config.api.enabled {
        let mut handler = ApiHandler::new(groups.clone());
        if config.metrics.enabled {
            handler = handler.with_metrics(metrics_registry.clone(), &config.metrics.path);
        }

        let server = ServerBuilder::new(config.api.listen_addr()?)
            .with_handler(handler)
            .bind()
            .await?;
        server.serve_with_shutdown(shutdown_signal()).await?;
    } else {
        shutdown_signal().await;
    }

    groups.stop_all().await;
    info!("All proxy groups stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
