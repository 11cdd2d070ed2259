// src/metrics/collector.rs
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Which side of a pairing moved the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "client_to_backend",
            Direction::Downstream => "backend_to_client",
        }
    }
}

pub struct MetricsCollector {
    // Session metrics
    pub sessions_active: IntGauge,
    pub sessions_total: IntCounter,
    pub control_messages_total: IntCounterVec,

    // Forwarding metrics
    pub pairings_total: IntCounterVec,
    pub bytes_forwarded_total: IntCounterVec,
    pub backend_dial_failures_total: IntCounterVec,

    // Discovery metrics, one series per proxy group port
    pub backends_alive: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let sessions_active =
            IntGauge::new("tcplb_sessions_active", "Client sessions currently open")?;
        registry.register(Box::new(sessions_active.clone()))?;

        let sessions_total =
            IntCounter::new("tcplb_sessions_total", "Client sessions accepted")?;
        registry.register(Box::new(sessions_total.clone()))?;

        let control_messages_total = IntCounterVec::new(
            Opts::new("tcplb_control_messages_total", "Control envelopes received"),
            &["kind"],
        )?;
        registry.register(Box::new(control_messages_total.clone()))?;

        let pairings_total = IntCounterVec::new(
            Opts::new(
                "tcplb_pairings_total",
                "Forwarding pairings by how they ended",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(pairings_total.clone()))?;

        let bytes_forwarded_total = IntCounterVec::new(
            Opts::new("tcplb_bytes_forwarded_total", "Bytes copied through pairings"),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_forwarded_total.clone()))?;

        let backend_dial_failures_total = IntCounterVec::new(
            Opts::new(
                "tcplb_backend_dial_failures_total",
                "Failed connection attempts to a backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_dial_failures_total.clone()))?;

        let backends_alive = IntGaugeVec::new(
            Opts::new("tcplb_backends_alive", "Backends with a live heartbeat"),
            &["group"],
        )?;
        registry.register(Box::new(backends_alive.clone()))?;

        Ok(Self {
            sessions_active,
            sessions_total,
            control_messages_total,
            pairings_total,
            bytes_forwarded_total,
            backend_dial_failures_total,
            backends_alive,
        })
    }

    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn record_control_message(&self, kind: &str) {
        self.control_messages_total.with_label_values(&[kind]).inc();
    }

    pub fn record_pairing(&self, outcome: &str) {
        self.pairings_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_bytes(&self, direction: Direction, bytes: usize) {
        self.bytes_forwarded_total
            .with_label_values(&[direction.as_str()])
            .inc_by(bytes as u64);
    }

    pub fn record_dial_failure(&self, backend: &str) {
        self.backend_dial_failures_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn update_backends_alive(&self, group: &str, count: usize) {
        self.backends_alive
            .with_label_values(&[group])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn remove_backends_alive(&self, group: &str) {
        let _ = self.backends_alive.remove_label_values(&[group]);
    }
}
