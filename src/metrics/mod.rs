// src/metrics/mod.rs
mod collector;

pub use collector::{Direction, MetricsCollector, MetricsRegistry};
