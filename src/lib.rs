// src/lib.rs
pub mod config;
pub mod discovery;
pub mod load_balancer;
pub mod metrics;
pub mod proxy;
pub mod server;
