// src/discovery/mod.rs
mod tracker;

pub use tracker::{DiscoveryTracker, LivenessRecord};
