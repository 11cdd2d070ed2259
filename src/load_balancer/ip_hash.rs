// src/load_balancer/ip_hash.rs
use crate::load_balancer::LoadBalancer;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Maps a client identity onto `hash(identity) % candidates.len()`.
///
/// The mapping is only stable while the alive set keeps the same members:
/// any backend joining or leaving can move every client.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }

    fn hash(client_id: &str) -> u32 {
        let digest = Sha256::digest(client_id.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

#[async_trait]
impl LoadBalancer for IpHashBalancer {
    async fn select_backend(&self, client_id: &str, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let index = Self::hash(client_id) as usize % candidates.len();
        Some(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}
