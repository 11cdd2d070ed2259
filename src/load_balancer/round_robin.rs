// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Hands out candidates in list order, one per call.
///
/// The cursor is never reset when the list changes size; it is clamped back
/// to zero on the next call that finds it out of range.
pub struct RoundRobinBalancer {
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select_backend(&self, _client_id: &str, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock().await;
        if *cursor >= candidates.len() {
            *cursor = 0;
        }
        let selected = candidates[*cursor].clone();
        *cursor += 1;

        Some(selected)
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
