// src/load_balancer/fixed_primary.rs
use crate::load_balancer::LoadBalancer;
use async_trait::async_trait;

/// Hot standby: all traffic goes to the first alive backend until it drops
/// out of the list, then to whichever entry is first next.
#[derive(Debug, Default)]
pub struct FixedPrimaryBalancer;

impl FixedPrimaryBalancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for FixedPrimaryBalancer {
    async fn select_backend(&self, _client_id: &str, candidates: &[String]) -> Option<String> {
        candidates.first().cloned()
    }

    fn name(&self) -> &'static str {
        "ha"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_first_then_fails_over() {
        let ha = FixedPrimaryBalancer::new();
        let candidates = vec!["127.0.0.1:11110".to_string(), "127.0.0.1:11111".to_string()];

        for _ in 0..10 {
            let selected = ha.select_backend("10.0.0.1:5000", &candidates).await;
            assert_eq!(selected.as_deref(), Some("127.0.0.1:11110"));
        }

        let remaining = vec![candidates[1].clone()];
        let selected = ha.select_backend("10.0.0.1:5000", &remaining).await;
        assert_eq!(selected.as_deref(), Some("127.0.0.1:11111"));
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        assert!(FixedPrimaryBalancer::new().select_backend("x", &[]).await.is_none());
    }
}
