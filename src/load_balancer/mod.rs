// src/load_balancer/mod.rs
mod algorithm;
mod fixed_primary;
mod ip_hash;
mod round_robin;

pub use algorithm::{LoadBalancer, LoadBalancerError, LoadBalancerPolicy};
pub use fixed_primary::FixedPrimaryBalancer;
pub use ip_hash::IpHashBalancer;
pub use round_robin::RoundRobinBalancer;

use std::sync::Arc;

/// Build the balancer registered for `policy`.
pub fn create_load_balancer(policy: LoadBalancerPolicy) -> Arc<dyn LoadBalancer> {
    match policy {
        LoadBalancerPolicy::FixedPrimary => Arc::new(FixedPrimaryBalancer::new()),
        LoadBalancerPolicy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancerPolicy::IpHash => Arc::new(IpHashBalancer::new()),
    }
}

/// Resolve a configured policy id. Unknown ids are an error, never a fallback.
pub fn load_balancer_for_id(id: u8) -> Result<Arc<dyn LoadBalancer>, LoadBalancerError> {
    let policy = LoadBalancerPolicy::from_id(id)?;
    tracing::debug!(policy = %policy, "resolved load balance policy");
    Ok(create_load_balancer(policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_resolves_every_policy() {
        let candidates = vec!["127.0.0.1:11110".to_string(), "127.0.0.1:11111".to_string()];

        for policy in LoadBalancerPolicy::ALL {
            let balancer = load_balancer_for_id(policy.id()).unwrap();
            assert_eq!(balancer.name(), policy.as_str());
            assert!(balancer.select_backend("", &candidates).await.is_some());
        }
    }

    #[test]
    fn test_unknown_policy_id() {
        assert_eq!(
            load_balancer_for_id(0).err(),
            Some(LoadBalancerError::PolicyNotFound(0))
        );
        assert!(load_balancer_for_id(4).is_err());
    }
}
