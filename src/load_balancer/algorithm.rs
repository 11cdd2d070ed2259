// src/load_balancer/algorithm.rs
use async_trait::async_trait;
use std::fmt;

/// Picks one backend address for a client out of the current alive list.
///
/// `candidates` is always the sorted snapshot handed out by the discovery
/// tracker. `None` only means the list was empty.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn select_backend(&self, client_id: &str, candidates: &[String]) -> Option<String>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("Could not find load balance policy for id {0}")]
    PolicyNotFound(u8),
}

/// Policies selectable through the numeric `lb_policy` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadBalancerPolicy {
    FixedPrimary,
    RoundRobin,
    IpHash,
}

impl LoadBalancerPolicy {
    pub const ALL: [LoadBalancerPolicy; 3] = [
        LoadBalancerPolicy::FixedPrimary,
        LoadBalancerPolicy::RoundRobin,
        LoadBalancerPolicy::IpHash,
    ];

    pub fn from_id(id: u8) -> Result<Self, LoadBalancerError> {
        match id {
            1 => Ok(LoadBalancerPolicy::FixedPrimary),
            2 => Ok(LoadBalancerPolicy::RoundRobin),
            3 => Ok(LoadBalancerPolicy::IpHash),
            other => Err(LoadBalancerError::PolicyNotFound(other)),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            LoadBalancerPolicy::FixedPrimary => 1,
            LoadBalancerPolicy::RoundRobin => 2,
            LoadBalancerPolicy::IpHash => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadBalancerPolicy::FixedPrimary => "ha",
            LoadBalancerPolicy::RoundRobin => "round-robin",
            LoadBalancerPolicy::IpHash => "ip_hash",
        }
    }
}

impl TryFrom<u8> for LoadBalancerPolicy {
    type Error = LoadBalancerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        LoadBalancerPolicy::from_id(id)
    }
}

impl fmt::Display for LoadBalancerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
