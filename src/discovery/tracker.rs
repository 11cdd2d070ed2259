// src/discovery/tracker.rs
use crate::config::ProxyConfig;
use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Last heartbeat seen from one backend. A backend is known iff it has one.
#[derive(Debug, Clone, Copy)]
pub struct LivenessRecord {
    pub last_seen: Instant,
    pub first_seen_at: DateTime<Utc>,
}

/// Authoritative set of alive backend addresses.
///
/// Mutations take the write lock; `all_alive` copies the keys out under the
/// read lock so callers never hold on to the live table.
pub struct DiscoveryTracker {
    keep_alive_ttl: Duration,
    check_interval: Duration,
    alive: RwLock<BTreeMap<String, LivenessRecord>>,
    metrics: Option<Arc<MetricsCollector>>,
    group: OnceLock<String>,
}

impl DiscoveryTracker {
    pub fn new(keep_alive_ttl: Duration, check_interval: Duration) -> Self {
        Self {
            keep_alive_ttl,
            check_interval,
            alive: RwLock::new(BTreeMap::new()),
            metrics: None,
            group: OnceLock::new(),
        }
    }

    pub fn from_config(config: &ProxyConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            metrics,
            ..Self::new(config.heartbeat_keep_alive(), config.alive_check_interval())
        }
    }

    pub fn keep_alive_ttl(&self) -> Duration {
        self.keep_alive_ttl
    }

    /// Label the alive-backend gauge with `group` and publish the current
    /// count. Only the first label sticks.
    pub async fn attach_group(&self, group: impl Into<String>) {
        let _ = self.group.set(group.into());
        let len = self.alive.read().await.len();
        self.publish(len);
    }

    /// Drop this tracker's series from the alive-backend gauge.
    pub fn detach_group(&self) {
        if let (Some(metrics), Some(group)) = (&self.metrics, self.group.get()) {
            metrics.remove_backends_alive(group);
        }
    }

    fn publish(&self, len: usize) {
        if let (Some(metrics), Some(group)) = (&self.metrics, self.group.get()) {
            metrics.update_backends_alive(group, len);
        }
    }

    /// Record a heartbeat observed at `now`.
    ///
    /// Unknown addresses are learned; known ones only move forward in time,
    /// so a stale observation racing a newer one cannot roll `last_seen` back.
    pub async fn record_heartbeat(&self, address: &str, now: Instant) {
        let mut alive = self.alive.write().await;

        match alive.get_mut(address) {
            Some(record) => {
                if now >= record.last_seen {
                    record.last_seen = now;
                    debug!(backend = %address, "refreshed backend heartbeat");
                } else {
                    debug!(backend = %address, "ignored out-of-order heartbeat");
                }
            }
            None => {
                alive.insert(
                    address.to_string(),
                    LivenessRecord {
                        last_seen: now,
                        first_seen_at: Utc::now(),
                    },
                );
                info!(backend = %address, "learned new backend");
                self.publish(alive.len());
            }
        }
    }

    /// Convenience wrapper stamping the heartbeat with the current time.
    pub async fn heartbeat(&self, address: &str) {
        self.record_heartbeat(address, Instant::now()).await;
    }

    /// Every known address, ascending by textual value.
    pub async fn all_alive(&self) -> Vec<String> {
        self.alive.read().await.keys().cloned().collect()
    }

    pub async fn record(&self, address: &str) -> Option<LivenessRecord> {
        self.alive.read().await.get(address).copied()
    }

    pub async fn len(&self) -> usize {
        self.alive.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.alive.read().await.is_empty()
    }

    /// Evict every address whose `last_seen + ttl` is before `now`.
    /// Returns the evicted addresses.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut alive = self.alive.write().await;
        let ttl = self.keep_alive_ttl;

        let expired: Vec<String> = alive
            .iter()
            .filter(|(_, record)| {
                record
                    .last_seen
                    .checked_add(ttl)
                    .map_or(false, |expiry| expiry < now)
            })
            .map(|(address, _)| address.clone())
            .collect();

        for address in &expired {
            alive.remove(address);
            info!(backend = %address, "expired dead backend");
        }

        if !expired.is_empty() {
            self.publish(alive.len());
        }

        expired
    }

    /// Run `sweep` every check interval until `shutdown_rx` flips to true.
    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting discovery sweep with interval: {:?}, keep-alive: {:?}",
            self.check_interval, self.keep_alive_ttl
        );

        if *shutdown_rx.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now()).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Discovery sweep shutting down");
                        break;
                    }
                }
            }
        }
    }
}
