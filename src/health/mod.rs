/// Turning health check outcomes into host health flags
///
/// Probing itself belongs to an external checker. This module only counts
/// consecutive outcomes per host and sets or clears `FAILED_ACTIVE_HC` on the
/// cluster once a threshold is crossed.
use crate::config::HealthConfig;
use crate::core::{Cluster, HealthFlag};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::fmt;

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy host
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Flag change caused by a recorded outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveCheckTransition {
    FlagSet,
    FlagCleared,
}

#[derive(Debug, Default)]
struct Streak {
    failures: u32,
    successes: u32,
}

/// Smallest per-cluster streak count that triggers pruning
const MIN_PRUNE_AT: usize = 64;

/// Streaks of one cluster, keyed by address
#[derive(Debug)]
struct ClusterStreaks {
    by_address: FnvHashMap<String, Streak>,
    /// Size at which entries of departed hosts are dropped
    prune_at: usize,
}

impl Default for ClusterStreaks {
    fn default() -> Self {
        Self {
            by_address: FnvHashMap::default(),
            prune_at: MIN_PRUNE_AT,
        }
    }
}

impl ClusterStreaks {
    /// Drop streaks of hosts no longer in `cluster`; the threshold doubles
    /// past what survives so pruning stays amortized O(1) per record
    fn prune(&mut self, cluster: &Cluster) {
        let hosts = cluster.hosts();
        let before = self.by_address.len();
        self.by_address.retain(|address, _| hosts.get(address).is_some());
        self.prune_at = MIN_PRUNE_AT.max(self.by_address.len() * 2);
        tracing::debug!(
            "Pruned {} health streaks of departed hosts in {}",
            before - self.by_address.len(),
            cluster.name()
        );
    }
}

/// Consecutive-outcome counter driving `FAILED_ACTIVE_HC`.
///
/// Streaks of hosts that left their cluster are dropped when the address is
/// checked again, or in bulk once a cluster's streak map outgrows twice its
/// last pruned size.
#[derive(Debug)]
pub struct HealthFlagUpdater {
    failure_threshold: u32,
    success_threshold: u32,
    streaks: Mutex<FnvHashMap<String, ClusterStreaks>>,
}

impl HealthFlagUpdater {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            streaks: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Record one check outcome for a host of `cluster`.
    ///
    /// `Unknown` outcomes are ignored. Outcomes for addresses the cluster
    /// does not hold drop any streak kept for them.
    pub fn record(
        &self,
        cluster: &Cluster,
        address: &str,
        status: &HealthStatus,
    ) -> Option<ActiveCheckTransition> {
        let Some(host) = cluster.get_host(address) else {
            if let Some(streaks) = self.streaks.lock().get_mut(cluster.name()) {
                streaks.by_address.remove(address);
            }
            return None;
        };

        let flagged = host.contains_health_flag(HealthFlag::FAILED_ACTIVE_HC);
        let transition = {
            let mut all = self.streaks.lock();
            let streaks = all.entry(cluster.name().to_string()).or_default();
            if streaks.by_address.len() >= streaks.prune_at {
                streaks.prune(cluster);
            }
            let streak = streaks.by_address.entry(address.to_string()).or_default();
            match status {
                HealthStatus::Unknown => {
                    tracing::debug!("Unknown health status for host {}", host);
                    None
                }
                HealthStatus::Healthy => {
                    streak.failures = 0;
                    streak.successes = streak.successes.saturating_add(1);
                    (flagged && streak.successes >= self.success_threshold)
                        .then_some(ActiveCheckTransition::FlagCleared)
                }
                HealthStatus::Unhealthy { .. } | HealthStatus::Timeout => {
                    streak.successes = 0;
                    streak.failures = streak.failures.saturating_add(1);
                    (!flagged && streak.failures >= self.failure_threshold)
                        .then_some(ActiveCheckTransition::FlagSet)
                }
            }
        };

        match transition {
            Some(ActiveCheckTransition::FlagSet) => {
                tracing::warn!("Host {} failed active health check: {}", host, status);
                cluster.set_health_flag(address, HealthFlag::FAILED_ACTIVE_HC);
            }
            Some(ActiveCheckTransition::FlagCleared) => {
                tracing::info!("Host {} passed active health check", host);
                cluster.clear_health_flag(address, HealthFlag::FAILED_ACTIVE_HC);
            }
            None => {}
        }
        transition
    }

    /// Drop every streak kept for a cluster
    pub fn forget_cluster(&self, cluster_name: &str) {
        self.streaks.lock().remove(cluster_name);
    }

    pub fn tracked_hosts(&self) -> usize {
        self.streaks.lock().values().map(|s| s.by_address.len()).sum()
    }
}
