/// mesh-upstream - cluster membership and load balancing for a service-mesh data plane
///
/// The crate keeps, per upstream cluster, the set of hosts with their health
/// state, an index of metadata subsets over those hosts, and a load balancer
/// that picks a host per request:
/// 1. Membership: full, additive and subtractive host updates that keep host
///    identity (and so health state) for unchanged hosts
/// 2. Health: per-host flag bitmask with an incrementally maintained healthy cache
/// 3. Selection: random, round robin, weighted round robin, and subset-aware
///    balancing with configurable fallback
pub mod balancer;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod utils;

use std::sync::Arc;

pub use crate::balancer::{LastResort, LbConfig, LbType, LoadBalancer, LoadBalancerContext};
pub use crate::config::{ClusterConfig, Config};
pub use crate::core::{
    Cluster, ClusterManager, FallbackPolicy, HealthFlag, Host, HostConfig, HostSet, HostUpdate,
    MatchCriteria, Metadata, SubsetConfig,
};
pub use crate::error::{LbConfigError, UpstreamError, UpstreamResult};
pub use crate::health::{ActiveCheckTransition, HealthFlagUpdater, HealthStatus};

/// Registry plus the health flag updater feeding it
#[derive(Debug)]
pub struct Upstream {
    clusters: ClusterManager,
    health: HealthFlagUpdater,
}

impl Upstream {
    /// Build every configured cluster; fails on the first invalid cluster
    pub fn from_config(config: &Config) -> UpstreamResult<Self> {
        config.validate()?;
        let clusters = ClusterManager::from_config(config)?;
        tracing::info!("Loaded {} clusters", clusters.len());
        Ok(Self {
            clusters,
            health: HealthFlagUpdater::new(&config.health),
        })
    }

    pub fn clusters(&self) -> &ClusterManager {
        &self.clusters
    }

    /// Feed one health check outcome for a host into its cluster
    pub fn record_health(
        &self,
        cluster: &str,
        address: &str,
        status: &HealthStatus,
    ) -> UpstreamResult<Option<ActiveCheckTransition>> {
        let cluster = self
            .clusters
            .get_cluster(cluster)
            .ok_or_else(|| UpstreamError::cluster_not_found(cluster))?;
        Ok(self.health.record(&cluster, address, status))
    }

    /// Drop a cluster together with its health streaks
    pub fn remove_cluster(&self, name: &str) -> bool {
        self.health.forget_cluster(name);
        self.clusters.remove_cluster(name)
    }

    pub fn choose_host(
        &self,
        cluster: &str,
        context: Option<&dyn LoadBalancerContext>,
    ) -> UpstreamResult<Option<Arc<Host>>> {
        self.clusters.choose_host(cluster, context)
    }
}
