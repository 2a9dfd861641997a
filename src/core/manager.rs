/// Cluster registry
use super::{Cluster, HostConfig, HostUpdate};
use crate::balancer::LoadBalancerContext;
use crate::config::{ClusterConfig, Config};
use crate::core::Host;
use crate::error::{UpstreamError, UpstreamResult};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Registry mapping cluster name to cluster.
///
/// An explicit object: build one and hand it to whatever needs cluster
/// lookup. Lookups hand out `Arc<Cluster>` snapshots, so a cluster replaced
/// or removed while a caller holds it stays valid for that caller.
#[derive(Debug, Default)]
pub struct ClusterManager {
    clusters: RwLock<FnvHashMap<String, Arc<Cluster>>>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding every cluster of the config file
    pub fn from_config(config: &Config) -> UpstreamResult<Self> {
        let manager = Self::new();
        for cluster in &config.clusters {
            manager.add_or_update_cluster(cluster)?;
        }
        Ok(manager)
    }

    /// Register a cluster, or reconfigure an existing one.
    ///
    /// On reconfiguration the new cluster takes over the existing host
    /// objects, so health state survives; then the config's host list, when
    /// non-empty, is applied as a full update.
    pub fn add_or_update_cluster(&self, config: &ClusterConfig) -> UpstreamResult<Arc<Cluster>> {
        let mut clusters = self.clusters.write();

        let cluster = match clusters.get(&config.name) {
            Some(existing) => {
                let hosts = existing.hosts().to_vec();
                let cluster = Cluster::with_hosts(config.name.clone(), config.lb.clone(), hosts)?;
                if !config.hosts.is_empty() {
                    cluster.update_hosts(config.hosts.clone());
                }
                tracing::info!("Reconfigured cluster {}", config.name);
                cluster
            }
            None => Cluster::from_config(config)?,
        };

        let cluster = Arc::new(cluster);
        clusters.insert(config.name.clone(), Arc::clone(&cluster));
        Ok(cluster)
    }

    pub fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    fn cluster(&self, name: &str) -> UpstreamResult<Arc<Cluster>> {
        self.get_cluster(name)
            .ok_or_else(|| UpstreamError::cluster_not_found(name))
    }

    pub fn remove_cluster(&self, name: &str) -> bool {
        let removed = self.clusters.write().remove(name).is_some();
        if removed {
            tracing::info!("Removed cluster {}", name);
        }
        removed
    }

    pub fn update_cluster_hosts(&self, name: &str, hosts: Vec<HostConfig>) -> UpstreamResult<HostUpdate> {
        Ok(self.cluster(name)?.update_hosts(hosts))
    }

    pub fn append_cluster_hosts(&self, name: &str, hosts: Vec<HostConfig>) -> UpstreamResult<HostUpdate> {
        Ok(self.cluster(name)?.append_hosts(hosts))
    }

    pub fn remove_cluster_hosts<S: AsRef<str>>(&self, name: &str, addresses: &[S]) -> UpstreamResult<HostUpdate> {
        Ok(self.cluster(name)?.remove_hosts(addresses))
    }

    /// Pick a host of the named cluster; `Ok(None)` means no destination
    pub fn choose_host(
        &self,
        name: &str,
        context: Option<&dyn LoadBalancerContext>,
    ) -> UpstreamResult<Option<Arc<Host>>> {
        Ok(self.cluster(name)?.choose_host(context))
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }

    /// Release every cluster
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.clusters.write());
        tracing::info!("Cleared {} clusters", drained.len());
    }
}
