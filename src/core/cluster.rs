/// Clusters and host-update reconciliation
use super::{HealthFlag, Host, HostConfig, HostList, HostSet};
use crate::balancer::{Balancer, LbConfig, LbType, LoadBalancer, LoadBalancerContext};
use crate::config::ClusterConfig;
use crate::error::UpstreamResult;
use fnv::FnvHashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Static identity and LB settings of a cluster
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    name: Arc<str>,
    lb_config: LbConfig,
}

impl ClusterInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lb_config(&self) -> &LbConfig {
        &self.lb_config
    }
}

/// Outcome of one membership update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostUpdate {
    pub added: usize,
    pub removed: usize,
    /// Hosts carried over as the same object
    pub kept: usize,
    /// Hosts whose address stayed but whose config changed
    pub changed: usize,
}

impl HostUpdate {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.changed == 0
    }
}

/// A logical service: its hosts and the balancer picking among them.
///
/// Membership writers (update, append, remove) are serialized by a
/// per-cluster lock. Each one builds the next host list, publishes it in a
/// single swap and re-syncs the balancer. Health changes never take that lock.
/// They share `health_guard` in read mode; only a full update, which copies
/// health bitmasks onto rebuilt hosts, takes it in write mode.
#[derive(Debug)]
pub struct Cluster {
    info: ClusterInfo,
    host_set: Arc<HostSet>,
    balancer: Balancer,
    update_lock: Mutex<()>,
    health_guard: RwLock<()>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, lb_config: LbConfig) -> UpstreamResult<Self> {
        Self::with_hosts(name, lb_config, Vec::new())
    }

    /// Build a cluster around already existing host objects
    pub(crate) fn with_hosts(
        name: impl Into<String>,
        lb_config: LbConfig,
        hosts: Vec<Arc<Host>>,
    ) -> UpstreamResult<Self> {
        let name: String = name.into();
        let host_set = Arc::new(HostSet::with_hosts(hosts));
        let balancer = Balancer::new(&name, &lb_config, Arc::clone(&host_set))?;
        tracing::info!(
            "Created cluster {} with {:?} load balancer and {} hosts",
            name,
            balancer.lb_type(),
            host_set.len()
        );
        Ok(Self {
            info: ClusterInfo {
                name: Arc::from(name),
                lb_config,
            },
            host_set,
            balancer,
            update_lock: Mutex::new(()),
            health_guard: RwLock::new(()),
        })
    }

    pub fn from_config(config: &ClusterConfig) -> UpstreamResult<Self> {
        let cluster = Self::new(config.name.clone(), config.lb.clone())?;
        cluster.update_hosts(config.hosts.clone());
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn lb_type(&self) -> LbType {
        self.balancer.lb_type()
    }

    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.host_set
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// Current membership snapshot
    pub fn hosts(&self) -> Arc<HostList> {
        self.host_set.hosts()
    }

    pub fn get_host(&self, address: &str) -> Option<Arc<Host>> {
        self.host_set.hosts().get(address).cloned()
    }

    pub fn choose_host(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>> {
        self.balancer.choose_host(context)
    }

    /// Replace the membership with `configs`.
    ///
    /// Addresses already present with an identical config keep their host
    /// object and with it their health state. An address whose config
    /// changed gets a new host that inherits the old health bitmask.
    /// Repeated addresses in `configs` after the first are ignored.
    pub fn update_hosts(&self, configs: Vec<HostConfig>) -> HostUpdate {
        let _guard = self.update_lock.lock();
        // no flag flip may land on a host between the copy of its bitmask
        // and the publication of its replacement
        let _health = self.health_guard.write();
        let current = self.host_set.hosts();

        let mut seen = FnvHashSet::with_capacity_and_hasher(configs.len(), Default::default());
        let mut next = Vec::with_capacity(configs.len());
        let mut update = HostUpdate::default();
        for config in configs {
            if !seen.insert(config.address.clone()) {
                tracing::debug!("Ignoring duplicate host {} in update of {}", config.address, self.name());
                continue;
            }
            match current.get(&config.address) {
                Some(existing) if existing.matches_config(&config) => {
                    update.kept += 1;
                    next.push(Arc::clone(existing));
                }
                Some(existing) => {
                    tracing::debug!("Host {} changed config, rebuilding it", existing);
                    update.changed += 1;
                    next.push(Arc::new(Host::with_health_flags(
                        Arc::clone(&self.info.name),
                        config,
                        existing.health_flags(),
                    )));
                }
                None => {
                    update.added += 1;
                    next.push(Arc::new(Host::new(Arc::clone(&self.info.name), config)));
                }
            }
        }
        update.removed = current.len() - update.kept - update.changed;

        self.install(next, update);
        update
    }

    /// Add hosts whose address is not present yet; present ones are untouched
    pub fn append_hosts(&self, configs: Vec<HostConfig>) -> HostUpdate {
        let _guard = self.update_lock.lock();
        let current = self.host_set.hosts();

        let mut fresh = FnvHashSet::default();
        let mut next = current.to_vec();
        let mut update = HostUpdate {
            kept: current.len(),
            ..Default::default()
        };
        for config in configs {
            if current.get(&config.address).is_some() || !fresh.insert(config.address.clone()) {
                tracing::debug!("Host {} already in {}, not appending", config.address, self.name());
                continue;
            }
            update.added += 1;
            next.push(Arc::new(Host::new(Arc::clone(&self.info.name), config)));
        }

        if update.is_noop() {
            return update;
        }
        self.install(next, update);
        update
    }

    /// Drop hosts by address; unknown addresses are ignored
    pub fn remove_hosts<S: AsRef<str>>(&self, addresses: &[S]) -> HostUpdate {
        let _guard = self.update_lock.lock();
        let current = self.host_set.hosts();

        let targets: FnvHashSet<&str> = addresses.iter().map(|a| a.as_ref()).collect();
        let next: Vec<_> = current
            .iter()
            .filter(|host| !targets.contains(host.address()))
            .cloned()
            .collect();
        let update = HostUpdate {
            removed: current.len() - next.len(),
            kept: next.len(),
            ..Default::default()
        };

        if update.is_noop() {
            return update;
        }
        self.install(next, update);
        update
    }

    /// Publish a new membership; caller holds the update lock
    fn install(&self, hosts: Vec<Arc<Host>>, update: HostUpdate) {
        self.host_set.set_final_hosts(hosts);
        self.balancer.sync();
        tracing::info!(
            "Cluster {} hosts updated: {} added, {} removed, {} changed, {} kept ({} healthy of {})",
            self.name(),
            update.added,
            update.removed,
            update.changed,
            update.kept,
            self.host_set.healthy_count(),
            self.host_set.len()
        );
    }

    /// Propagate a health flag change of `host` into every cached view
    pub fn refresh_health_host(&self, host: &Arc<Host>) {
        self.host_set.refresh_health_host(host);
        self.balancer.refresh_health_host(host);
    }

    /// Set a flag on the resident host with this address.
    /// Returns false if no such host exists.
    pub fn set_health_flag(&self, address: &str, flag: HealthFlag) -> bool {
        let _health = self.health_guard.read();
        let Some(host) = self.get_host(address) else {
            return false;
        };
        let was_healthy = host.is_healthy();
        host.set_health_flag(flag);
        if was_healthy {
            tracing::warn!("Host {} became unhealthy (flags {:#x})", host, host.health_flags());
        }
        self.refresh_health_host(&host);
        true
    }

    /// Clear a flag on the resident host with this address.
    /// Returns false if no such host exists.
    pub fn clear_health_flag(&self, address: &str, flag: HealthFlag) -> bool {
        let _health = self.health_guard.read();
        let Some(host) = self.get_host(address) else {
            return false;
        };
        let was_healthy = host.is_healthy();
        host.clear_health_flag(flag);
        if !was_healthy && host.is_healthy() {
            tracing::info!("Host {} became healthy", host);
        }
        self.refresh_health_host(&host);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::LastResort;
    use crate::core::test_support::*;
    use crate::core::{FallbackPolicy, MatchCriteria, Metadata, SubsetConfig};
    use proptest::prelude::*;

    fn configs(addresses: &[&str]) -> Vec<HostConfig> {
        addresses.iter().map(|a| HostConfig::new(*a)).collect()
    }

    fn random_cluster() -> Cluster {
        Cluster::new("test", LbConfig::new(LbType::Random)).unwrap()
    }

    fn subset_cluster(fallback_policy: FallbackPolicy) -> Cluster {
        let config = SubsetConfig {
            fallback_policy,
            selectors: vec![
                vec!["zone".to_string(), "version".to_string()],
                vec!["zone".to_string()],
            ],
            default_subset: Metadata::new(),
            inner_lb_type: LbType::RoundRobin,
        };
        Cluster::new("test", LbConfig::subset(config).with_last_resort(LastResort::Disabled)).unwrap()
    }

    fn criteria(pairs: &[(&str, &str)]) -> MatchCriteria {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_update_keeps_identity() {
        let cluster = random_cluster();
        let update = cluster.update_hosts(configs(&["A", "B", "C"]));
        assert_eq!(update.added, 3);

        let b = cluster.get_host("B").unwrap();
        let c = cluster.get_host("C").unwrap();
        c.set_health_flag(HealthFlag::FAILED_ACTIVE_HC);
        cluster.refresh_health_host(&c);

        let update = cluster.update_hosts(configs(&["B", "C", "D"]));
        assert_eq!(
            update,
            HostUpdate {
                added: 1,
                removed: 1,
                kept: 2,
                changed: 0
            }
        );

        assert_eq!(addresses(&cluster.hosts()), vec!["B", "C", "D"]);
        assert!(Arc::ptr_eq(&cluster.get_host("B").unwrap(), &b));
        assert!(Arc::ptr_eq(&cluster.get_host("C").unwrap(), &c));
        assert!(cluster.get_host("A").is_none());

        let d = cluster.get_host("D").unwrap();
        assert!(d.is_healthy());
        // C stays unhealthy through the update
        assert!(!cluster.get_host("C").unwrap().is_healthy());
        assert_eq!(addresses(&cluster.host_set().healthy_hosts()), vec!["B", "D"]);
    }

    #[test]
    fn test_update_with_changed_metadata_inherits_health() {
        let cluster = random_cluster();
        cluster.update_hosts(vec![host_config("A", &[("zone", "a")])]);
        let before = cluster.get_host("A").unwrap();
        cluster.set_health_flag("A", HealthFlag::FAILED_OUTLIER_CHECK);

        let update = cluster.update_hosts(vec![host_config("A", &[("zone", "b")])]);
        assert_eq!(update.changed, 1);

        let after = cluster.get_host("A").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.metadata().get("zone"), Some("b"));
        assert!(after.contains_health_flag(HealthFlag::FAILED_OUTLIER_CHECK));
        assert_eq!(cluster.host_set().healthy_count(), 0);
    }

    #[test]
    fn test_update_ignores_duplicate_entries() {
        let cluster = random_cluster();
        let update = cluster.update_hosts(configs(&["A", "B", "A"]));
        assert_eq!(update.added, 2);
        assert_eq!(cluster.hosts().len(), 2);
    }

    #[test]
    fn test_append_is_union() {
        let cluster = random_cluster();
        cluster.update_hosts(configs(&["A", "B"]));
        let a = cluster.get_host("A").unwrap();
        cluster.set_health_flag("A", HealthFlag::FAILED_ACTIVE_HC);

        let update = cluster.append_hosts(configs(&["A", "C", "C"]));
        assert_eq!(update.added, 1);
        assert_eq!(update.kept, 2);
        assert_eq!(addresses(&cluster.hosts()), vec!["A", "B", "C"]);
        assert!(Arc::ptr_eq(&cluster.get_host("A").unwrap(), &a));
        assert!(!a.is_healthy());

        // nothing new: no rebuild, same snapshot
        let snapshot = cluster.hosts();
        assert!(cluster.append_hosts(configs(&["B"])).is_noop());
        assert!(Arc::ptr_eq(&snapshot, &cluster.hosts()));
    }

    #[test]
    fn test_remove_ignores_unknown_addresses() {
        let cluster = random_cluster();
        cluster.update_hosts(configs(&["A", "B", "C"]));
        let c = cluster.get_host("C").unwrap();

        let update = cluster.remove_hosts(&["B", "X", "Y"]);
        assert_eq!(update.removed, 1);
        assert_eq!(update.kept, 2);
        assert_eq!(addresses(&cluster.hosts()), vec!["A", "C"]);
        assert!(Arc::ptr_eq(&cluster.get_host("C").unwrap(), &c));

        assert!(cluster.remove_hosts(&["X"]).is_noop());
    }

    #[test]
    fn test_subset_routing_follows_updates() {
        let cluster = subset_cluster(FallbackPolicy::NoFallback);
        cluster.update_hosts(vec![
            host_config("A", &[("zone", "x"), ("version", "1")]),
            host_config("B", &[("zone", "x"), ("version", "2")]),
            host_config("C", &[("zone", "y")]),
        ]);

        let zone_x = criteria(&[("zone", "x"), ("version", "1")]);
        assert_eq!(cluster.choose_host(Some(&zone_x)).unwrap().address(), "A");
        let zone_z = criteria(&[("zone", "z")]);
        assert!(cluster.choose_host(Some(&zone_z)).is_none());

        cluster.append_hosts(vec![host_config("D", &[("zone", "z")])]);
        assert_eq!(cluster.choose_host(Some(&zone_z)).unwrap().address(), "D");

        cluster.remove_hosts(&["A"]);
        assert!(cluster.choose_host(Some(&zone_x)).is_none());
    }

    #[test]
    fn test_replaced_hosts_are_never_routed() {
        let config = SubsetConfig {
            selectors: vec![vec!["zone".to_string()]],
            ..Default::default()
        };
        let cluster = Cluster::new("test", LbConfig::subset(config)).unwrap();
        cluster.update_hosts(vec![host_config("A", &[("zone", "x")])]);
        let zone_x = criteria(&[("zone", "x")]);
        assert_eq!(cluster.choose_host(Some(&zone_x)).unwrap().address(), "A");

        cluster.update_hosts(vec![host_config("B", &[("zone", "y")])]);
        assert_eq!(addresses(&cluster.hosts()), vec!["B"]);
        assert!(cluster.choose_host(Some(&zone_x)).is_none());
        let zone_y = criteria(&[("zone", "y")]);
        assert_eq!(cluster.choose_host(Some(&zone_y)).unwrap().address(), "B");
    }

    #[test]
    fn test_flag_flips_survive_concurrent_config_changes() {
        let cluster = random_cluster();
        let light = vec![HostConfig::new("A").with_weight(1), HostConfig::new("B")];
        let heavy = vec![HostConfig::new("A").with_weight(2), HostConfig::new("B")];
        cluster.update_hosts(light.clone());

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200 {
                    // every update rebuilds A with a new weight
                    let update = cluster.update_hosts(if i % 2 == 0 { heavy.clone() } else { light.clone() });
                    assert_eq!(update.changed, 1);
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    cluster.set_health_flag("A", HealthFlag::FAILED_OUTLIER_CHECK);
                    cluster.clear_health_flag("A", HealthFlag::FAILED_OUTLIER_CHECK);
                }
                cluster.set_health_flag("A", HealthFlag::FAILED_OUTLIER_CHECK);
            });
        });

        let a = cluster.get_host("A").unwrap();
        assert!(a.contains_health_flag(HealthFlag::FAILED_OUTLIER_CHECK));
        assert_eq!(addresses(&cluster.host_set().healthy_hosts()), vec!["B"]);
    }

    #[test]
    fn test_health_flags_reach_subsets() {
        let cluster = subset_cluster(FallbackPolicy::AnyEndpoint);
        cluster.update_hosts(vec![
            host_config("A", &[("zone", "x")]),
            host_config("B", &[("zone", "x")]),
        ]);
        let zone_x = criteria(&[("zone", "x")]);

        assert!(cluster.set_health_flag("A", HealthFlag::FAILED_ACTIVE_HC));
        for _ in 0..10 {
            assert_eq!(cluster.choose_host(Some(&zone_x)).unwrap().address(), "B");
        }

        assert!(cluster.set_health_flag("B", HealthFlag::FAILED_ACTIVE_HC));
        assert!(cluster.choose_host(Some(&zone_x)).is_none());
        assert!(cluster.choose_host(None).is_none());

        assert!(cluster.clear_health_flag("A", HealthFlag::FAILED_ACTIVE_HC));
        assert_eq!(cluster.choose_host(Some(&zone_x)).unwrap().address(), "A");
        assert_eq!(cluster.choose_host(None).unwrap().address(), "A");

        assert!(!cluster.set_health_flag("missing", HealthFlag::FAILED_ACTIVE_HC));
    }

    #[test]
    fn test_readers_see_whole_snapshots() {
        let cluster = random_cluster();
        let first = configs(&["A1", "A2", "A3"]);
        let second = configs(&["B1", "B2", "B3", "B4"]);
        cluster.update_hosts(first.clone());

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200 {
                    if i % 2 == 0 {
                        cluster.update_hosts(second.clone());
                    } else {
                        cluster.update_hosts(first.clone());
                    }
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let hosts = cluster.hosts();
                        let prefixes: FnvHashSet<char> =
                            hosts.iter().map(|h| h.address().chars().next().unwrap()).collect();
                        assert_eq!(prefixes.len(), 1);
                        assert!(hosts.len() == 3 || hosts.len() == 4);
                        assert!(cluster.choose_host(None).is_some());
                    }
                });
            }
        });
    }

    proptest! {
        #[test]
        fn prop_update_retains_identity(
            first in prop::collection::btree_set(0u8..32, 0..16),
            second in prop::collection::btree_set(0u8..32, 0..16),
            unhealthy in prop::collection::btree_set(0u8..32, 0..8),
        ) {
            let to_configs = |ids: &std::collections::BTreeSet<u8>| -> Vec<HostConfig> {
                ids.iter().map(|id| HostConfig::new(format!("10.0.0.{}:80", id))).collect()
            };
            let cluster = random_cluster();
            cluster.update_hosts(to_configs(&first));
            for id in &unhealthy {
                cluster.set_health_flag(&format!("10.0.0.{}:80", id), HealthFlag::FAILED_ACTIVE_HC);
            }
            let before = cluster.hosts();

            cluster.update_hosts(to_configs(&second));
            let after = cluster.hosts();

            for id in 0u8..32 {
                let address = format!("10.0.0.{}:80", id);
                match (before.get(&address), after.get(&address)) {
                    (Some(old), Some(new)) => {
                        prop_assert!(Arc::ptr_eq(old, new));
                        prop_assert_eq!(new.is_healthy(), !unhealthy.contains(&id));
                    }
                    (None, Some(new)) => prop_assert!(new.is_healthy()),
                    (Some(_), None) => prop_assert!(!second.contains(&id)),
                    (None, None) => prop_assert!(!second.contains(&id)),
                }
            }
            prop_assert_eq!(after.len(), second.len());
            let healthy = cluster.host_set().healthy_count();
            prop_assert_eq!(healthy, after.iter().filter(|h| h.is_healthy()).count());
        }
    }
}
