/// Host sets: published membership snapshots plus an incrementally
/// maintained healthy cache
use super::Host;
use arc_swap::ArcSwap;
use fnv::FnvHashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use std::ops::Deref;
use std::sync::Arc;

/// Immutable membership snapshot, in update order, indexed by address
#[derive(Debug, Default)]
pub struct HostList {
    hosts: Vec<Arc<Host>>,
    index: FnvHashMap<String, usize>,
}

impl HostList {
    /// Later entries repeating an address are dropped
    fn new(hosts: Vec<Arc<Host>>) -> Self {
        let mut index = FnvHashMap::with_capacity_and_hasher(hosts.len(), Default::default());
        let mut unique = Vec::with_capacity(hosts.len());
        for host in hosts {
            if index.contains_key(host.address()) {
                tracing::debug!("Ignoring duplicate host {}", host);
                continue;
            }
            index.insert(host.address().to_string(), unique.len());
            unique.push(host);
        }
        Self {
            hosts: unique,
            index,
        }
    }

    pub fn as_slice(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn get(&self, address: &str) -> Option<&Arc<Host>> {
        self.index.get(address).map(|&i| &self.hosts[i])
    }

    /// Identity check: same address and same host object
    pub fn contains(&self, host: &Arc<Host>) -> bool {
        self.get(host.address())
            .map_or(false, |resident| Arc::ptr_eq(resident, host))
    }
}

impl Deref for HostList {
    type Target = [Arc<Host>];

    fn deref(&self) -> &Self::Target {
        &self.hosts
    }
}

/// Cached healthy subsequence of a host set.
///
/// Removal swaps the last entry into the vacated slot so single-host updates
/// stay O(1). The order matches membership order right after a full rebuild
/// and may be permuted by later incremental refreshes.
#[derive(Debug, Default)]
pub struct HealthyHosts {
    hosts: Vec<Arc<Host>>,
    slots: FnvHashMap<String, usize>,
    total_weight: u64,
}

impl HealthyHosts {
    fn rebuild(list: &HostList) -> Self {
        let mut healthy = HealthyHosts::default();
        for host in list.iter().filter(|h| h.is_healthy()) {
            healthy.insert(host);
        }
        healthy
    }

    fn insert(&mut self, host: &Arc<Host>) -> bool {
        if self.slots.contains_key(host.address()) {
            return false;
        }
        self.slots.insert(host.address().to_string(), self.hosts.len());
        self.total_weight += u64::from(host.weight());
        self.hosts.push(Arc::clone(host));
        true
    }

    fn remove(&mut self, address: &str) -> bool {
        let Some(slot) = self.slots.remove(address) else {
            return false;
        };
        let removed = self.hosts.swap_remove(slot);
        self.total_weight -= u64::from(removed.weight());
        if let Some(moved) = self.hosts.get(slot) {
            self.slots.insert(moved.address().to_string(), slot);
        }
        true
    }

    pub fn as_slice(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Sum of the weights of all cached healthy hosts
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn contains(&self, address: &str) -> bool {
        self.slots.contains_key(address)
    }
}

/// Ordered host collection for a cluster or a subset of one.
///
/// Membership is an `Arc<HostList>` swapped atomically on structural change,
/// so readers never see a half-built list. The healthy cache sits behind its
/// own lock which is held for the whole of a rebuild and for each
/// incremental refresh. A refresh therefore always applies the current
/// bitmask to the current membership, whatever order it races a rebuild in.
#[derive(Debug, Default)]
pub struct HostSet {
    hosts: ArcSwap<HostList>,
    healthy: RwLock<HealthyHosts>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts(hosts: Vec<Arc<Host>>) -> Self {
        let host_set = Self::new();
        host_set.set_final_hosts(hosts);
        host_set
    }

    /// Replace the whole membership and rebuild the healthy cache in one scan.
    ///
    /// Crate-internal: a cluster's host set is only replaced through the
    /// cluster, which re-syncs the subset index built over it in the same
    /// critical section.
    pub(crate) fn set_final_hosts(&self, hosts: Vec<Arc<Host>>) {
        let list = HostList::new(hosts);
        let mut healthy = self.healthy.write();
        *healthy = HealthyHosts::rebuild(&list);
        self.hosts.store(Arc::new(list));
    }

    /// React to a health flag change on one host.
    ///
    /// Idempotent; returns whether the healthy cache changed. Hosts that are
    /// not members of this set (by identity) are ignored.
    pub fn refresh_health_host(&self, host: &Arc<Host>) -> bool {
        let mut healthy = self.healthy.write();
        if !self.hosts.load().contains(host) {
            return false;
        }
        if host.is_healthy() {
            healthy.insert(host)
        } else {
            healthy.remove(host.address())
        }
    }

    /// Current membership snapshot
    pub fn hosts(&self) -> Arc<HostList> {
        self.hosts.load_full()
    }

    /// Read access to the healthy cache; keep the guard short-lived
    pub fn healthy(&self) -> RwLockReadGuard<'_, HealthyHosts> {
        self.healthy.read()
    }

    /// Copy of the healthy cache
    pub fn healthy_hosts(&self) -> Vec<Arc<Host>> {
        self.healthy.read().as_slice().to_vec()
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.read().len()
    }

    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }
}
