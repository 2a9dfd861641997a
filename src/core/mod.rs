/// Core abstractions: hosts, host sets, subsets, clusters and the registry
pub mod cluster;
pub mod host_set;
pub mod manager;
pub mod subset;

use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use cluster::{Cluster, ClusterInfo, HostUpdate};
pub use host_set::{HealthyHosts, HostList, HostSet};
pub use manager::ClusterManager;
pub use subset::{FallbackPolicy, MatchCriteria, SubsetConfig, SubsetIndex, SubsetInfo};

pub const MIN_HOST_WEIGHT: u32 = 1;
pub const MAX_HOST_WEIGHT: u32 = 128;

/// Immutable key/value tags attached to a host, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

/// One independent reason for a host to be considered unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HealthFlag(u64);

impl HealthFlag {
    /// Set by the active health checker
    pub const FAILED_ACTIVE_HC: HealthFlag = HealthFlag(0x1);
    /// Set by outlier detection
    pub const FAILED_OUTLIER_CHECK: HealthFlag = HealthFlag(0x2);

    pub const fn from_bits(bits: u64) -> Self {
        HealthFlag(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// Host definition as produced by discovery or the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

fn default_weight() -> u32 {
    MIN_HOST_WEIGHT
}

impl HostConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: None,
            weight: MIN_HOST_WEIGHT,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// A single upstream endpoint.
///
/// The address, weight and metadata never change after construction. The
/// health bitmask is an atomic so health producers can flip flags while the
/// selection path reads them without locking. A host is healthy iff no flag
/// is set.
#[derive(Debug)]
pub struct Host {
    address: String,
    hostname: Option<String>,
    weight: u32,
    metadata: Metadata,
    cluster_name: Arc<str>,
    health_flags: AtomicU64,
}

impl Host {
    pub fn new(cluster_name: Arc<str>, config: HostConfig) -> Self {
        Self::with_health_flags(cluster_name, config, 0)
    }

    pub(crate) fn with_health_flags(cluster_name: Arc<str>, config: HostConfig, flags: u64) -> Self {
        Self {
            address: config.address,
            hostname: config.hostname,
            weight: config.weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT),
            metadata: config.metadata,
            cluster_name,
            health_flags: AtomicU64::new(flags),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Name of the cluster this host belongs to
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Export the config this host was built from
    pub fn config(&self) -> HostConfig {
        HostConfig {
            address: self.address.clone(),
            hostname: self.hostname.clone(),
            weight: self.weight,
            metadata: self.metadata.clone(),
        }
    }

    /// Whether a new config describes this very host (ignoring health state)
    pub(crate) fn matches_config(&self, config: &HostConfig) -> bool {
        self.address == config.address
            && self.hostname == config.hostname
            && self.weight == config.weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT)
            && self.metadata == config.metadata
    }

    pub fn health_flags(&self) -> u64 {
        self.health_flags.load(Ordering::Acquire)
    }

    pub fn contains_health_flag(&self, flag: HealthFlag) -> bool {
        self.health_flags() & flag.bits() != 0
    }

    pub fn set_health_flag(&self, flag: HealthFlag) {
        self.health_flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_health_flag(&self, flag: HealthFlag) {
        self.health_flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn is_healthy(&self) -> bool {
        self.health_flags() == 0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_name, self.address)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn host_config(address: &str, pairs: &[(&str, &str)]) -> HostConfig {
        HostConfig::new(address).with_metadata(meta(pairs))
    }

    pub fn make_host(address: &str, pairs: &[(&str, &str)]) -> Arc<Host> {
        Arc::new(Host::new(Arc::from("test"), host_config(address, pairs)))
    }

    pub fn make_hosts(count: usize, pairs: &[(&str, &str)], offset: usize) -> Vec<Arc<Host>> {
        (0..count)
            .map(|i| make_host(&format!("127.0.0.1:{}", 10000 + offset + i), pairs))
            .collect()
    }

    pub fn addresses(hosts: &[Arc<Host>]) -> Vec<String> {
        let mut addrs: Vec<String> = hosts.iter().map(|h| h.address().to_string()).collect();
        addrs.sort();
        addrs
    }
}
