/// Load balancing strategies over host sets
///
/// Strategies are a closed set picked once from the cluster's config:
/// - Random and (weighted) round robin pick from one host set's healthy cache
/// - Subset resolves request metadata to a subset first, then delegates to an
///   inner strategy owned by that subset
///
/// Selection never fails: "no destination" is `None`.
pub mod random;
pub mod round_robin;
pub mod subset;

use crate::core::{Host, HostSet, MatchCriteria, SubsetConfig, SubsetInfo};
use crate::error::{LbConfigError, UpstreamError, UpstreamResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use random::Random;
pub use round_robin::{RoundRobin, WeightedRoundRobin};
pub use subset::{SubsetLoadBalancer, SubsetNode};

/// Strategy selector from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    #[default]
    Random,
    RoundRobin,
    WeightedRoundRobin,
    Subset,
}

/// Behaviour when a host set has hosts but none of them is healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastResort {
    /// Pick among all hosts, ignoring health
    #[default]
    AnyHost,
    /// Pick nothing
    Disabled,
}

/// Load balancer section of a cluster config
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LbConfig {
    #[serde(default)]
    pub lb_type: LbType,
    #[serde(default)]
    pub last_resort: LastResort,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<SubsetConfig>,
}

impl LbConfig {
    pub fn new(lb_type: LbType) -> Self {
        Self {
            lb_type,
            ..Default::default()
        }
    }

    pub fn subset(config: SubsetConfig) -> Self {
        Self {
            lb_type: LbType::Subset,
            last_resort: LastResort::default(),
            subset: Some(config),
        }
    }

    pub fn with_last_resort(mut self, last_resort: LastResort) -> Self {
        self.last_resort = last_resort;
        self
    }

    /// Check the config shape; yields the normalized subset settings for the
    /// subset strategy
    pub fn validate(&self) -> Result<Option<SubsetInfo>, LbConfigError> {
        match (self.lb_type, &self.subset) {
            (LbType::Subset, Some(subset)) => SubsetInfo::new(subset).map(Some),
            (LbType::Subset, None) => Err(LbConfigError::MissingSubsetSection),
            (lb_type, Some(_)) => {
                tracing::warn!("Ignoring subset section for {:?} load balancer", lb_type);
                Ok(None)
            }
            (_, None) => Ok(None),
        }
    }
}

/// Per-request routing input
pub trait LoadBalancerContext {
    /// Metadata the request wants its destination to carry
    fn metadata_match_criteria(&self) -> Option<&MatchCriteria>;
}

impl LoadBalancerContext for MatchCriteria {
    fn metadata_match_criteria(&self) -> Option<&MatchCriteria> {
        Some(self)
    }
}

/// Common selection interface
pub trait LoadBalancer: Send + Sync {
    /// Pick a destination, or `None` when nothing is available right now
    fn choose_host(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>>;
}

/// Index selection over a slice of hosts
pub trait SelectionAlgorithm: Send + Sync {
    /// `total_weight` is the sum of the weights of `hosts`
    fn select(&self, hosts: &[Arc<Host>], total_weight: u64) -> Option<usize>;
}

/// Applies a selection algorithm to a host set's healthy cache, with the
/// configured last-resort behaviour when the cache is empty
#[derive(Debug)]
pub struct HostSetBalancer<A> {
    host_set: Arc<HostSet>,
    algorithm: A,
    last_resort: LastResort,
}

pub type RandomLoadBalancer = HostSetBalancer<Random>;
pub type RoundRobinLoadBalancer = HostSetBalancer<RoundRobin>;
pub type WeightedRoundRobinLoadBalancer = HostSetBalancer<WeightedRoundRobin>;

impl<A: SelectionAlgorithm> HostSetBalancer<A> {
    pub fn new(host_set: Arc<HostSet>, algorithm: A, last_resort: LastResort) -> Self {
        Self {
            host_set,
            algorithm,
            last_resort,
        }
    }

    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.host_set
    }
}

impl<A: SelectionAlgorithm> LoadBalancer for HostSetBalancer<A> {
    fn choose_host(&self, _context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>> {
        {
            let healthy = self.host_set.healthy();
            if !healthy.is_empty() {
                let hosts = healthy.as_slice();
                return self
                    .algorithm
                    .select(hosts, healthy.total_weight())
                    .map(|i| Arc::clone(&hosts[i]));
            }
        }

        match self.last_resort {
            LastResort::Disabled => None,
            LastResort::AnyHost => {
                let hosts = self.host_set.hosts();
                if hosts.is_empty() {
                    return None;
                }
                tracing::trace!("No healthy host, selecting among all {} hosts", hosts.len());
                let total_weight = hosts.iter().map(|h| u64::from(h.weight())).sum();
                self.algorithm
                    .select(&hosts, total_weight)
                    .map(|i| Arc::clone(&hosts[i]))
            }
        }
    }
}

/// The strategy instance owned by a cluster (or a subset node)
#[derive(Debug)]
pub enum Balancer {
    Random(RandomLoadBalancer),
    RoundRobin(RoundRobinLoadBalancer),
    WeightedRoundRobin(WeightedRoundRobinLoadBalancer),
    Subset(Box<SubsetLoadBalancer>),
}

impl Balancer {
    /// Build the balancer for a cluster; rejects malformed LB configs
    pub fn new(cluster_name: &str, config: &LbConfig, host_set: Arc<HostSet>) -> UpstreamResult<Self> {
        let subset_info = config
            .validate()
            .map_err(|source| UpstreamError::invalid_lb_config(cluster_name, source))?;

        Ok(match subset_info {
            Some(info) => Balancer::Subset(Box::new(SubsetLoadBalancer::new(
                host_set,
                Arc::new(info),
                config.last_resort,
            ))),
            None => Balancer::simple(config.lb_type, host_set, config.last_resort),
        })
    }

    /// A non-subset strategy over one host set
    pub(crate) fn simple(lb_type: LbType, host_set: Arc<HostSet>, last_resort: LastResort) -> Self {
        match lb_type {
            LbType::RoundRobin => {
                Balancer::RoundRobin(HostSetBalancer::new(host_set, RoundRobin::new(), last_resort))
            }
            LbType::WeightedRoundRobin => Balancer::WeightedRoundRobin(HostSetBalancer::new(
                host_set,
                WeightedRoundRobin::new(),
                last_resort,
            )),
            // nested subsets are rejected by SubsetInfo
            LbType::Random | LbType::Subset => {
                Balancer::Random(HostSetBalancer::new(host_set, Random, last_resort))
            }
        }
    }

    pub fn lb_type(&self) -> LbType {
        match self {
            Balancer::Random(_) => LbType::Random,
            Balancer::RoundRobin(_) => LbType::RoundRobin,
            Balancer::WeightedRoundRobin(_) => LbType::WeightedRoundRobin,
            Balancer::Subset(_) => LbType::Subset,
        }
    }

    /// Re-sync after the balanced host set changed membership
    pub fn sync(&self) {
        if let Balancer::Subset(lb) = self {
            lb.sync();
        }
    }

    /// Propagate one host's health change into balancer-owned host sets
    pub fn refresh_health_host(&self, host: &Arc<Host>) {
        if let Balancer::Subset(lb) = self {
            lb.refresh_health_host(host);
        }
    }

    pub fn as_subset(&self) -> Option<&SubsetLoadBalancer> {
        match self {
            Balancer::Subset(lb) => Some(lb.as_ref()),
            _ => None,
        }
    }
}

impl LoadBalancer for Balancer {
    fn choose_host(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>> {
        match self {
            Balancer::Random(lb) => lb.choose_host(context),
            Balancer::RoundRobin(lb) => lb.choose_host(context),
            Balancer::WeightedRoundRobin(lb) => lb.choose_host(context),
            Balancer::Subset(lb) => lb.choose_host(context),
        }
    }
}
