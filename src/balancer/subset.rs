/// Subset-aware load balancing
///
/// The request's match criteria pick a subset from the index; each subset
/// owns an inner balancer over its own host set. Unmatched requests follow
/// the configured fallback policy.
use super::{Balancer, LastResort, LoadBalancer, LoadBalancerContext};
use crate::core::subset::SubsetEntry;
use crate::core::{FallbackPolicy, Host, HostSet, SubsetIndex, SubsetInfo};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::sync::Arc;

/// One subset: its host set plus the inner balancer picking from it
#[derive(Debug)]
pub struct SubsetNode {
    host_set: Arc<HostSet>,
    balancer: Balancer,
}

impl SubsetNode {
    fn new(host_set: Arc<HostSet>, info: &SubsetInfo, last_resort: LastResort) -> Self {
        let balancer = Balancer::simple(info.inner_lb_type(), Arc::clone(&host_set), last_resort);
        Self { host_set, balancer }
    }

    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.host_set
    }

    pub fn choose_host(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>> {
        self.balancer.choose_host(context)
    }
}

impl SubsetEntry for SubsetNode {
    fn host_set(&self) -> &HostSet {
        &self.host_set
    }
}

#[derive(Debug)]
pub struct SubsetLoadBalancer {
    /// The cluster's full host set
    host_set: Arc<HostSet>,
    info: Arc<SubsetInfo>,
    last_resort: LastResort,
    /// Whole-cluster node used by the any-endpoint fallback; it survives
    /// rebuilds so its inner balancer state does too
    any_endpoint: SubsetNode,
    index: ArcSwap<SubsetIndex<SubsetNode>>,
    /// Write-held while an index is built and published, read-held while a
    /// health change is pushed into it
    rebuild: RwLock<()>,
}

impl SubsetLoadBalancer {
    pub fn new(host_set: Arc<HostSet>, info: Arc<SubsetInfo>, last_resort: LastResort) -> Self {
        let any_endpoint = SubsetNode::new(Arc::clone(&host_set), &info, last_resort);
        let index = Self::build_index(&host_set, &info, last_resort);
        Self {
            host_set,
            info,
            last_resort,
            any_endpoint,
            index: ArcSwap::from_pointee(index),
            rebuild: RwLock::new(()),
        }
    }

    fn build_index(host_set: &HostSet, info: &Arc<SubsetInfo>, last_resort: LastResort) -> SubsetIndex<SubsetNode> {
        let hosts = host_set.hosts();
        SubsetIndex::build(Arc::clone(info), &hosts, |subset_hosts| {
            SubsetNode::new(subset_hosts, info, last_resort)
        })
    }

    /// Rebuild the index from the cluster's current membership
    pub fn sync(&self) {
        let _guard = self.rebuild.write();
        let index = Self::build_index(&self.host_set, &self.info, self.last_resort);
        tracing::debug!(
            "Rebuilt subset index: {} subsets over {} hosts",
            index.len(),
            self.host_set.len()
        );
        self.index.store(Arc::new(index));
    }

    pub fn refresh_health_host(&self, host: &Arc<Host>) {
        let _guard = self.rebuild.read();
        self.index.load().refresh_health_host(host);
    }

    /// Current index snapshot
    pub fn index(&self) -> Arc<SubsetIndex<SubsetNode>> {
        self.index.load_full()
    }

    pub fn info(&self) -> &SubsetInfo {
        &self.info
    }

    /// Host set a request would be balanced over, after fallback
    pub fn resolve(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<HostSet>> {
        let index = self.index.load();
        self.with_node(&index, context, |node| Arc::clone(node.host_set()))
    }

    fn with_node<R>(
        &self,
        index: &SubsetIndex<SubsetNode>,
        context: Option<&dyn LoadBalancerContext>,
        f: impl FnOnce(&SubsetNode) -> R,
    ) -> Option<R> {
        let criteria = context
            .and_then(|ctx| ctx.metadata_match_criteria())
            .filter(|criteria| !criteria.is_empty());
        if let Some(node) = criteria.and_then(|criteria| index.get(criteria)) {
            return Some(f(node));
        }

        match self.info.fallback_policy() {
            FallbackPolicy::NoFallback => None,
            FallbackPolicy::AnyEndpoint => Some(f(&self.any_endpoint)),
            FallbackPolicy::DefaultSubset => index.default_entry().map(f),
        }
    }
}

impl LoadBalancer for SubsetLoadBalancer {
    fn choose_host(&self, context: Option<&dyn LoadBalancerContext>) -> Option<Arc<Host>> {
        let index = self.index.load();
        self.with_node(&index, context, |node| node.choose_host(context))
            .flatten()
    }
}
