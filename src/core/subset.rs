/// Metadata subsets: selector validation, match criteria and the subset index
///
/// Every configured selector is a set of metadata keys. For each selector a
/// host carrying all of its keys lands in exactly one partition, keyed by its
/// values for those keys. Since a selector is identified by its sorted key
/// list, a partition is identified by the sorted (key, value) tuple alone and
/// all partitions of all selectors share one hash map.
use super::host_set::HostSet;
use super::{Host, Metadata};
use crate::balancer::LbType;
use crate::error::LbConfigError;
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What to do when a request's criteria match no subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Select nothing
    #[default]
    NoFallback,
    /// Select from the whole cluster
    AnyEndpoint,
    /// Select from the configured default subset
    DefaultSubset,
}

/// Subset section of a cluster's load balancer config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetConfig {
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    /// Key combinations to partition hosts by
    #[serde(default)]
    pub selectors: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub default_subset: Metadata,
    /// Strategy used inside each subset
    #[serde(default)]
    pub inner_lb_type: LbType,
}

impl Default for SubsetConfig {
    fn default() -> Self {
        Self {
            fallback_policy: FallbackPolicy::NoFallback,
            selectors: Vec::new(),
            default_subset: Metadata::new(),
            inner_lb_type: LbType::Random,
        }
    }
}

/// Sorted, key-unique list of (key, value) pairs a request wants matched
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchCriteria(Vec<(String, String)>);

impl MatchCriteria {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self(
            metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Later duplicates of a key win
impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MatchCriteria {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let sorted: BTreeMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self(sorted.into_iter().collect())
    }
}

impl fmt::Display for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}

/// Whether the host's metadata contains every pair of the criteria
pub fn host_matches(criteria: &MatchCriteria, host: &Host) -> bool {
    criteria
        .iter()
        .all(|(key, value)| host.metadata().get(key) == Some(value))
}

/// The host's values for `keys`, or `None` if any key is missing.
/// `keys` must already be sorted.
pub fn extract_subset_metadata(keys: &[String], metadata: &Metadata) -> Option<MatchCriteria> {
    keys.iter()
        .map(|key| metadata.get(key).map(|value| (key.clone(), value.to_string())))
        .collect::<Option<Vec<_>>>()
        .map(MatchCriteria)
}

/// Validated subset settings for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetInfo {
    selectors: Vec<Vec<String>>,
    fallback_policy: FallbackPolicy,
    default_subset: MatchCriteria,
    inner_lb_type: LbType,
}

impl SubsetInfo {
    /// Validate and normalize a subset config: keys are sorted, repeated
    /// selectors collapse into one
    pub fn new(config: &SubsetConfig) -> Result<Self, LbConfigError> {
        if config.inner_lb_type == LbType::Subset {
            return Err(LbConfigError::NestedSubset);
        }

        let mut seen = FnvHashSet::default();
        let mut selectors = Vec::with_capacity(config.selectors.len());
        for selector in &config.selectors {
            if selector.is_empty() {
                return Err(LbConfigError::EmptySelector);
            }
            let mut keys = selector.clone();
            keys.sort();
            if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
                return Err(LbConfigError::DuplicateKey {
                    key: pair[0].clone(),
                    selector: selector.clone(),
                });
            }
            if keys.iter().any(|key| key.is_empty()) {
                return Err(LbConfigError::EmptyKey {
                    selector: selector.clone(),
                });
            }
            if !seen.insert(keys.clone()) {
                tracing::warn!("Ignoring repeated subset selector {:?}", selector);
                continue;
            }
            selectors.push(keys);
        }

        if config.fallback_policy == FallbackPolicy::DefaultSubset && config.default_subset.is_empty() {
            return Err(LbConfigError::MissingDefaultSubset);
        }

        Ok(Self {
            selectors,
            fallback_policy: config.fallback_policy,
            default_subset: MatchCriteria::from_metadata(&config.default_subset),
            inner_lb_type: config.inner_lb_type,
        })
    }

    pub fn selectors(&self) -> &[Vec<String>] {
        &self.selectors
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback_policy
    }

    pub fn default_subset(&self) -> &MatchCriteria {
        &self.default_subset
    }

    pub fn inner_lb_type(&self) -> LbType {
        self.inner_lb_type
    }
}

/// Anything stored in a subset index exposes the host set it balances over
pub trait SubsetEntry {
    fn host_set(&self) -> &HostSet;
}

impl SubsetEntry for Arc<HostSet> {
    fn host_set(&self) -> &HostSet {
        self
    }
}

/// Partitions of one membership snapshot.
///
/// Built in one pass over the parent's hosts and never patched structurally;
/// a membership change builds a new index. Health changes are pushed into
/// the affected entries through `refresh_health_host`.
#[derive(Debug)]
pub struct SubsetIndex<N> {
    info: Arc<SubsetInfo>,
    entries: FnvHashMap<MatchCriteria, N>,
    /// Default subset when it is not itself one of the partitions
    default_entry: Option<N>,
}

impl<N: SubsetEntry> SubsetIndex<N> {
    pub fn build<F>(info: Arc<SubsetInfo>, hosts: &[Arc<Host>], mut make_entry: F) -> Self
    where
        F: FnMut(Arc<HostSet>) -> N,
    {
        let mut partitions: FnvHashMap<MatchCriteria, Vec<Arc<Host>>> = FnvHashMap::default();
        for host in hosts {
            for keys in info.selectors() {
                if let Some(criteria) = extract_subset_metadata(keys, host.metadata()) {
                    partitions.entry(criteria).or_default().push(Arc::clone(host));
                }
            }
        }

        let entries: FnvHashMap<_, _> = partitions
            .into_iter()
            .map(|(criteria, members)| (criteria, make_entry(Arc::new(HostSet::with_hosts(members)))))
            .collect();

        let default_entry = if info.fallback_policy() == FallbackPolicy::DefaultSubset
            && !entries.contains_key(info.default_subset())
        {
            let members: Vec<_> = hosts
                .iter()
                .filter(|host| host_matches(info.default_subset(), host))
                .cloned()
                .collect();
            if members.is_empty() {
                None
            } else {
                Some(make_entry(Arc::new(HostSet::with_hosts(members))))
            }
        } else {
            None
        };

        Self {
            info,
            entries,
            default_entry,
        }
    }

    /// Exact lookup: the criteria keys must equal one selector's keys
    pub fn get(&self, criteria: &MatchCriteria) -> Option<&N> {
        self.entries.get(criteria)
    }

    /// Entry backing the default subset, if any host matches it
    pub fn default_entry(&self) -> Option<&N> {
        self.entries
            .get(self.info.default_subset())
            .or(self.default_entry.as_ref())
    }

    /// Push a health change into every entry holding the host.
    /// Returns how many entries were touched.
    pub fn refresh_health_host(&self, host: &Arc<Host>) -> usize {
        let mut touched = 0;
        for keys in self.info.selectors() {
            let Some(criteria) = extract_subset_metadata(keys, host.metadata()) else {
                continue;
            };
            if let Some(entry) = self.entries.get(&criteria) {
                entry.host_set().refresh_health_host(host);
                touched += 1;
            }
        }
        if let Some(entry) = &self.default_entry {
            if host_matches(self.info.default_subset(), host) {
                entry.host_set().refresh_health_host(host);
                touched += 1;
            }
        }
        touched
    }

    pub fn info(&self) -> &SubsetInfo {
        &self.info
    }

    /// Number of partitions, the default entry excluded
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn criteria(&self) -> impl Iterator<Item = &MatchCriteria> {
        self.entries.keys()
    }
}
