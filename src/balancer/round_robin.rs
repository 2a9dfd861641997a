/// Round-robin selection algorithms
use super::SelectionAlgorithm;
use crate::core::Host;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin over the current healthy hosts.
///
/// The cursor is shared by all callers and only ever advances; it is reduced
/// modulo the length seen by each call, so a shrinking host set never takes
/// it out of bounds.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionAlgorithm for RoundRobin {
    fn select(&self, hosts: &[Arc<Host>], _total_weight: u64) -> Option<usize> {
        if hosts.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(index)
    }
}

/// Weighted round-robin algorithm
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionAlgorithm for WeightedRoundRobin {
    fn select(&self, hosts: &[Arc<Host>], total_weight: u64) -> Option<usize> {
        if hosts.is_empty() {
            return None;
        }

        if total_weight == 0 {
            // Fall back to simple round-robin if no weights
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
            return Some(index);
        }

        let position = self.counter.fetch_add(1, Ordering::Relaxed) as u64 % total_weight;
        let mut current_weight = 0u64;

        for (index, host) in hosts.iter().enumerate() {
            current_weight += u64::from(host.weight());
            if position < current_weight {
                return Some(index);
            }
        }

        // total_weight disagreed with the slice
        Some(hosts.len() - 1)
    }
}
