/// Uniform random selection
use super::SelectionAlgorithm;
use crate::core::Host;
use rand::Rng;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct Random;

impl SelectionAlgorithm for Random {
    fn select(&self, hosts: &[Arc<Host>], _total_weight: u64) -> Option<usize> {
        if hosts.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..hosts.len()))
    }
}
