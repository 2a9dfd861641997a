/// Utility functions and helpers
use crate::core::{Host, HostSet, MatchCriteria};
use crate::error::UpstreamError;
use std::sync::Arc;

/// Parse `key=value` pairs separated by commas into match criteria.
///
/// Whitespace around keys and values is trimmed; an empty input yields empty
/// criteria.
pub fn parse_match_criteria(input: &str) -> Result<MatchCriteria, String> {
    let mut pairs: Vec<(&str, &str)> = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", part))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{}'", part));
        }
        if pairs.iter().any(|&(k, _)| k == key) {
            return Err(format!("duplicate key '{}'", key));
        }
        pairs.push((key, value.trim()));
    }
    Ok(pairs.into_iter().collect())
}

/// One-line summary of a host for CLI output
pub fn format_host(host: &Host) -> String {
    let mut line = format!("{} weight={}", host.address(), host.weight());
    if !host.metadata().is_empty() {
        line.push_str(&format!(" [{}]", host.metadata()));
    }
    if !host.is_healthy() {
        line.push_str(&format!(" unhealthy(flags={:#x})", host.health_flags()));
    }
    line
}

/// "healthy/total" for a host set
pub fn format_health_ratio(host_set: &HostSet) -> String {
    format!("{}/{}", host_set.healthy_count(), host_set.len())
}

/// Severity-tagged error line for CLI output, with a retry hint for
/// recoverable errors
pub fn format_error(err: &UpstreamError) -> String {
    let mut line = format!("✗ [{}] {}", err.severity(), err);
    if err.is_recoverable() {
        line.push_str(" (recoverable, retry later)");
    }
    line
}

/// Share of picks each address received, sorted by address
pub fn pick_distribution(picks: &[Arc<Host>]) -> Vec<(String, f64)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for host in picks {
        match counts.iter_mut().find(|(a, _)| a == host.address()) {
            Some((_, n)) => *n += 1,
            None => counts.push((host.address().to_string(), 1)),
        }
    }
    counts.sort();
    let total = picks.len().max(1) as f64;
    counts
        .into_iter()
        .map(|(address, n)| (address, n as f64 / total))
        .collect()
}
