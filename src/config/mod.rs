/// Configuration management for mesh-upstream
use crate::balancer::{LastResort, LbConfig, LbType};
use crate::core::{FallbackPolicy, HostConfig, Metadata, SubsetConfig};
pub use crate::error::{ConfigError, LbConfigError};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Thresholds for turning check results into health flags
    #[serde(default)]
    pub health: HealthConfig,
    /// Clusters to register at startup
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// One cluster: name, load balancer settings and initial hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(flatten)]
    pub lb: LbConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Health flag thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub success_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            health: HealthConfig::default(),
            clusters: vec![ClusterConfig {
                name: "default".to_string(),
                lb: LbConfig::new(LbType::RoundRobin),
                hosts: vec![HostConfig::new("127.0.0.1:8080")],
            }],
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = FnvHashSet::default();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "cluster name cannot be empty".to_string(),
                ));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate cluster name: {}",
                    cluster.name
                )));
            }

            cluster
                .lb
                .validate()
                .map_err(|source| ConfigError::InvalidLbConfig {
                    cluster: cluster.name.clone(),
                    source,
                })?;

            for host in &cluster.hosts {
                if host.address.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "cluster {}: host address cannot be empty",
                        cluster.name
                    )));
                }
            }
        }

        // Validate health config
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.health.success_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health success_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, lb_type: &str) -> Result<(), ConfigError> {
        let lb = match lb_type {
            "random" => LbConfig::new(LbType::Random),
            "round_robin" => LbConfig::new(LbType::RoundRobin),
            "weighted_round_robin" => LbConfig::new(LbType::WeightedRoundRobin),
            "subset" => LbConfig::subset(SubsetConfig {
                fallback_policy: FallbackPolicy::AnyEndpoint,
                selectors: vec![
                    vec!["zone".to_string(), "version".to_string()],
                    vec!["zone".to_string()],
                ],
                default_subset: Metadata::new(),
                inner_lb_type: LbType::Random,
            }),
            _ => {
                return Err(ConfigError::ValidationError(
                    "LB type must be 'random', 'round_robin', 'weighted_round_robin' or 'subset'"
                        .to_string(),
                ))
            }
        };

        let hosts = [("a", "1"), ("a", "2"), ("b", "2")]
            .iter()
            .enumerate()
            .map(|(i, (zone, version))| {
                let metadata: Metadata = [("zone", *zone), ("version", *version)].into_iter().collect();
                HostConfig::new(format!("10.0.1.{}:8080", 10 + i)).with_metadata(metadata)
            })
            .collect();

        let config = Config {
            clusters: vec![ClusterConfig {
                name: "example".to_string(),
                lb: lb.with_last_resort(LastResort::AnyHost),
                hosts,
            }],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}
