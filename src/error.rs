/// Unified error handling for the upstream core
///
/// Balancing itself never fails: an empty selection is modelled as `None`.
/// The errors here cover configuration, cluster construction and registry
/// operations addressed to clusters that do not exist.
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for upstream operations
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// IO errors (config files)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Registry operation on an unknown cluster
    #[error("Cluster not found: {name}")]
    ClusterNotFound { name: String },

    /// Load balancer configuration rejected at cluster construction
    #[error("Invalid load balancer config for cluster {cluster}: {source}")]
    InvalidLbConfig {
        cluster: String,
        #[source]
        source: LbConfigError,
    },
}

/// Malformed load balancer section of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LbConfigError {
    #[error("subset load balancer requires a subset section")]
    MissingSubsetSection,

    #[error("subset selector cannot be empty")]
    EmptySelector,

    #[error("empty key in subset selector {selector:?}")]
    EmptyKey { selector: Vec<String> },

    #[error("duplicate key '{key}' in subset selector {selector:?}")]
    DuplicateKey { key: String, selector: Vec<String> },

    #[error("inner_lb_type cannot be subset")]
    NestedSubset,

    #[error("default_subset fallback requires a non-empty default_subset")]
    MissingDefaultSubset,
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid load balancer config for cluster {cluster}: {source}")]
    InvalidLbConfig {
        cluster: String,
        #[source]
        source: LbConfigError,
    },
}

/// Result type alias for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

impl UpstreamError {
    /// Create a cluster-not-found error
    pub fn cluster_not_found<S: Into<String>>(name: S) -> Self {
        UpstreamError::ClusterNotFound { name: name.into() }
    }

    /// Create an invalid load balancer config error
    pub fn invalid_lb_config<C: Into<String>>(cluster: C, source: LbConfigError) -> Self {
        UpstreamError::InvalidLbConfig {
            cluster: cluster.into(),
            source,
        }
    }

    /// Check if this error is recoverable (the caller may retry later)
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpstreamError::Io(_) => true,
            // the cluster may be registered by a later discovery push
            UpstreamError::ClusterNotFound { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            UpstreamError::Config(_) => ErrorSeverity::Critical,
            UpstreamError::InvalidLbConfig { .. } => ErrorSeverity::Error,
            UpstreamError::Io(_) => ErrorSeverity::Warning,
            UpstreamError::ClusterNotFound { .. } => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = UpstreamError::cluster_not_found("orders");
        assert!(matches!(error, UpstreamError::ClusterNotFound { .. }));
        assert_eq!(error.to_string(), "Cluster not found: orders");

        let error = UpstreamError::invalid_lb_config(
            "orders",
            LbConfigError::DuplicateKey {
                key: "zone".to_string(),
                selector: vec!["zone".to_string(), "zone".to_string()],
            },
        );
        assert_eq!(
            error.to_string(),
            "Invalid load balancer config for cluster orders: duplicate key 'zone' in subset selector [\"zone\", \"zone\"]"
        );
        let source = std::error::Error::source(&error).map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("duplicate key 'zone' in subset selector [\"zone\", \"zone\"]"));
    }

    #[test]
    fn test_error_severity() {
        let config_error = UpstreamError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let io_error = UpstreamError::Io(io::Error::new(io::ErrorKind::NotFound, "test"));
        assert_eq!(io_error.severity(), ErrorSeverity::Warning);

        assert_eq!(ErrorSeverity::Info.to_string(), "INFO");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(UpstreamError::cluster_not_found("missing").is_recoverable());

        let config_error = UpstreamError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
        assert!(!UpstreamError::invalid_lb_config("c", LbConfigError::NestedSubset).is_recoverable());
    }
}
