//! Engine configuration parsing.
//!
//! The engine reads its tuning knobs from an `azclone.kdl` document:
//!
//! ```kdl
//! engine {
//!     processing-batch-size 50
//!     resource-graph-delay-ms 100
//!     max-concurrent-operations 10
//!     retry-attempts 3
//!     retry-delay-ms 1000
//!     rate-limits {
//!         resource-graph 100
//!         arm 200
//!         storage 500
//!     }
//! }
//! ```
//!
//! Every node is optional; missing nodes keep their defaults. Environment
//! variables of the form `AZCLONE_RETRY_ATTEMPTS` override the document.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Requests-per-second caps, one token bucket per cloud service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRateLimits {
    pub resource_graph: u32,
    pub arm: u32,
    pub storage: u32,
}

impl Default for ServiceRateLimits {
    fn default() -> Self {
        Self {
            resource_graph: 100,
            arm: 200,
            storage: 500,
        }
    }
}

/// Engine-wide tuning options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resources persisted per transaction during discovery.
    pub processing_batch_size: usize,
    /// Sleep between resource-graph pages.
    pub resource_graph_delay_ms: u64,
    /// Parallelism cap for broker workers.
    pub max_concurrent_operations: usize,
    /// Max retries for transient cloud errors.
    pub retry_attempts: u32,
    /// Base backoff between retries and between dependency levels.
    pub retry_delay_ms: u64,
    pub rate_limits: ServiceRateLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processing_batch_size: 50,
            resource_graph_delay_ms: 100,
            max_concurrent_operations: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            rate_limits: ServiceRateLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a KDL file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = parse_engine_config(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for embedders without a config
    /// file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("AZCLONE_PROCESSING_BATCH_SIZE") {
            self.processing_batch_size = v as usize;
        }
        if let Some(v) = env_u64("AZCLONE_RESOURCE_GRAPH_DELAY_MS") {
            self.resource_graph_delay_ms = v;
        }
        if let Some(v) = env_u64("AZCLONE_MAX_CONCURRENT_OPERATIONS") {
            self.max_concurrent_operations = v as usize;
        }
        if let Some(v) = env_u64("AZCLONE_RETRY_ATTEMPTS") {
            self.retry_attempts = v as u32;
        }
        if let Some(v) = env_u64("AZCLONE_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Parse an engine configuration from KDL text. Unknown nodes are ignored so
/// a config file can carry sections for other tools.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();

    let Some(engine) = doc.get("engine") else {
        return Ok(config);
    };
    let Some(children) = engine.children() else {
        return Ok(config);
    };

    for node in children.nodes() {
        match node.name().value() {
            "processing-batch-size" => {
                config.processing_batch_size = int_arg(node)? as usize;
            }
            "resource-graph-delay-ms" => {
                config.resource_graph_delay_ms = int_arg(node)?;
            }
            "max-concurrent-operations" => {
                config.max_concurrent_operations = int_arg(node)? as usize;
            }
            "retry-attempts" => {
                config.retry_attempts = int_arg(node)? as u32;
            }
            "retry-delay-ms" => {
                config.retry_delay_ms = int_arg(node)?;
            }
            "rate-limits" => {
                config.rate_limits = parse_rate_limits(node)?;
            }
            _ => {}
        }
    }

    Ok(config)
}

fn parse_rate_limits(node: &KdlNode) -> ConfigResult<ServiceRateLimits> {
    let mut limits = ServiceRateLimits::default();
    let Some(children) = node.children() else {
        return Ok(limits);
    };
    for child in children.nodes() {
        match child.name().value() {
            "resource-graph" => limits.resource_graph = int_arg(child)? as u32,
            "arm" => limits.arm = int_arg(child)? as u32,
            "storage" => limits.storage = int_arg(child)? as u32,
            _ => {}
        }
    }
    Ok(limits)
}

/// First positional argument of a node, as a non-negative integer.
fn int_arg(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value().to_string();
    let entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.clone()))?;
    let value = entry
        .value()
        .as_integer()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.clone(),
            message: "expected an integer".to_string(),
        })?;
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field,
        message: "expected a non-negative integer".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.processing_batch_size, 50);
        assert_eq!(config.resource_graph_delay_ms, 100);
        assert_eq!(config.max_concurrent_operations, 10);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.rate_limits.resource_graph, 100);
        assert_eq!(config.rate_limits.arm, 200);
        assert_eq!(config.rate_limits.storage, 500);
    }

    #[test]
    fn parses_full_document() {
        let kdl = r#"
engine {
    processing-batch-size 25
    resource-graph-delay-ms 250
    max-concurrent-operations 4
    retry-attempts 5
    retry-delay-ms 2000
    rate-limits {
        resource-graph 10
        arm 20
        storage 30
    }
}
"#;
        let config = parse_engine_config(kdl).unwrap();
        assert_eq!(config.processing_batch_size, 25);
        assert_eq!(config.resource_graph_delay_ms, 250);
        assert_eq!(config.max_concurrent_operations, 4);
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(
            config.rate_limits,
            ServiceRateLimits {
                resource_graph: 10,
                arm: 20,
                storage: 30
            }
        );
    }

    #[test]
    fn missing_nodes_keep_defaults() {
        let config = parse_engine_config("engine {\n    retry-attempts 7\n}\n").unwrap();
        assert_eq!(config.retry_attempts, 7);
        assert_eq!(config.processing_batch_size, 50);

        let empty = parse_engine_config("").unwrap();
        assert_eq!(empty, EngineConfig::default());
    }

    #[test]
    fn rejects_non_integer_values() {
        let err = parse_engine_config("engine {\n    retry-attempts \"three\"\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = parse_engine_config("engine {\n    retry-attempts -1\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_malformed_kdl() {
        assert!(matches!(
            parse_engine_config("engine {"),
            Err(ConfigError::Parse(_))
        ));
    }
}
