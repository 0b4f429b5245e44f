//! Engine configuration.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use vdisk_common::LogFormat;

use crate::cluster::NodeSpec;
use crate::params::{normalize_size, Params};
use crate::pool::{PoolType, ALL_NODES};
use crate::resource::{DEFAULT_IMAGE_FORMAT, DEFAULT_VOLUME_SIZE};

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cluster membership
    pub cluster: ClusterConfig,
    /// Pools created at startup
    pub pools: Vec<PoolDeclaration>,
    /// Image defaults
    pub images: ImageDefaults,
    /// What to do with partial results of a failed multi-step operation
    pub recovery: RecoveryStrategy,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).with_context(|| "Failed to serialize config")
    }

    /// Check cross references between sections.
    pub fn validate(&self) -> Result<()> {
        let nodes: BTreeSet<&str> = self.cluster.nodes.iter().map(|n| n.name.as_str()).collect();
        if nodes.len() != self.cluster.nodes.len() {
            bail!("Duplicate node names in cluster configuration");
        }

        for node in &self.cluster.partition {
            if !nodes.contains(node.as_str()) {
                bail!("Partition node {} is not a cluster node", node);
            }
        }

        let mut pool_names = BTreeSet::new();
        for pool in &self.pools {
            if !pool_names.insert(pool.name.as_str()) {
                bail!("Duplicate pool name {}", pool.name);
            }
            for node in &pool.access {
                if node != ALL_NODES && !nodes.contains(node.as_str()) {
                    bail!("Pool {} grants access to unknown node {}", pool.name, node);
                }
            }
        }

        if self.images.suffix_length == 0 {
            bail!("images.suffix_length must be greater than 0");
        }

        normalize_size(&self.images.default_size)
            .with_context(|| format!("Invalid images.default_size {}", self.images.default_size))?;

        self.logging
            .format
            .parse::<LogFormat>()
            .with_context(|| "Invalid logging.format")?;

        Ok(())
    }
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Worker nodes
    pub nodes: Vec<NodeSpec>,
    /// Nodes of the current partition; empty means all nodes
    pub partition: Vec<String>,
}

/// A pool created at engine startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    /// Node names, or `*` for every node
    #[serde(default = "default_access")]
    pub access: Vec<String>,
    /// Type specific parameters (`path`, `volume_group`, `switch`, ...)
    #[serde(default)]
    pub params: Params,
}

fn default_access() -> Vec<String> {
    vec![ALL_NODES.to_string()]
}

impl PoolDeclaration {
    /// Parameters for pool definition, access nodes included.
    pub fn definition_params(&self) -> Params {
        let mut params = self.params.clone();
        params.set("access_nodes", self.access.join(" "));
        params
    }
}

/// Defaults applied when defining images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDefaults {
    /// Layer format when `image_format` is not given
    pub default_format: String,
    /// Layer size when `image_size` is not given
    pub default_size: String,
    /// Length of random clone/backup name suffixes
    pub suffix_length: usize,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            default_format: DEFAULT_IMAGE_FORMAT.to_string(),
            default_size: DEFAULT_VOLUME_SIZE.to_string(),
            suffix_length: 8,
        }
    }
}

/// Handling of partial state left by a failed clone, rebase or backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Keep whatever was created for inspection
    #[default]
    Leave,
    /// Release and destroy what the failed operation created
    Rollback,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber for this configuration.
    pub fn init(&self) -> Result<()> {
        let format = self.format.parse::<LogFormat>()?;
        vdisk_common::init_logging_with(format, &self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.recovery, RecoveryStrategy::Leave);
        assert_eq!(config.images.default_format, "qcow2");
        assert_eq!(config.images.suffix_length, 8);
    }

    #[test]
    fn test_pool_access_defaults_to_wildcard() {
        let yaml = r#"
cluster:
  nodes:
    - name: host1
pools:
  - name: fs
    type: filesystem
    params:
      path: /var/lib/vdisk
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.pools[0].access, vec!["*".to_string()]);
        assert_eq!(config.pools[0].definition_params().get("access_nodes"), Some("*"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let mut config = EngineConfig::default();
        config.cluster.partition = vec!["ghost".into()];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.images.suffix_length = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.images.default_size = "lots".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pools.push(PoolDeclaration {
            name: "fs".into(),
            pool_type: PoolType::Filesystem,
            access: vec!["host9".into()],
            params: Params::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recovery_strategy_tags() {
        let config = EngineConfig::from_yaml("recovery: rollback").unwrap();
        assert_eq!(config.recovery, RecoveryStrategy::Rollback);
        assert!(EngineConfig::from_yaml("recovery: retry").is_err());
    }
}
