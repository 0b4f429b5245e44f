//! Cluster membership boundary.
//!
//! The engine never discovers nodes itself; it asks a [`Cluster`] to resolve
//! node tags and enumerate node names.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Cluster membership lookups used by pools and registries.
pub trait Cluster: Send + Sync {
    /// Resolve a node tag (as used in test parameters) to a node name.
    fn resolve_node_tag(&self, tag: &str) -> Result<String>;

    /// Every node known to the cluster.
    fn all_node_names(&self) -> BTreeSet<String>;

    /// Nodes assigned to the current partition (test/run context).
    fn partition_node_names(&self) -> BTreeSet<String>;
}

/// A cluster node as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name (the proxy addresses nodes by this name)
    pub name: String,
    /// Tags that resolve to this node
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A fixed cluster built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCluster {
    nodes: BTreeSet<String>,
    tags: BTreeMap<String, String>,
    partition: BTreeSet<String>,
}

impl StaticCluster {
    /// Build a cluster. An empty partition means every node.
    pub fn new(nodes: &[NodeSpec], partition: &[String]) -> Self {
        let mut tags = BTreeMap::new();
        for node in nodes {
            // A node can always be addressed by its own name
            tags.insert(node.name.clone(), node.name.clone());
            for tag in &node.tags {
                tags.insert(tag.clone(), node.name.clone());
            }
        }

        let names: BTreeSet<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let partition = if partition.is_empty() {
            names.clone()
        } else {
            partition.iter().cloned().collect()
        };

        Self {
            nodes: names,
            tags,
            partition,
        }
    }

    /// Convenience constructor: nodes addressed by name only.
    pub fn with_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let specs: Vec<NodeSpec> = names
            .into_iter()
            .map(|n| NodeSpec { name: n.into(), tags: Vec::new() })
            .collect();
        Self::new(&specs, &[])
    }
}

impl Cluster for StaticCluster {
    fn resolve_node_tag(&self, tag: &str) -> Result<String> {
        self.tags
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(tag.to_string()))
    }

    fn all_node_names(&self) -> BTreeSet<String> {
        self.nodes.clone()
    }

    fn partition_node_names(&self) -> BTreeSet<String> {
        self.partition.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_resolution() {
        let cluster = StaticCluster::new(
            &[
                NodeSpec { name: "host1".into(), tags: vec!["node1".into()] },
                NodeSpec { name: "host2".into(), tags: vec!["node2".into()] },
            ],
            &["host2".to_string()],
        );

        assert_eq!(cluster.resolve_node_tag("node1").unwrap(), "host1");
        assert_eq!(cluster.resolve_node_tag("host2").unwrap(), "host2");
        assert!(cluster.resolve_node_tag("node3").is_err());
        assert_eq!(cluster.all_node_names().len(), 2);
        assert_eq!(
            cluster.partition_node_names().into_iter().collect::<Vec<_>>(),
            vec!["host2".to_string()]
        );
    }

    #[test]
    fn test_empty_partition_means_all_nodes() {
        let cluster = StaticCluster::with_nodes(["a", "b"]);
        assert_eq!(cluster.partition_node_names(), cluster.all_node_names());
    }
}
