//! Pool type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wildcard meaning "every node known to the cluster".
pub const ALL_NODES: &str = "*";

/// Type of resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Directory on a (local or shared) filesystem, file volumes
    Filesystem,
    /// LVM volume group, block volumes
    Lvm,
    /// Ceph RBD pool, network volumes
    Rbd,
    /// Linux bridge, tap ports
    LinuxBridge,
}

impl PoolType {
    /// The tag used in configuration documents and parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Filesystem => "filesystem",
            PoolType::Lvm => "lvm",
            PoolType::Rbd => "rbd",
            PoolType::LinuxBridge => "linux_bridge",
        }
    }
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(PoolType::Filesystem),
            "lvm" => Ok(PoolType::Lvm),
            "rbd" => Ok(PoolType::Rbd),
            "linux_bridge" => Ok(PoolType::LinuxBridge),
            other => Err(format!("Unknown pool type: {}", other)),
        }
    }
}

/// Which nodes may reach a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAccess {
    /// Node names, or [`ALL_NODES`]
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl PoolAccess {
    /// Whether the node list is the wildcard (or empty).
    pub fn is_wildcard(&self) -> bool {
        self.nodes.iter().all(|n| n == ALL_NODES)
    }
}

/// Pool metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMeta {
    /// Pool ID (assigned when the pool object is created)
    pub uuid: Option<String>,
    /// Pool name
    pub name: String,
    /// Pool type
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    /// Access policy
    #[serde(default)]
    pub access: PoolAccess,
}

/// Filesystem pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    /// Directory holding the volume files on every accessing node
    pub path: String,
}

/// LVM pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmSpec {
    /// Volume group name
    pub volume_group: String,
}

/// Ceph RBD pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbdSpec {
    /// Ceph pool name
    pub pool_name: String,
    /// Monitor addresses (e.g., ["10.0.0.1:6789"])
    #[serde(default)]
    pub monitors: Vec<String>,
    /// Namespace within the pool
    #[serde(default)]
    pub namespace: String,
}

/// Linux bridge pool configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSpec {
    /// Bridge interface per node
    #[serde(default)]
    pub switch: BTreeMap<String, String>,
    /// Uplink interface per node
    #[serde(default)]
    pub export: BTreeMap<String, String>,
}

/// Pool type specific configuration; exactly one section is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lvm: Option<LvmSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd: Option<RbdSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeSpec>,
}

/// Resource pool configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub meta: PoolMeta,
    #[serde(default)]
    pub spec: PoolSpec,
}

impl PoolConfig {
    /// Pool ID, empty until the pool object exists.
    pub fn id(&self) -> &str {
        self.meta.uuid.as_deref().unwrap_or_default()
    }

    /// Nodes allowed to reach the pool.
    pub fn access_nodes(&self) -> &[String] {
        &self.meta.access.nodes
    }

    /// Whether `node` may reach the pool.
    pub fn is_accessible_from(&self, node: &str) -> bool {
        self.meta.access.nodes.iter().any(|n| n == node)
    }
}
