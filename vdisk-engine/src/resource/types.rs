//! Resource type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Type of resource a user can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Storage volume
    Volume,
    /// Network port
    Port,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Volume => "volume",
            ResourceType::Port => "port",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing technology of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    /// File based disk images
    File,
    /// Disk, LVM, iSCSI based volumes
    Block,
    /// RBD, iSCSI-direct based volumes
    Network,
}

/// Node-local backing of a bound resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Path, device or interface the node uses to reach the resource
    pub backing: String,
}

/// Resource metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Resource ID (assigned when the resource object is created)
    pub uuid: Option<String>,
    /// Resource name
    pub name: String,
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Owning pool ID
    pub pool: Option<String>,
    /// Whether storage (or the port) has been materialized
    #[serde(default)]
    pub allocated: bool,
    /// One binding per node
    #[serde(default)]
    pub bindings: BTreeMap<String, Binding>,
    /// Volume backing technology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<VolumeKind>,
    /// Raw device flag
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raw: bool,
}

/// Volume configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Virtual size in bytes
    pub size: u64,
    /// Actual allocation in bytes as reported by the node
    pub allocation: Option<u64>,
    /// Location once allocated (or pinned at definition time)
    pub uri: Option<String>,
    /// File name inside the pool (file volumes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Network port configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Bridge the port is plugged into
    #[serde(default)]
    pub switch: Option<String>,
    /// Tap interface name
    #[serde(default)]
    pub ifname: Option<String>,
    /// Tap file descriptors handed out by the node
    #[serde(default)]
    pub fds: Vec<i32>,
}

/// Type specific resource configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Volume(VolumeSpec),
    Port(PortSpec),
}

/// Resource configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub meta: ResourceMeta,
    pub spec: ResourceSpec,
}

impl ResourceConfig {
    /// Resource ID, empty until the resource object exists.
    pub fn id(&self) -> &str {
        self.meta.uuid.as_deref().unwrap_or_default()
    }

    pub fn volume(&self) -> Option<&VolumeSpec> {
        match &self.spec {
            ResourceSpec::Volume(v) => Some(v),
            ResourceSpec::Port(_) => None,
        }
    }

    pub fn volume_mut(&mut self) -> Option<&mut VolumeSpec> {
        match &mut self.spec {
            ResourceSpec::Volume(v) => Some(v),
            ResourceSpec::Port(_) => None,
        }
    }

    pub fn port(&self) -> Option<&PortSpec> {
        match &self.spec {
            ResourceSpec::Port(p) => Some(p),
            ResourceSpec::Volume(_) => None,
        }
    }

    pub fn port_mut(&mut self) -> Option<&mut PortSpec> {
        match &mut self.spec {
            ResourceSpec::Port(p) => Some(p),
            ResourceSpec::Volume(_) => None,
        }
    }

    /// Nodes the resource is bound to, in name order.
    pub fn bound_nodes(&self) -> Vec<String> {
        self.meta.bindings.keys().cloned().collect()
    }
}
