//! Linux bridge network pool.

use std::collections::BTreeMap;

use crate::cluster::Cluster;
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::resource::{ResourceClass, ResourceType, TAP_PORT};
use super::traits::{check_nodes_access, PoolDriver};
use super::types::{BridgeSpec, PoolConfig, PoolSpec, PoolType};

/// Driver for linux bridge pools holding tap ports.
#[derive(Default)]
pub struct BridgePoolDriver;

impl BridgePoolDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Parse `node:ifname node:ifname` pairs.
fn node_interfaces(value: Option<&str>) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in value.unwrap_or_default().split_whitespace() {
        let (node, ifname) = pair.split_once(':').ok_or_else(|| {
            EngineError::InvalidRequest(format!("Expected node:ifname, got {}", pair))
        })?;
        map.insert(node.to_string(), ifname.to_string());
    }
    Ok(map)
}

impl PoolDriver for BridgePoolDriver {
    fn pool_type(&self) -> PoolType {
        PoolType::LinuxBridge
    }

    fn define_spec(&self, params: &Params) -> Result<PoolSpec> {
        let switch = node_interfaces(params.get("switch"))?;
        if switch.is_empty() {
            return Err(EngineError::InvalidRequest(
                "Bridge pool requires switch interfaces".to_string(),
            ));
        }

        Ok(PoolSpec {
            bridge: Some(BridgeSpec {
                switch,
                export: node_interfaces(params.get("export"))?,
            }),
            ..Default::default()
        })
    }

    fn resource_class(&self, resource_type: ResourceType) -> Option<&'static ResourceClass> {
        match resource_type {
            ResourceType::Port => Some(&TAP_PORT),
            ResourceType::Volume => None,
        }
    }

    fn meets_request(
        &self,
        pool: &PoolConfig,
        cluster: &dyn Cluster,
        resource_type: ResourceType,
        params: &Params,
    ) -> bool {
        if resource_type != ResourceType::Port || params.get("nettype") != Some("bridge") {
            return false;
        }

        check_nodes_access(pool, cluster, params)
    }

    /// Keep only the given node's interfaces.
    fn customize_config(&self, pool: &PoolConfig, node: &str) -> Result<PoolConfig> {
        let mut config = pool.clone();
        if let Some(bridge) = config.spec.bridge.as_mut() {
            if !bridge.switch.contains_key(node) {
                return Err(EngineError::PolicyViolation(format!(
                    "Pool {} has no bridge on node {}",
                    pool.id(),
                    node
                )));
            }
            bridge.switch.retain(|n, _| n == node);
            bridge.export.retain(|n, _| n == node);
        }
        Ok(config)
    }
}
