//! Tap network ports plugged into a linux bridge.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::pool::PoolConfig;
use super::traits::{new_object_id, Resource, ResourceClass};
use super::types::{PortSpec, ResourceConfig, ResourceMeta, ResourceSpec, ResourceType};

/// Tap ports.
pub static TAP_PORT: ResourceClass = ResourceClass {
    resource_type: ResourceType::Port,
    volume_kind: None,
    define: TapPort::define_config,
    adopt: adopt_port,
    build: build_port,
};

fn adopt_port(config: ResourceConfig) -> ResourceConfig {
    config
}

fn build_port(config: ResourceConfig) -> Box<dyn Resource> {
    Box::new(TapPort::new(config))
}

/// A tap device attached to the pool's bridge on the bound node.
#[derive(Debug)]
pub struct TapPort {
    config: ResourceConfig,
}

impl TapPort {
    /// Create the port object; assigns the resource ID.
    pub fn new(mut config: ResourceConfig) -> Self {
        config.meta.uuid = Some(new_object_id());
        Self { config }
    }

    /// Define a port configuration. `ifname` pins the tap interface name.
    pub fn define_config(name: &str, params: &Params) -> Result<ResourceConfig> {
        Ok(ResourceConfig {
            meta: ResourceMeta {
                uuid: None,
                name: name.to_string(),
                resource_type: ResourceType::Port,
                pool: None,
                allocated: false,
                bindings: BTreeMap::new(),
                volume_type: None,
                raw: false,
            },
            spec: ResourceSpec::Port(PortSpec {
                switch: None,
                ifname: params.get("ifname").map(str::to_string),
                fds: Vec::new(),
            }),
        })
    }
}

#[async_trait]
impl Resource for TapPort {
    fn config(&self) -> &ResourceConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut ResourceConfig {
        &mut self.config
    }

    fn define_config_from(&self, pool_id: &str, suffix: &str) -> ResourceConfig {
        let mut config = self.config.clone();
        config.meta.uuid = None;
        config.meta.name = format!("{}_{}", self.config.meta.name, suffix);
        config.meta.pool = Some(pool_id.to_string());
        config.meta.allocated = false;
        config.meta.bindings.clear();
        config.spec = ResourceSpec::Port(PortSpec::default());
        config
    }

    fn backing_for(&self, pool: &PoolConfig, node: &str) -> Result<String> {
        pool.spec
            .bridge
            .as_ref()
            .and_then(|b| b.switch.get(node))
            .cloned()
            .ok_or_else(|| {
                EngineError::PolicyViolation(format!(
                    "Pool {} has no bridge on node {}",
                    pool.id(),
                    node
                ))
            })
    }

    // The switch reported to callers is the one on the allocating node
    fn apply_allocation(&mut self, out: &Value) {
        let switch = self
            .config
            .meta
            .bindings
            .values()
            .next()
            .map(|b| b.backing.clone());
        if let Some(spec) = self.config.port_mut() {
            if let Some(ifname) = out.get("ifname").and_then(Value::as_str) {
                spec.ifname = Some(ifname.to_string());
            }
            spec.fds = fds_in(out);
            spec.switch = switch;
        }
    }

    fn clear_allocation(&mut self) {
        if let Some(spec) = self.config.port_mut() {
            spec.fds.clear();
        }
    }

    fn apply_sync(&mut self, out: &Value) {
        if let Some(spec) = self.config.port_mut() {
            if let Some(ifname) = out.get("ifname").and_then(Value::as_str) {
                spec.ifname = Some(ifname.to_string());
            }
            if out.get("fds").is_some() {
                spec.fds = fds_in(out);
            }
        }
    }
}

fn fds_in(out: &Value) -> Vec<i32> {
    out.get("fds")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_i64()).map(|v| v as i32).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BridgeSpec, PoolAccess, PoolMeta, PoolSpec, PoolType};
    use serde_json::json;

    fn bridge_pool() -> PoolConfig {
        let mut switch = BTreeMap::new();
        switch.insert("host1".to_string(), "br0".to_string());
        PoolConfig {
            meta: PoolMeta {
                uuid: Some("bridge-pool".into()),
                name: "br".into(),
                pool_type: PoolType::LinuxBridge,
                access: PoolAccess { nodes: vec!["host1".into(), "host2".into()] },
            },
            spec: PoolSpec {
                bridge: Some(BridgeSpec { switch, export: BTreeMap::new() }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_backing_is_node_bridge() {
        let port = TapPort::new(TapPort::define_config("nic1", &Params::new()).unwrap());
        assert_eq!(port.backing_for(&bridge_pool(), "host1").unwrap(), "br0");

        let err = port.backing_for(&bridge_pool(), "host2").unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
    }

    #[test]
    fn test_allocation_records_tap_details() {
        let mut port = TapPort::new(
            TapPort::define_config("nic1", &Params::new().with("ifname", "tap-a")).unwrap(),
        );
        port.apply_allocation(&json!({"ifname": "tap-b", "fds": [7, 8]}));
        assert_eq!(port.config().port().unwrap().ifname.as_deref(), Some("tap-b"));
        assert_eq!(port.config().port().unwrap().fds, vec![7, 8]);

        port.clear_allocation();
        assert!(port.config().port().unwrap().fds.is_empty());
    }
}
