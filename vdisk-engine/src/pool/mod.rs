//! Resource pools.
//!
//! A pool owns a set of resources, decides whether it can satisfy a
//! resource request and enforces its node access policy on every command.
//! Pool behaviour is selected by a [`PoolDriver`]:
//!
//! - **filesystem**: directory of file volumes
//! - **lvm**: volume group of block volumes
//! - **rbd**: Ceph pool of network volumes
//! - **linux_bridge**: bridge holding tap ports

mod bridge;
mod storage;
mod traits;
mod types;

pub use bridge::*;
pub use storage::*;
pub use traits::*;
pub use types::*;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::cluster::Cluster;
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::proxy::NodeProxy;
use crate::resource::{
    new_object_id, Resource, ResourceClass, ResourceCommand, ResourceConfig, ResourceContext,
    ResourceType,
};

/// A pool object holding its resources.
pub struct ResourcePool {
    config: PoolConfig,
    driver: Arc<dyn PoolDriver>,
    resources: HashMap<String, Box<dyn Resource>>,
}

impl ResourcePool {
    /// Define a pool configuration. `access_nodes` lists node names or `*`
    /// (the default) for every cluster node.
    pub fn define_config(driver: &dyn PoolDriver, name: &str, params: &Params) -> Result<PoolConfig> {
        let mut nodes = params.objects("access_nodes");
        if nodes.is_empty() {
            nodes.push(ALL_NODES.to_string());
        }

        Ok(PoolConfig {
            meta: PoolMeta {
                uuid: None,
                name: name.to_string(),
                pool_type: driver.pool_type(),
                access: PoolAccess { nodes },
            },
            spec: driver.define_spec(params)?,
        })
    }

    /// Create the pool object. The wildcard access entry is resolved to the
    /// cluster nodes here, once.
    pub fn new(mut config: PoolConfig, driver: Arc<dyn PoolDriver>, cluster: &dyn Cluster) -> Self {
        if config.meta.access.is_wildcard() {
            config.meta.access.nodes = cluster.all_node_names().into_iter().collect();
        }
        config.meta.uuid = Some(new_object_id());

        info!(
            pool_id = %config.id(),
            pool_name = %config.meta.name,
            pool_type = %config.meta.pool_type,
            "Pool object created"
        );

        Self {
            config,
            driver,
            resources: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.config.id()
    }

    pub fn name(&self) -> &str {
        &self.config.meta.name
    }

    pub fn pool_type(&self) -> PoolType {
        self.config.meta.pool_type
    }

    /// Deep copy of the pool configuration.
    pub fn get_info(&self) -> PoolConfig {
        self.config.clone()
    }

    /// Whether the pool can satisfy a request for `resource_type`.
    pub fn meets_request(&self, cluster: &dyn Cluster, resource_type: ResourceType, params: &Params) -> bool {
        self.driver.meets_request(&self.config, cluster, resource_type, params)
    }

    /// The pool configuration as seen from `node`.
    pub fn customize_config(&self, node: &str) -> Result<PoolConfig> {
        self.driver.customize_config(&self.config, node)
    }

    pub fn has_resources(&self) -> bool {
        !self.resources.is_empty()
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    fn class_for(&self, resource_type: ResourceType) -> Result<&'static ResourceClass> {
        self.driver
            .resource_class(resource_type)
            .ok_or_else(|| EngineError::TypeMismatch {
                resource_type: resource_type.to_string(),
                pool_id: self.id().to_string(),
            })
    }

    fn resource(&self, id: &str) -> Result<&dyn Resource> {
        self.resources
            .get(id)
            .map(|r| r.as_ref())
            .ok_or_else(|| EngineError::ResourceNotFound(id.to_string()))
    }

    /// Define a resource configuration owned by this pool. No bindings.
    pub fn define_resource_config(
        &self,
        name: &str,
        resource_type: ResourceType,
        params: &Params,
    ) -> Result<ResourceConfig> {
        let class = self.class_for(resource_type)?;
        let mut config = (class.define)(name, params)?;
        config.meta.pool = Some(self.id().to_string());
        Ok(config)
    }

    /// Instantiate and register a resource object.
    #[instrument(skip(self, config), fields(pool_id = %self.id(), name = %config.meta.name))]
    pub fn create_resource_object(&mut self, config: ResourceConfig) -> Result<String> {
        match config.meta.pool.as_deref() {
            Some(pool) if pool == self.id() => {}
            other => {
                return Err(EngineError::InvalidRequest(format!(
                    "Resource {} belongs to pool {:?}, not {}",
                    config.meta.name,
                    other,
                    self.id()
                )))
            }
        }

        let class = self.class_for(config.meta.resource_type)?;
        let config = if config.meta.resource_type == ResourceType::Volume
            && config.meta.volume_type != class.volume_kind
        {
            (class.adopt)(config)
        } else {
            config
        };

        let mut resource = (class.build)(config);
        resource.create_object()?;

        let id = resource.id().to_string();
        debug!(resource_id = %id, "Resource object registered");
        self.resources.insert(id.clone(), resource);

        Ok(id)
    }

    /// A renamed, unbound copy of resource `id`, targeted at `dest_pool_id`.
    pub fn define_resource_config_from(&self, id: &str, dest_pool_id: &str, suffix: &str) -> Result<ResourceConfig> {
        Ok(self.resource(id)?.define_config_from(dest_pool_id, suffix))
    }

    /// Create a resource object from a configuration produced by another
    /// pool's resource (clone and backup paths).
    pub fn create_resource_object_from(&mut self, mut config: ResourceConfig) -> Result<String> {
        // Fails with TypeMismatch before anything is stamped
        self.class_for(config.meta.resource_type)?;
        config.meta.pool = Some(self.id().to_string());
        self.create_resource_object(config)
    }

    /// Remove a resource object. It must be released first.
    #[instrument(skip(self), fields(pool_id = %self.id()))]
    pub fn destroy_resource_object(&mut self, id: &str) -> Result<()> {
        if self.resource(id)?.is_allocated() {
            return Err(EngineError::IllegalTransition(format!(
                "Resource {} is still allocated and cannot be destroyed",
                id
            )));
        }

        if let Some(mut resource) = self.resources.remove(id) {
            resource.destroy_object()?;
        }
        info!(resource_id = %id, "Resource object destroyed");

        Ok(())
    }

    /// Dispatch a command to a resource.
    ///
    /// Target nodes are checked against the pool's access nodes before the
    /// handler runs.
    #[instrument(skip(self, proxy), fields(pool_id = %self.id(), command = command.name()))]
    pub async fn update_resource(
        &mut self,
        id: &str,
        command: ResourceCommand,
        proxy: &dyn NodeProxy,
    ) -> Result<Value> {
        let pool = &self.config;
        let resource = self
            .resources
            .get_mut(id)
            .ok_or_else(|| EngineError::ResourceNotFound(id.to_string()))?;

        let outside: Vec<String> = command
            .nodes()
            .into_iter()
            .filter(|n| !pool.is_accessible_from(n))
            .collect();
        if !outside.is_empty() {
            return Err(EngineError::PolicyViolation(format!(
                "Nodes {:?} cannot access pool {}",
                outside,
                pool.id()
            )));
        }

        let ctx = ResourceContext { pool, proxy };
        resource.handle(&ctx, command).await
    }

    /// Deep copy of a resource configuration.
    pub fn resource_config(&self, id: &str) -> Result<ResourceConfig> {
        Ok(self.resource(id)?.config().clone())
    }

    /// Resource document; `verbose` embeds the pool configuration under
    /// `meta.pool`.
    pub fn get_resource_info(&self, id: &str, verbose: bool) -> Result<Value> {
        let mut info = serde_json::to_value(self.resource(id)?.config())?;
        if verbose {
            info["meta"]["pool"] = serde_json::to_value(&self.config)?;
        }
        Ok(info)
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("resources", &self.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticCluster;
    use crate::mock::MockProxy;
    use crate::resource::{NodeArgs, VolumeKind};
    use serde_json::Map;

    fn cluster() -> StaticCluster {
        StaticCluster::with_nodes(["host1", "host2"])
    }

    fn fs_pool(nodes: &str) -> ResourcePool {
        let driver = Arc::new(StoragePoolDriver::filesystem());
        let params = Params::new().with("path", "/srv/fs").with("access_nodes", nodes);
        let config = ResourcePool::define_config(driver.as_ref(), "fs", &params).unwrap();
        ResourcePool::new(config, driver, &cluster())
    }

    #[test]
    fn test_wildcard_resolved_at_construction() {
        let pool = fs_pool("*");
        assert_eq!(pool.get_info().access_nodes(), ["host1".to_string(), "host2".to_string()]);
        assert!(!pool.id().is_empty());
    }

    #[test]
    fn test_define_config_is_pure() {
        let driver = StoragePoolDriver::lvm();
        let config = ResourcePool::define_config(&driver, "vg", &Params::new().with("volume_group", "vg0"))
            .unwrap();
        assert!(config.meta.uuid.is_none());
        assert_eq!(config.access_nodes(), [ALL_NODES.to_string()]);
        assert_eq!(config.spec.lvm.unwrap().volume_group, "vg0");
    }

    #[test]
    fn test_resource_belongs_to_pool() {
        let mut pool = fs_pool("*");
        let config = pool
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .unwrap();
        assert_eq!(config.meta.pool.as_deref(), Some(pool.id()));
        assert!(config.meta.bindings.is_empty());

        let id = pool.create_resource_object(config).unwrap();
        assert_eq!(pool.resource_config(&id).unwrap().meta.pool.as_deref(), Some(pool.id()));
    }

    #[test]
    fn test_port_not_supported_by_storage_pool() {
        let pool = fs_pool("*");
        let err = pool
            .define_resource_config("nic", ResourceType::Port, &Params::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_foreign_config_is_rejected() {
        let mut pool = fs_pool("*");
        let mut config = pool
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .unwrap();
        config.meta.pool = Some("other".into());
        let err = pool.create_resource_object(config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn test_copy_from_block_volume_adopts_file_kind() {
        let lvm_driver = Arc::new(StoragePoolDriver::lvm());
        let lvm_config = ResourcePool::define_config(
            lvm_driver.as_ref(),
            "vg",
            &Params::new().with("volume_group", "vg0"),
        )
        .unwrap();
        let mut lvm = ResourcePool::new(lvm_config, lvm_driver, &cluster());
        let config = lvm.define_resource_config("blk", ResourceType::Volume, &Params::new()).unwrap();
        let src = lvm.create_resource_object(config).unwrap();

        let mut fs = fs_pool("*");
        let copy = lvm.define_resource_config_from(&src, fs.id(), "x1").unwrap();
        let id = fs.create_resource_object_from(copy).unwrap();

        let created = fs.resource_config(&id).unwrap();
        assert_eq!(created.meta.volume_type, Some(VolumeKind::File));
        assert_eq!(created.meta.name, "blk_x1");
        assert_eq!(created.volume().unwrap().filename.as_deref(), Some("blk_x1.img"));
    }

    #[tokio::test]
    async fn test_nodes_outside_access_are_rejected_without_side_effects() {
        let mut pool = fs_pool("host1");
        let proxy = MockProxy::new();
        let config = pool.define_resource_config("vol", ResourceType::Volume, &Params::new()).unwrap();
        let id = pool.create_resource_object(config).unwrap();

        let err = pool
            .update_resource(&id, ResourceCommand::Bind(NodeArgs::new(["host2"])), &proxy)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
        assert!(pool.resource_config(&id).unwrap().meta.bindings.is_empty());
        assert!(proxy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_allocated_resource_cannot_be_destroyed() {
        let mut pool = fs_pool("*");
        let proxy = MockProxy::new();
        let config = pool.define_resource_config("vol", ResourceType::Volume, &Params::new()).unwrap();
        let id = pool.create_resource_object(config).unwrap();

        pool.update_resource(&id, ResourceCommand::Bind(NodeArgs::default()), &proxy)
            .await
            .unwrap();
        pool.update_resource(&id, ResourceCommand::Allocate(Map::new()), &proxy)
            .await
            .unwrap();

        let err = pool.destroy_resource_object(&id).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));

        pool.update_resource(&id, ResourceCommand::Release(Map::new()), &proxy)
            .await
            .unwrap();
        pool.destroy_resource_object(&id).unwrap();
        assert!(!pool.has_resources());
    }

    #[test]
    fn test_verbose_info_embeds_pool() {
        let mut pool = fs_pool("*");
        let config = pool.define_resource_config("vol", ResourceType::Volume, &Params::new()).unwrap();
        let id = pool.create_resource_object(config).unwrap();

        let brief = pool.get_resource_info(&id, false).unwrap();
        assert_eq!(brief["meta"]["pool"], pool.id());

        let verbose = pool.get_resource_info(&id, true).unwrap();
        assert_eq!(verbose["meta"]["pool"]["meta"]["name"], "fs");
    }
}
