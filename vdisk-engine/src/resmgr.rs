//! Resource manager: the registry of pools and their resources.
//!
//! Pools live behind their own mutex inside a table guarded by an `RwLock`;
//! resource commands serialize on the owning pool's mutex. A resource index
//! maps every resource ID to its pool so callers never need to know where a
//! resource lives.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::cluster::Cluster;
use crate::config::RecoveryStrategy;
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::pool::{BridgePoolDriver, PoolConfig, PoolDriver, PoolType, ResourcePool, StoragePoolDriver};
use crate::proxy::NodeProxy;
use crate::query;
use crate::resource::{random_suffix, CommandArgs, NodeArgs, ResourceCommand, ResourceConfig, ResourceType};

/// Default length of random name suffixes.
pub const DEFAULT_SUFFIX_LENGTH: usize = 8;

/// Registry of pools and resources.
pub struct ResourceManager {
    cluster: Arc<dyn Cluster>,
    proxy: Arc<dyn NodeProxy>,
    drivers: HashMap<PoolType, Arc<dyn PoolDriver>>,
    /// Pool ID -> pool, in creation order
    pools: RwLock<IndexMap<String, Arc<Mutex<ResourcePool>>>>,
    /// Resource ID -> pool ID
    resource_index: RwLock<HashMap<String, String>>,
    recovery: RecoveryStrategy,
    suffix_len: usize,
}

impl ResourceManager {
    /// Create a registry with the built-in pool drivers.
    pub fn new(cluster: Arc<dyn Cluster>, proxy: Arc<dyn NodeProxy>) -> Self {
        let mut drivers: HashMap<PoolType, Arc<dyn PoolDriver>> = HashMap::new();
        drivers.insert(PoolType::Filesystem, Arc::new(StoragePoolDriver::filesystem()));
        drivers.insert(PoolType::Lvm, Arc::new(StoragePoolDriver::lvm()));
        drivers.insert(PoolType::Rbd, Arc::new(StoragePoolDriver::rbd()));
        drivers.insert(PoolType::LinuxBridge, Arc::new(BridgePoolDriver::new()));

        Self {
            cluster,
            proxy,
            drivers,
            pools: RwLock::new(IndexMap::new()),
            resource_index: RwLock::new(HashMap::new()),
            recovery: RecoveryStrategy::default(),
            suffix_len: DEFAULT_SUFFIX_LENGTH,
        }
    }

    /// Set the partial failure handling of `clone_resource`.
    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set the length of generated name suffixes.
    pub fn with_suffix_length(mut self, len: usize) -> Self {
        self.suffix_len = len;
        self
    }

    /// Register (or replace) the driver of a pool type.
    pub fn register_driver(&mut self, driver: Arc<dyn PoolDriver>) {
        self.drivers.insert(driver.pool_type(), driver);
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn suffix_length(&self) -> usize {
        self.suffix_len
    }

    fn driver(&self, pool_type: PoolType) -> Result<&Arc<dyn PoolDriver>> {
        self.drivers.get(&pool_type).ok_or_else(|| {
            EngineError::InvalidRequest(format!("No driver for pool type {}", pool_type))
        })
    }

    async fn pool(&self, pool_id: &str) -> Result<Arc<Mutex<ResourcePool>>> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .cloned()
            .ok_or_else(|| EngineError::PoolNotFound(pool_id.to_string()))
    }

    async fn pool_of(&self, resource_id: &str) -> Result<Arc<Mutex<ResourcePool>>> {
        let pool_id = self
            .resource_index
            .read()
            .await
            .get(resource_id)
            .cloned()
            .ok_or_else(|| EngineError::ResourceNotFound(resource_id.to_string()))?;
        self.pool(&pool_id).await
    }

    async fn all_pools(&self) -> Vec<Arc<Mutex<ResourcePool>>> {
        self.pools.read().await.values().cloned().collect()
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Define a pool configuration. Access node tags are resolved to node names.
    pub fn define_pool_config(&self, name: &str, pool_type: PoolType, params: &Params) -> Result<PoolConfig> {
        let mut config = ResourcePool::define_config(self.driver(pool_type)?.as_ref(), name, params)?;
        if !config.meta.access.is_wildcard() {
            config.meta.access.nodes = config
                .meta
                .access
                .nodes
                .iter()
                .map(|tag| self.cluster.resolve_node_tag(tag))
                .collect::<Result<_>>()?;
        }
        Ok(config)
    }

    /// Create a pool object and register it.
    #[instrument(skip(self, config), fields(pool_name = %config.meta.name))]
    pub async fn create_pool_object(&self, config: PoolConfig) -> Result<String> {
        let driver = self.driver(config.meta.pool_type)?.clone();
        let pool = ResourcePool::new(config, driver, self.cluster.as_ref());
        let id = pool.id().to_string();

        self.pools.write().await.insert(id.clone(), Arc::new(Mutex::new(pool)));
        Ok(id)
    }

    /// Remove a pool. It must not own resources anymore.
    #[instrument(skip(self))]
    pub async fn destroy_pool_object(&self, pool_id: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let pool = pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| EngineError::PoolNotFound(pool_id.to_string()))?;

        if pool.lock().await.has_resources() {
            return Err(EngineError::IllegalTransition(format!(
                "Pool {} still owns resources",
                pool_id
            )));
        }

        pools.shift_remove(pool_id);
        info!(pool_id = %pool_id, "Pool object destroyed");
        Ok(())
    }

    /// Pool document, or the value at a dot-separated `request` path.
    pub async fn get_pool_info(&self, pool_id: &str, request: Option<&str>) -> Result<Value> {
        let info = self.pool(pool_id).await?.lock().await.get_info();
        query::lookup(serde_json::to_value(info)?, request)
    }

    /// The pool configuration as seen from `node`.
    pub async fn customize_pool_config(&self, pool_id: &str, node: &str) -> Result<PoolConfig> {
        self.pool(pool_id).await?.lock().await.customize_config(node)
    }

    /// ID of the pool named `name`.
    pub async fn query_pool(&self, name: &str) -> Option<String> {
        for pool in self.all_pools().await {
            let pool = pool.lock().await;
            if pool.name() == name {
                return Some(pool.id().to_string());
            }
        }
        None
    }

    /// Every pool ID, in creation order.
    pub async fn list_pools(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// The first pool able to satisfy a request.
    pub async fn select_pool(&self, resource_type: ResourceType, params: &Params) -> Option<String> {
        for pool in self.all_pools().await {
            let pool = pool.lock().await;
            if pool.meets_request(self.cluster.as_ref(), resource_type, params) {
                debug!(pool_id = %pool.id(), resource_type = %resource_type, "Pool selected");
                return Some(pool.id().to_string());
            }
        }
        None
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Define a resource configuration in the first pool meeting the request.
    pub async fn define_resource_config(
        &self,
        name: &str,
        resource_type: ResourceType,
        params: &Params,
    ) -> Result<ResourceConfig> {
        let pool_id = self.select_pool(resource_type, params).await.ok_or_else(|| {
            EngineError::PolicyViolation(format!(
                "No pool meets the request for {} resource {}",
                resource_type, name
            ))
        })?;
        self.pool(&pool_id)
            .await?
            .lock()
            .await
            .define_resource_config(name, resource_type, params)
    }

    /// Create a resource object in the pool named by `meta.pool`.
    #[instrument(skip(self, config), fields(name = %config.meta.name))]
    pub async fn create_resource_object(&self, config: ResourceConfig) -> Result<String> {
        let pool_id = config.meta.pool.clone().ok_or_else(|| {
            EngineError::InvalidRequest(format!("Resource {} names no pool", config.meta.name))
        })?;
        let id = self.pool(&pool_id).await?.lock().await.create_resource_object(config)?;

        self.resource_index.write().await.insert(id.clone(), pool_id);
        Ok(id)
    }

    /// Copy resource `resource_id` into `dest_pool_id` under a random suffix.
    pub async fn create_resource_object_from(&self, resource_id: &str, dest_pool_id: &str) -> Result<String> {
        let suffix = random_suffix(self.suffix_len);
        self.create_resource_object_from_with_suffix(resource_id, dest_pool_id, &suffix)
            .await
    }

    /// Copy resource `resource_id` into `dest_pool_id` as `{name}_{suffix}`.
    ///
    /// The copy is unbound and unallocated.
    #[instrument(skip(self))]
    pub async fn create_resource_object_from_with_suffix(
        &self,
        resource_id: &str,
        dest_pool_id: &str,
        suffix: &str,
    ) -> Result<String> {
        // Never hold two pool locks at once
        let config = self
            .pool_of(resource_id)
            .await?
            .lock()
            .await
            .define_resource_config_from(resource_id, dest_pool_id, suffix)?;

        let id = self
            .pool(dest_pool_id)
            .await?
            .lock()
            .await
            .create_resource_object_from(config)?;

        self.resource_index
            .write()
            .await
            .insert(id.clone(), dest_pool_id.to_string());
        Ok(id)
    }

    /// Copy a resource in its own pool, bound to the same nodes and allocated.
    #[instrument(skip(self))]
    pub async fn clone_resource(&self, resource_id: &str) -> Result<String> {
        let source = self.resource_config(resource_id).await?;
        let pool_id = source.meta.pool.clone().unwrap_or_default();
        let id = self.create_resource_object_from(resource_id, &pool_id).await?;

        let prepared = async {
            self.update_resource_with(&id, ResourceCommand::Bind(NodeArgs::new(source.bound_nodes())))
                .await?;
            self.update_resource_with(&id, ResourceCommand::Allocate(Map::new()))
                .await
        };

        if let Err(e) = prepared.await {
            if self.recovery == RecoveryStrategy::Rollback {
                self.discard(&id).await;
            }
            return Err(e);
        }

        info!(resource_id = %resource_id, clone_id = %id, "Resource cloned");
        Ok(id)
    }

    /// Best-effort release and destroy of a resource.
    pub(crate) async fn discard(&self, resource_id: &str) {
        if let Err(e) = self
            .update_resource_with(resource_id, ResourceCommand::Release(Map::new()))
            .await
        {
            warn!(resource_id = %resource_id, error = %e, "Failed to release resource");
            return;
        }
        if let Err(e) = self.destroy_resource_object(resource_id).await {
            warn!(resource_id = %resource_id, error = %e, "Failed to destroy resource");
        }
    }

    /// Remove a released resource object.
    #[instrument(skip(self))]
    pub async fn destroy_resource_object(&self, resource_id: &str) -> Result<()> {
        self.pool_of(resource_id)
            .await?
            .lock()
            .await
            .destroy_resource_object(resource_id)?;
        self.resource_index.write().await.remove(resource_id);
        Ok(())
    }

    /// Run a `{"<command>": {<arguments>}}` request. `nodes` arguments hold
    /// node tags.
    pub async fn update_resource(&self, resource_id: &str, request: Value) -> Result<Value> {
        let command = match ResourceCommand::from_request(request)? {
            ResourceCommand::Bind(args) => ResourceCommand::Bind(self.resolve_nodes(args)?),
            ResourceCommand::Unbind(args) => ResourceCommand::Unbind(self.resolve_nodes(args)?),
            ResourceCommand::Allocate(args) => ResourceCommand::Allocate(self.resolve_args(args)?),
            ResourceCommand::Release(args) => ResourceCommand::Release(self.resolve_args(args)?),
            ResourceCommand::Sync(args) => ResourceCommand::Sync(self.resolve_args(args)?),
            ResourceCommand::Resize(args) => ResourceCommand::Resize(args),
        };
        self.update_resource_with(resource_id, command).await
    }

    /// Run a typed command; node names are used as given.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn update_resource_with(&self, resource_id: &str, command: ResourceCommand) -> Result<Value> {
        self.pool_of(resource_id)
            .await?
            .lock()
            .await
            .update_resource(resource_id, command, self.proxy.as_ref())
            .await
    }

    fn resolve_nodes(&self, args: NodeArgs) -> Result<NodeArgs> {
        let nodes = args
            .nodes
            .iter()
            .map(|tag| self.cluster.resolve_node_tag(tag))
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeArgs { nodes })
    }

    /// Resolve the tags of a free-form `nodes` argument in place.
    fn resolve_args(&self, mut args: CommandArgs) -> Result<CommandArgs> {
        if let Some(Value::Array(tags)) = args.get_mut("nodes") {
            for tag in tags.iter_mut() {
                let node = match tag.as_str() {
                    Some(t) => self.cluster.resolve_node_tag(t)?,
                    None => continue,
                };
                *tag = Value::String(node);
            }
        }
        Ok(args)
    }

    /// Deep copy of a resource configuration.
    pub async fn resource_config(&self, resource_id: &str) -> Result<ResourceConfig> {
        self.pool_of(resource_id).await?.lock().await.resource_config(resource_id)
    }

    /// Resource document, or the value at a dot-separated `request` path.
    pub async fn get_resource_info(&self, resource_id: &str, request: Option<&str>, verbose: bool) -> Result<Value> {
        let info = self
            .pool_of(resource_id)
            .await?
            .lock()
            .await
            .get_resource_info(resource_id, verbose)?;
        query::lookup(info, request)
    }

    /// Resource IDs, optionally limited to one pool.
    pub async fn query_resources(&self, pool_id: Option<&str>) -> Result<Vec<String>> {
        match pool_id {
            Some(id) => Ok(self.pool(id).await?.lock().await.resource_ids()),
            None => Ok(self.resource_index.read().await.keys().cloned().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeSpec, StaticCluster};
    use crate::mock::MockProxy;
    use serde_json::json;

    fn cluster() -> Arc<StaticCluster> {
        Arc::new(StaticCluster::new(
            &[
                NodeSpec { name: "host1".into(), tags: vec!["node1".into()] },
                NodeSpec { name: "host2".into(), tags: vec!["node2".into()] },
            ],
            &[],
        ))
    }

    async fn manager_with_fs() -> (ResourceManager, Arc<MockProxy>, String) {
        let proxy = Arc::new(MockProxy::new());
        let mgr = ResourceManager::new(cluster(), proxy.clone());
        let config = mgr
            .define_pool_config("fs", PoolType::Filesystem, &Params::new().with("path", "/srv"))
            .unwrap();
        let pool_id = mgr.create_pool_object(config).await.unwrap();
        (mgr, proxy, pool_id)
    }

    #[tokio::test]
    async fn test_define_resource_selects_matching_pool() {
        let (mgr, _, pool_id) = manager_with_fs().await;

        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        assert_eq!(config.meta.pool.as_deref(), Some(pool_id.as_str()));

        let err = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new().with("storage_type", "rbd"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
    }

    #[tokio::test]
    async fn test_resource_lifecycle_through_requests() {
        let (mgr, proxy, pool_id) = manager_with_fs().await;
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new().with("image_size", "1G"))
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();
        assert_eq!(mgr.query_resources(Some(&pool_id)).await.unwrap(), vec![id.clone()]);

        // Tags are resolved to node names
        mgr.update_resource(&id, json!({"bind": {"nodes": ["node2"]}})).await.unwrap();
        mgr.update_resource(&id, json!({"allocate": {}})).await.unwrap();

        let uri = mgr.get_resource_info(&id, Some("spec.uri"), false).await.unwrap();
        assert_eq!(uri, json!({"uri": "/srv/vol.qcow2"}));
        assert_eq!(proxy.calls_for("allocate")[0].node, "host2");

        mgr.update_resource(&id, json!({"release": null})).await.unwrap();
        mgr.destroy_resource_object(&id).await.unwrap();

        let err = mgr.get_resource_info(&id, None, false).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_free_form_node_tags_are_resolved() {
        let (mgr, proxy, _) = manager_with_fs().await;
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();

        mgr.update_resource(&id, json!({"bind": {"nodes": ["node2"]}})).await.unwrap();
        mgr.update_resource(&id, json!({"allocate": {"nodes": ["node2"]}})).await.unwrap();
        assert!(mgr.resource_config(&id).await.unwrap().meta.allocated);

        let allocate = proxy.calls_for("allocate");
        assert_eq!(allocate[0].args["arguments"]["nodes"], json!(["host2"]));

        mgr.update_resource(&id, json!({"sync": {"nodes": ["node2"]}})).await.unwrap();
        let err = mgr
            .update_resource(&id, json!({"release": {"nodes": ["node9"]}}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeNotFound(_)));
        assert!(mgr.resource_config(&id).await.unwrap().meta.allocated);
    }

    #[tokio::test]
    async fn test_unknown_command_is_invalid_request() {
        let (mgr, _, _) = manager_with_fs().await;
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();

        let err = mgr.update_resource(&id, json!({"explode": {}})).await.unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::InvalidRequest);
    }

    #[tokio::test]
    async fn test_pool_with_resources_cannot_be_destroyed() {
        let (mgr, _, pool_id) = manager_with_fs().await;
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();

        let err = mgr.destroy_pool_object(&pool_id).await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));

        mgr.destroy_resource_object(&id).await.unwrap();
        mgr.destroy_pool_object(&pool_id).await.unwrap();
        assert!(mgr.list_pools().await.is_empty());
    }

    #[tokio::test]
    async fn test_clone_resource_is_bound_and_allocated() {
        let (mgr, _, _) = manager_with_fs().await;
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();
        mgr.update_resource(&id, json!({"bind": {"nodes": ["host1"]}})).await.unwrap();

        let clone_id = mgr.clone_resource(&id).await.unwrap();
        let clone = mgr.resource_config(&clone_id).await.unwrap();

        assert_ne!(clone_id, id);
        assert!(clone.meta.allocated);
        assert_eq!(clone.bound_nodes(), vec!["host1".to_string()]);
        assert!(clone.meta.name.starts_with("vol_"));
        assert_eq!(clone.meta.name.len(), "vol_".len() + DEFAULT_SUFFIX_LENGTH);
    }

    #[tokio::test]
    async fn test_clone_rollback_on_allocation_failure() {
        let proxy = Arc::new(MockProxy::new());
        let mgr = ResourceManager::new(cluster(), proxy.clone()).with_recovery(RecoveryStrategy::Rollback);
        let config = mgr
            .define_pool_config("fs", PoolType::Filesystem, &Params::new())
            .unwrap();
        let pool_id = mgr.create_pool_object(config).await.unwrap();
        let config = mgr
            .define_resource_config("vol", ResourceType::Volume, &Params::new())
            .await
            .unwrap();
        let id = mgr.create_resource_object(config).await.unwrap();
        mgr.update_resource(&id, json!({"bind": {}})).await.unwrap();

        proxy.fail_method("allocate", 1, "no space");
        assert!(mgr.clone_resource(&id).await.is_err());
        assert_eq!(mgr.query_resources(Some(&pool_id)).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_query_pool_by_name() {
        let (mgr, _, pool_id) = manager_with_fs().await;
        assert_eq!(mgr.query_pool("fs").await, Some(pool_id.clone()));
        assert_eq!(mgr.query_pool("nope").await, None);

        let name = mgr.get_pool_info(&pool_id, Some("meta.name")).await.unwrap();
        assert_eq!(name, json!({"name": "fs"}));
    }
}
