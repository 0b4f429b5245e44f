//! Pool driver trait definition.

use crate::cluster::Cluster;
use crate::error::Result;
use crate::params::Params;
use crate::resource::{ResourceClass, ResourceType};
use super::types::{PoolConfig, PoolSpec, PoolType};

/// Pool driver trait - implemented by each pool type.
///
/// The resource manager keeps one driver per [`PoolType`] and routes pool
/// definition, capability checks and resource construction through it.
pub trait PoolDriver: Send + Sync {
    /// The pool type this driver handles.
    fn pool_type(&self) -> PoolType;

    /// Build the type specific spec section from parameters.
    fn define_spec(&self, params: &Params) -> Result<PoolSpec>;

    /// Constructor table lookup: the implementation of `resource_type` in
    /// this kind of pool, or `None` if the pool cannot hold it.
    fn resource_class(&self, resource_type: ResourceType) -> Option<&'static ResourceClass>;

    /// Whether the pool can satisfy a resource request.
    fn meets_request(
        &self,
        pool: &PoolConfig,
        cluster: &dyn Cluster,
        resource_type: ResourceType,
        params: &Params,
    ) -> bool;

    /// The pool configuration as seen from one node.
    fn customize_config(&self, pool: &PoolConfig, _node: &str) -> Result<PoolConfig> {
        Ok(pool.clone())
    }
}

/// Node reachability shared by every driver.
///
/// With a `vm_node` tag the pool must be reachable from that node; otherwise
/// from at least one node of the current partition.
pub fn check_nodes_access(pool: &PoolConfig, cluster: &dyn Cluster, params: &Params) -> bool {
    match params.get("vm_node") {
        Some(tag) => match cluster.resolve_node_tag(tag) {
            Ok(node) => pool.is_accessible_from(&node),
            Err(_) => false,
        },
        None => {
            let partition = cluster.partition_node_names();
            pool.access_nodes().iter().any(|n| partition.contains(n))
        }
    }
}
