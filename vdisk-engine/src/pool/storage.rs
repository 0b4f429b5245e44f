//! Storage pool drivers: filesystem, LVM and Ceph RBD.
//!
//! All three hold volumes only; they differ in the volume backing they hand
//! out and in the spec section they carry.

use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::resource::{ResourceClass, ResourceType, BLOCK_VOLUME, FILE_VOLUME, NETWORK_VOLUME};
use super::traits::{check_nodes_access, PoolDriver};
use super::types::{FilesystemSpec, LvmSpec, PoolConfig, PoolSpec, PoolType, RbdSpec};

/// Default base path for filesystem pools.
pub const DEFAULT_POOL_PATH: &str = "/var/lib/vdisk/images";

/// Storage pool type requested when `storage_type` is not given.
pub const DEFAULT_STORAGE_TYPE: &str = "filesystem";

/// Driver for pools holding volumes.
pub struct StoragePoolDriver {
    pool_type: PoolType,
}

impl StoragePoolDriver {
    /// Directory pool with file volumes.
    pub fn filesystem() -> Self {
        Self { pool_type: PoolType::Filesystem }
    }

    /// LVM volume group with block volumes.
    pub fn lvm() -> Self {
        Self { pool_type: PoolType::Lvm }
    }

    /// Ceph RBD pool with network volumes.
    pub fn rbd() -> Self {
        Self { pool_type: PoolType::Rbd }
    }
}

impl PoolDriver for StoragePoolDriver {
    fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    fn define_spec(&self, params: &Params) -> Result<PoolSpec> {
        let spec = match self.pool_type {
            PoolType::Filesystem => PoolSpec {
                filesystem: Some(FilesystemSpec {
                    path: params.get_or("path", DEFAULT_POOL_PATH).to_string(),
                }),
                ..Default::default()
            },
            PoolType::Lvm => {
                let volume_group = params.get("volume_group").ok_or_else(|| {
                    EngineError::InvalidRequest("LVM pool requires volume_group".to_string())
                })?;
                PoolSpec {
                    lvm: Some(LvmSpec { volume_group: volume_group.to_string() }),
                    ..Default::default()
                }
            }
            PoolType::Rbd => {
                let pool_name = params.get("pool_name").ok_or_else(|| {
                    EngineError::InvalidRequest("RBD pool requires pool_name".to_string())
                })?;
                PoolSpec {
                    rbd: Some(RbdSpec {
                        pool_name: pool_name.to_string(),
                        monitors: params.objects("monitors"),
                        namespace: params.get_or("namespace", "").to_string(),
                    }),
                    ..Default::default()
                }
            }
            PoolType::LinuxBridge => {
                return Err(EngineError::Internal(
                    "Storage driver cannot define a bridge pool".to_string(),
                ))
            }
        };
        Ok(spec)
    }

    fn resource_class(&self, resource_type: ResourceType) -> Option<&'static ResourceClass> {
        match (resource_type, self.pool_type) {
            (ResourceType::Volume, PoolType::Filesystem) => Some(&FILE_VOLUME),
            (ResourceType::Volume, PoolType::Lvm) => Some(&BLOCK_VOLUME),
            (ResourceType::Volume, PoolType::Rbd) => Some(&NETWORK_VOLUME),
            _ => None,
        }
    }

    fn meets_request(
        &self,
        pool: &PoolConfig,
        cluster: &dyn Cluster,
        resource_type: ResourceType,
        params: &Params,
    ) -> bool {
        if resource_type != ResourceType::Volume {
            return false;
        }

        if params.get_or("storage_type", DEFAULT_STORAGE_TYPE) != self.pool_type.as_str() {
            return false;
        }

        // A caller can pin the pool by name
        if let Some(name) = params.get("image_pool_name") {
            if name != pool.meta.name {
                debug!(pool = %pool.meta.name, wanted = %name, "Pool name does not match request");
                return false;
            }
        }

        check_nodes_access(pool, cluster, params)
    }
}
