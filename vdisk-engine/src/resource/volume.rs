//! Storage volumes.
//!
//! Volumes are abstractions of physical partitions, LVM logical volumes and
//! file-based disk images. One implementation covers all three backings; the
//! [`VolumeKind`] decides how bindings are resolved and which extensions
//! (`resize` on file volumes) are available.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::params::{normalize_size, Params};
use crate::pool::PoolConfig;
use super::command::{ResizeArgs, ResourceCommand};
use super::traits::{new_object_id, Resource, ResourceClass, ResourceContext};
use super::types::{ResourceConfig, ResourceMeta, ResourceSpec, ResourceType, VolumeKind, VolumeSpec};

/// Default virtual size when `image_size` is not given.
pub const DEFAULT_VOLUME_SIZE: &str = "20G";
/// Default image format used to name file volumes.
pub const DEFAULT_IMAGE_FORMAT: &str = "qcow2";

/// File based volumes.
pub static FILE_VOLUME: ResourceClass = ResourceClass {
    resource_type: ResourceType::Volume,
    volume_kind: Some(VolumeKind::File),
    define: define_file_volume,
    adopt: adopt_file_volume,
    build: build_volume,
};

/// Disk, LVM and iSCSI based volumes.
pub static BLOCK_VOLUME: ResourceClass = ResourceClass {
    resource_type: ResourceType::Volume,
    volume_kind: Some(VolumeKind::Block),
    define: define_block_volume,
    adopt: adopt_block_volume,
    build: build_volume,
};

/// RBD and iSCSI-direct based volumes.
pub static NETWORK_VOLUME: ResourceClass = ResourceClass {
    resource_type: ResourceType::Volume,
    volume_kind: Some(VolumeKind::Network),
    define: define_network_volume,
    adopt: adopt_network_volume,
    build: build_volume,
};

fn define_file_volume(name: &str, params: &Params) -> Result<ResourceConfig> {
    Volume::define_config(VolumeKind::File, name, params)
}

fn define_block_volume(name: &str, params: &Params) -> Result<ResourceConfig> {
    Volume::define_config(VolumeKind::Block, name, params)
}

fn define_network_volume(name: &str, params: &Params) -> Result<ResourceConfig> {
    Volume::define_config(VolumeKind::Network, name, params)
}

fn adopt_file_volume(mut config: ResourceConfig) -> ResourceConfig {
    config.meta.volume_type = Some(VolumeKind::File);
    let name = config.meta.name.clone();
    if let Some(spec) = config.volume_mut() {
        if spec.filename.is_none() {
            spec.filename = Some(format!("{}.img", name));
        }
    }
    config
}

fn adopt_block_volume(mut config: ResourceConfig) -> ResourceConfig {
    config.meta.volume_type = Some(VolumeKind::Block);
    if let Some(spec) = config.volume_mut() {
        spec.filename = None;
    }
    config
}

fn adopt_network_volume(mut config: ResourceConfig) -> ResourceConfig {
    config.meta.volume_type = Some(VolumeKind::Network);
    if let Some(spec) = config.volume_mut() {
        spec.filename = None;
    }
    config
}

fn build_volume(config: ResourceConfig) -> Box<dyn Resource> {
    Box::new(Volume::new(config))
}

/// Insert `suffix` before the extension: `base.qcow2` -> `base_<suffix>.qcow2`.
fn suffixed_filename(filename: &str, suffix: &str) -> String {
    let path = Path::new(filename);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}_{}.{}",
            stem.to_string_lossy(),
            suffix,
            ext.to_string_lossy()
        ),
        _ => format!("{}_{}", filename, suffix),
    }
}

/// A storage volume resource.
#[derive(Debug)]
pub struct Volume {
    config: ResourceConfig,
}

impl Volume {
    /// Create the volume object; assigns the resource ID.
    pub fn new(mut config: ResourceConfig) -> Self {
        config.meta.uuid = Some(new_object_id());
        Self { config }
    }

    /// Define a volume configuration from parameters.
    ///
    /// * `image_size` - virtual size, default 20G
    /// * `image_raw_device` - raw device flag
    /// * `image_name` / `image_format` - file name of file volumes; an absolute
    ///   `image_name` pins the URI
    pub fn define_config(kind: VolumeKind, name: &str, params: &Params) -> Result<ResourceConfig> {
        let size = normalize_size(params.get_or("image_size", DEFAULT_VOLUME_SIZE))?;

        let mut spec = VolumeSpec {
            size,
            allocation: None,
            uri: None,
            filename: None,
        };

        if kind == VolumeKind::File {
            let image_name = params.get_or("image_name", name);
            let path = Path::new(image_name);
            if path.is_absolute() {
                spec.uri = Some(image_name.to_string());
                spec.filename = path.file_name().map(|f| f.to_string_lossy().to_string());
            } else {
                let format = params.get_or("image_format", DEFAULT_IMAGE_FORMAT);
                spec.filename = Some(format!("{}.{}", image_name, format));
            }
        }

        Ok(ResourceConfig {
            meta: ResourceMeta {
                uuid: None,
                name: name.to_string(),
                resource_type: ResourceType::Volume,
                pool: None,
                allocated: false,
                bindings: BTreeMap::new(),
                volume_type: Some(kind),
                raw: params.get_boolean("image_raw_device"),
            },
            spec: ResourceSpec::Volume(spec),
        })
    }

    fn kind(&self) -> VolumeKind {
        self.config.meta.volume_type.unwrap_or(VolumeKind::File)
    }

    fn spec(&self) -> Result<&VolumeSpec> {
        self.config.volume().ok_or_else(|| {
            EngineError::Internal(format!("Volume {} carries a non-volume spec", self.id()))
        })
    }
}

#[async_trait]
impl Resource for Volume {
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

        if let Some(spec) = config.volume_mut() {
            spec.uri = None;
            spec.allocation = Some(0);
            spec.filename = spec.filename.as_deref().map(|f| suffixed_filename(f, suffix));
        }

        config
    }

    fn backing_for(&self, pool: &PoolConfig, _node: &str) -> Result<String> {
        let spec = self.spec()?;
        let name = &self.config.meta.name;

        let backing = match self.kind() {
            // A known location (pinned or allocated) wins over the pool layout
            VolumeKind::File => match (&spec.uri, &pool.spec.filesystem, &spec.filename) {
                (Some(uri), _, _) => uri.clone(),
                (None, Some(fs), Some(filename)) => {
                    Path::new(&fs.path).join(filename).to_string_lossy().to_string()
                }
                _ => {
                    return Err(EngineError::InvalidRequest(format!(
                        "Pool {} has no filesystem path for volume {}",
                        pool.id(),
                        name
                    )))
                }
            },
            VolumeKind::Block => match &pool.spec.lvm {
                Some(lvm) => format!("/dev/{}/{}", lvm.volume_group, name),
                None => {
                    return Err(EngineError::InvalidRequest(format!(
                        "Pool {} has no volume group for volume {}",
                        pool.id(),
                        name
                    )))
                }
            },
            VolumeKind::Network => match &pool.spec.rbd {
                Some(rbd) if rbd.namespace.is_empty() => format!("rbd:{}/{}", rbd.pool_name, name),
                Some(rbd) => format!("rbd:{}/{}/{}", rbd.pool_name, rbd.namespace, name),
                None => {
                    return Err(EngineError::InvalidRequest(format!(
                        "Pool {} has no RBD pool for volume {}",
                        pool.id(),
                        name
                    )))
                }
            },
        };

        Ok(backing)
    }

    fn apply_allocation(&mut self, out: &Value) {
        if let Some(spec) = self.config.volume_mut() {
            if let Some(uri) = out.get("uri").and_then(Value::as_str) {
                spec.uri = Some(uri.to_string());
            }
            spec.allocation = out.get("allocation").and_then(Value::as_u64);
        }
    }

    fn clear_allocation(&mut self) {
        if let Some(spec) = self.config.volume_mut() {
            spec.allocation = None;
        }
    }

    fn apply_sync(&mut self, out: &Value) {
        if let Some(spec) = self.config.volume_mut() {
            if let Some(allocation) = out.get("allocation").and_then(Value::as_u64) {
                spec.allocation = Some(allocation);
            }
            if let Some(uri) = out.get("uri").and_then(Value::as_str) {
                spec.uri = Some(uri.to_string());
            }
            if let Some(size) = out.get("size").and_then(Value::as_u64) {
                spec.size = size;
            }
        }
    }

    fn supports(&self, command: &ResourceCommand) -> bool {
        match command {
            ResourceCommand::Resize(_) => self.kind() == VolumeKind::File,
            _ => true,
        }
    }

    async fn resize(&mut self, ctx: &ResourceContext<'_>, args: ResizeArgs) -> Result<Value> {
        let new_size = args.size.to_bytes()?;
        let current = self.spec()?.size;

        // Shrinking can lose data
        if new_size < current {
            return Err(EngineError::IllegalTransition(format!(
                "Cannot shrink volume {} from {} to {} bytes",
                self.id(),
                current,
                new_size
            )));
        }

        if new_size > current && self.is_allocated() {
            let node = self.first_bound_node("resized")?;
            let mut forward = serde_json::Map::new();
            forward.insert("size".to_string(), json!(new_size));
            self.call_node(ctx, &node, "resize", forward).await?;
        }

        if let Some(spec) = self.config.volume_mut() {
            spec.size = new_size;
        }
        info!(resource_id = %self.id(), size = new_size, "Volume resized");

        Ok(serde_json::to_value(&self.config.spec)?)
    }
}
