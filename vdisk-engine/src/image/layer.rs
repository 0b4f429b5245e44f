//! Layers: the lower-level images a virtual image is made of.
//!
//! Each layer is backed by exactly one volume resource. Before the layer
//! object exists it carries the volume definition; afterwards the ID of the
//! volume object.

use serde_json::Map;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::resource::{new_object_id, NodeArgs, ResourceCommand, ResourceType};
use super::traits::ImageEnv;
use super::types::{ImageType, LayerConfig, LayerFormat, LayerMeta, LayerSpec};

/// Define a layer and its volume.
///
/// * `image_format` - `raw`, `qcow2` or `luks`
/// * `image_size` - virtual size
/// * `image_cluster_size`, `preallocated` - qcow2 options
/// * `image_secret` - luks secret
///
/// The volume goes to the first pool meeting the request, so the usual pool
/// selection parameters (`storage_type`, `image_pool_name`, `vm_node`) apply.
pub async fn define_layer_config(env: &ImageEnv, name: &str, params: &Params) -> Result<LayerConfig> {
    let settings = &env.settings;
    let format_tag = params.get_or("image_format", &settings.default_format).to_string();
    let format: LayerFormat = format_tag.parse().map_err(EngineError::InvalidRequest)?;

    let mut volume_params = params.clone();
    volume_params.set("image_format", format_tag);
    if volume_params.get("image_size").is_none() {
        volume_params.set("image_size", settings.default_size.clone());
    }

    let volume_config = env
        .resources
        .define_resource_config(name, ResourceType::Volume, &volume_params)
        .await?;

    let (cluster_size, preallocation, secret) = match format {
        LayerFormat::Qcow2 => (
            params.get("image_cluster_size").map(str::to_string),
            params.get("preallocated").map(str::to_string),
            None,
        ),
        LayerFormat::Luks => (None, None, params.get("image_secret").map(str::to_string)),
        LayerFormat::Raw => (None, None, None),
    };

    Ok(LayerConfig {
        meta: LayerMeta {
            uuid: None,
            name: name.to_string(),
            image_type: ImageType::Qemu,
        },
        spec: LayerSpec {
            format,
            backing: None,
            backup: None,
            volume: None,
            volume_config: Some(volume_config),
            cluster_size,
            preallocation,
            secret,
        },
    })
}

/// Create the layer object: its volume object is created and bound to
/// `nodes` (the pool's nodes when empty).
pub async fn create_layer_object(env: &ImageEnv, layer: &mut LayerConfig, nodes: &[String]) -> Result<()> {
    let Some(volume_config) = layer.spec.volume_config.clone() else {
        return Ok(());
    };

    let volume = env.resources.create_resource_object(volume_config).await?;
    let bind = ResourceCommand::Bind(NodeArgs::new(nodes.iter().cloned()));
    if let Err(e) = env.resources.update_resource_with(&volume, bind).await {
        if let Err(destroy_err) = env.resources.destroy_resource_object(&volume).await {
            warn!(volume = %volume, error = %destroy_err, "Failed to drop unbound layer volume");
        }
        return Err(e);
    }

    layer.meta.uuid = Some(new_object_id());
    layer.spec.volume_config = None;
    layer.spec.volume = Some(volume);
    debug!(layer = %layer.meta.name, "Layer object created");
    Ok(())
}

/// Destroy the layer object and its volume object. The layer goes back to
/// carrying its volume definition.
pub async fn destroy_layer_object(env: &ImageEnv, layer: &mut LayerConfig) -> Result<()> {
    let Some(volume) = layer.spec.volume.clone() else {
        return Ok(());
    };

    let mut definition = env.resources.resource_config(&volume).await?;
    env.resources.destroy_resource_object(&volume).await?;

    definition.meta.uuid = None;
    definition.meta.bindings.clear();
    layer.spec.volume_config = Some(definition);
    layer.spec.volume = None;
    layer.meta.uuid = None;
    debug!(layer = %layer.meta.name, "Layer object destroyed");
    Ok(())
}

/// Whether the layer's volume holds storage.
pub async fn is_allocated(env: &ImageEnv, layer: &LayerConfig) -> Result<bool> {
    match layer.spec.volume.as_deref() {
        Some(volume) => Ok(env.resources.resource_config(volume).await?.meta.allocated),
        None => Ok(false),
    }
}

/// Allocate the layer's volume; `true` when this call allocated it.
pub async fn allocate(env: &ImageEnv, layer: &LayerConfig) -> Result<bool> {
    let volume = volume_of(layer)?;
    if is_allocated(env, layer).await? {
        return Ok(false);
    }
    env.resources
        .update_resource_with(volume, ResourceCommand::Allocate(Map::new()))
        .await?;
    Ok(true)
}

/// Release the layer's volume.
pub async fn release(env: &ImageEnv, layer: &LayerConfig) -> Result<()> {
    env.resources
        .update_resource_with(volume_of(layer)?, ResourceCommand::Release(Map::new()))
        .await?;
    Ok(())
}

/// The layer's volume ID.
pub fn volume_of(layer: &LayerConfig) -> Result<&str> {
    layer.spec.volume.as_deref().ok_or_else(|| {
        EngineError::IllegalTransition(format!("Layer {} has no object yet", layer.meta.name))
    })
}
