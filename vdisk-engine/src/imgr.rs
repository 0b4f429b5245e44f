//! Image manager: the registry of virtual images.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument};

use crate::cluster::Cluster;
use crate::error::{EngineError, Result};
use crate::image::{ImageCommand, ImageConfig, ImageDriver, ImageEnv, ImageType, QemuImageDriver, VirtualImage};
use crate::params::Params;
use crate::query;

type ImageHandle = Arc<Mutex<Box<dyn VirtualImage>>>;

/// Registry of virtual images.
///
/// Each image lives behind its own mutex; image operations take the image
/// lock first and the pool locks (through the resource manager) after.
pub struct ImageManager {
    cluster: Arc<dyn Cluster>,
    drivers: HashMap<ImageType, Arc<dyn ImageDriver>>,
    images: RwLock<IndexMap<String, ImageHandle>>,
}

impl ImageManager {
    /// Create a registry with the qemu image driver.
    pub fn new(env: ImageEnv) -> Self {
        let cluster = env.resources.cluster().clone();
        let mut drivers: HashMap<ImageType, Arc<dyn ImageDriver>> = HashMap::new();
        drivers.insert(ImageType::Qemu, Arc::new(QemuImageDriver::new(env)));

        Self {
            cluster,
            drivers,
            images: RwLock::new(IndexMap::new()),
        }
    }

    fn driver(&self, image_type: ImageType) -> Result<&Arc<dyn ImageDriver>> {
        self.drivers.get(&image_type).ok_or_else(|| {
            EngineError::InvalidRequest(format!("No driver for image type {}", image_type))
        })
    }

    async fn image(&self, image_id: &str) -> Result<ImageHandle> {
        self.images
            .read()
            .await
            .get(image_id)
            .cloned()
            .ok_or_else(|| EngineError::ImageNotFound(image_id.to_string()))
    }

    async fn register(&self, image: Box<dyn VirtualImage>) -> String {
        let id = image.id().to_string();
        self.images.write().await.insert(id.clone(), Arc::new(Mutex::new(image)));
        id
    }

    /// Define an image configuration. `image_type` selects the driver
    /// (default `qemu`).
    pub async fn define_image_config(&self, name: &str, params: &Params) -> Result<ImageConfig> {
        let image_type: ImageType = params
            .get_or("image_type", ImageType::Qemu.as_str())
            .parse()
            .map_err(EngineError::InvalidRequest)?;
        self.driver(image_type)?.define_config(name, params).await
    }

    /// Create the image object and its layer objects.
    #[instrument(skip(self, config), fields(image_name = %config.meta.name))]
    pub async fn create_image_object(&self, config: ImageConfig) -> Result<String> {
        let mut image = self.driver(config.meta.image_type)?.build(config);
        image.create_object().await?;
        Ok(self.register(image).await)
    }

    /// Destroy the image object. Every layer must be released first.
    #[instrument(skip(self))]
    pub async fn destroy_image_object(&self, image_id: &str) -> Result<()> {
        let image = self.image(image_id).await?;
        image.lock().await.destroy_object().await?;
        self.images.write().await.shift_remove(image_id);
        Ok(())
    }

    /// Run a `{"<command>": {<arguments>}}` request. `nodes` arguments hold
    /// node tags.
    pub async fn update_image(&self, image_id: &str, request: Value) -> Result<Value> {
        let mut command = ImageCommand::from_request(request)?;
        if let Some(nodes) = command.nodes_mut() {
            *nodes = nodes
                .iter()
                .map(|tag| self.cluster.resolve_node_tag(tag))
                .collect::<Result<Vec<_>>>()?;
        }
        self.update_image_with(image_id, command).await
    }

    /// Run a typed command; node names are used as given.
    pub async fn update_image_with(&self, image_id: &str, command: ImageCommand) -> Result<Value> {
        let image = self.image(image_id).await?;
        let mut image = image.lock().await;
        image.update(command).await
    }

    /// Image document, or the value at a dot-separated `request` path.
    pub async fn get_image_info(&self, image_id: &str, request: Option<&str>, verbose: bool) -> Result<Value> {
        let info = self.image(image_id).await?.lock().await.info(verbose).await?;
        query::lookup(info, request)
    }

    /// ID of the image named `name`, optionally owned by `vm`.
    pub async fn query_image(&self, name: &str, vm: Option<&str>) -> Option<String> {
        let handles: Vec<ImageHandle> = self.images.read().await.values().cloned().collect();
        for handle in handles {
            let image = handle.lock().await;
            if image.name() == name && vm.map_or(true, |vm| image.is_owned_by(vm)) {
                return Some(image.id().to_string());
            }
        }
        None
    }

    /// Every image ID, in creation order.
    pub async fn list_images(&self) -> Vec<String> {
        self.images.read().await.keys().cloned().collect()
    }

    /// Clone an image; returns the new image ID.
    pub async fn clone_image(&self, image_id: &str) -> Result<String> {
        let clone = self.image(image_id).await?.lock().await.clone_image().await?;
        let id = self.register(clone).await;
        info!(image_id = %image_id, clone_id = %id, "Image clone registered");
        Ok(id)
    }

    /// Back up every chain layer of an image.
    pub async fn backup_image(&self, image_id: &str) -> Result<Value> {
        self.update_image_with(image_id, ImageCommand::Backup(Map::new())).await
    }

    /// Copy the backups of an image back.
    pub async fn restore_image(&self, image_id: &str) -> Result<Value> {
        self.update_image_with(image_id, ImageCommand::Restore(Map::new())).await
    }
}
