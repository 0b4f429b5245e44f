//! Virtual image trait definitions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{EngineConfig, RecoveryStrategy};
use crate::error::Result;
use crate::params::Params;
use crate::proxy::NodeProxy;
use crate::resmgr::ResourceManager;
use crate::resource::{DEFAULT_IMAGE_FORMAT, DEFAULT_VOLUME_SIZE};
use super::command::ImageCommand;
use super::types::{ImageConfig, ImageType};

/// Image defaults and failure handling.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSettings {
    pub recovery: RecoveryStrategy,
    pub suffix_length: usize,
    pub default_format: String,
    pub default_size: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            recovery: RecoveryStrategy::default(),
            suffix_length: crate::resmgr::DEFAULT_SUFFIX_LENGTH,
            default_format: DEFAULT_IMAGE_FORMAT.to_string(),
            default_size: DEFAULT_VOLUME_SIZE.to_string(),
        }
    }
}

impl From<&EngineConfig> for ImageSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            recovery: config.recovery,
            suffix_length: config.images.suffix_length,
            default_format: config.images.default_format.clone(),
            default_size: config.images.default_size.clone(),
        }
    }
}

/// What image objects work with: the resource registry for their layer
/// volumes and the proxy for node side image operations.
#[derive(Clone)]
pub struct ImageEnv {
    pub resources: Arc<ResourceManager>,
    pub proxy: Arc<dyn NodeProxy>,
    pub settings: ImageSettings,
}

/// A virtual image: one VM disk made of one or more layers.
///
/// Topology changes keep two invariants: the image name is the top layer,
/// and every non-base chain layer is backed by its predecessor.
#[async_trait]
pub trait VirtualImage: Send + Sync {
    /// The image document.
    fn config(&self) -> &ImageConfig;

    fn id(&self) -> &str {
        self.config().id()
    }

    fn name(&self) -> &str {
        &self.config().meta.name
    }

    fn is_owned_by(&self, vm: &str) -> bool {
        self.config().meta.owner.as_deref() == Some(vm)
    }

    /// Create the layer objects and their volume objects. No storage.
    async fn create_object(&mut self) -> Result<()>;

    /// Destroy every layer object. All volumes must be released.
    async fn destroy_object(&mut self) -> Result<()>;

    /// Run an update command.
    async fn update(&mut self, command: ImageCommand) -> Result<Value>;

    /// Image document; `verbose` inlines each layer's volume document.
    async fn info(&self, verbose: bool) -> Result<Value>;

    /// A new image object with copies of every chain layer, allocated.
    async fn clone_image(&self) -> Result<Box<dyn VirtualImage>>;
}

/// Image driver - one per [`ImageType`].
#[async_trait]
pub trait ImageDriver: Send + Sync {
    fn image_type(&self) -> ImageType;

    /// Define an image configuration; layer volumes are defined in the
    /// pools selected for them.
    async fn define_config(&self, name: &str, params: &Params) -> Result<ImageConfig>;

    /// Instantiate the image object; assigns the image ID.
    fn build(&self, config: ImageConfig) -> Box<dyn VirtualImage>;
}
