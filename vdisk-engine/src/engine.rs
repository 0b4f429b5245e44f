//! Engine facade: builds and tears down both registries.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::{Cluster, StaticCluster};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::image::{ImageEnv, ImageSettings};
use crate::imgr::ImageManager;
use crate::proxy::NodeProxy;
use crate::resmgr::ResourceManager;

/// The resource and image registries of one run.
pub struct Engine {
    resources: Arc<ResourceManager>,
    images: Arc<ImageManager>,
}

impl Engine {
    /// Build the cluster, both registries and the configured pools.
    pub async fn startup(config: &EngineConfig, proxy: Arc<dyn NodeProxy>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidRequest(format!("{:#}", e)))?;

        let cluster: Arc<dyn Cluster> = Arc::new(StaticCluster::new(
            &config.cluster.nodes,
            &config.cluster.partition,
        ));

        let resources = Arc::new(
            ResourceManager::new(cluster, proxy.clone())
                .with_recovery(config.recovery)
                .with_suffix_length(config.images.suffix_length),
        );

        for pool in &config.pools {
            let pool_config =
                resources.define_pool_config(&pool.name, pool.pool_type, &pool.definition_params())?;
            let pool_id = resources.create_pool_object(pool_config).await?;
            info!(pool_id = %pool_id, pool_name = %pool.name, "Configured pool ready");
        }

        let images = Arc::new(ImageManager::new(ImageEnv {
            resources: resources.clone(),
            proxy,
            settings: ImageSettings::from(config),
        }));

        info!(
            nodes = config.cluster.nodes.len(),
            pools = config.pools.len(),
            "Engine started"
        );

        Ok(Self { resources, images })
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn images(&self) -> &Arc<ImageManager> {
        &self.images
    }

    /// Destroy every image object and pool. Failures are logged and the
    /// teardown goes on.
    pub async fn teardown(&self) {
        for image_id in self.images.list_images().await {
            if let Err(e) = self.images.destroy_image_object(&image_id).await {
                warn!(image_id = %image_id, error = %e, "Failed to destroy image object");
            }
        }

        for pool_id in self.resources.list_pools().await {
            if let Err(e) = self.resources.destroy_pool_object(&pool_id).await {
                warn!(pool_id = %pool_id, error = %e, "Failed to destroy pool object");
            }
        }

        info!("Engine torn down");
    }
}
