//! # vdisk Engine
//!
//! Lifecycle and topology engine for virtual storage resources and virtual
//! disk images spread over a cluster of worker nodes.
//!
//! The engine tracks configuration, lifecycle state and node access of every
//! resource and image. Storage I/O itself is done by an agent on each node,
//! reached through a [`NodeProxy`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Engine                  │
//! └──────────┬───────────────────┬──────────┘
//!            ▼                   ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │   ImageManager    │ │  ResourceManager  │
//! │  (VirtualImage)   │─▶ (ResourcePool,    │
//! │                   │ │   Resource)       │
//! └─────────┬─────────┘ └─────────┬─────────┘
//!           └──────────┬──────────┘
//!                      ▼
//!               NodeProxy (agent)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vdisk_engine::{Engine, EngineConfig, MockProxy, Params};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::load("/etc/vdisk/engine.yaml").unwrap();
//!     let engine = Engine::startup(&config, Arc::new(MockProxy::new())).await.unwrap();
//!
//!     let images = engine.images();
//!     let params = Params::new().with("image_format", "raw").with("image_size", "10G");
//!     let config = images.define_image_config("base", &params).await.unwrap();
//!     let id = images.create_image_object(config).await.unwrap();
//!     images.update_image(&id, serde_json::json!({"create": {}})).await.unwrap();
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod imgr;
pub mod mock;
pub mod params;
pub mod pool;
pub mod proxy;
pub mod query;
pub mod resmgr;
pub mod resource;

pub use cluster::{Cluster, NodeSpec, StaticCluster};
pub use config::{EngineConfig, PoolDeclaration, RecoveryStrategy};
pub use engine::Engine;
pub use error::{EngineError, ErrorCategory, Result};
pub use image::{
    ImageCommand,
    ImageConfig,
    ImageType,
    LayerConfig,
    LayerFormat,
    Topology,
    VirtualImage,
};
pub use imgr::ImageManager;
pub use mock::{MockProxy, ProxyCall};
pub use params::{normalize_size, Params};
pub use pool::{PoolConfig, PoolType, ResourcePool};
pub use proxy::{NodeProxy, ProxyReply};
pub use resmgr::ResourceManager;
pub use resource::{
    NodeArgs,
    ResourceCommand,
    ResourceConfig,
    ResourceType,
    VolumeKind,
};
