//! Virtual images: VM disks made of one or more layers.
//!
//! ```text
//! VirtualImage (topology: none | chain)
//!   ├── layer "base"  ── volume resource (pool A)
//!   └── layer "sn"    ── volume resource (pool A), backing = "base"
//! ```
//!
//! The qemu implementation keeps the layers in an ordered backing chain and
//! forwards storage operations to the image service on the primary node.

mod command;
pub mod layer;
mod qemu;
mod traits;
mod types;

pub use command::*;
pub use qemu::*;
pub use traits::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cluster::StaticCluster;
    use crate::mock::MockProxy;
    use crate::params::Params;
    use crate::pool::PoolType;
    use crate::resmgr::ResourceManager;
    use crate::EngineError;
    use serde_json::json;

    async fn driver() -> (QemuImageDriver, Arc<ResourceManager>, Arc<MockProxy>) {
        let proxy = Arc::new(MockProxy::new());
        let resources = Arc::new(ResourceManager::new(
            Arc::new(StaticCluster::with_nodes(["host1", "host2"])),
            proxy.clone(),
        ));
        let config = resources
            .define_pool_config("fs", PoolType::Filesystem, &Params::new().with("path", "/images"))
            .unwrap();
        resources.create_pool_object(config).await.unwrap();

        let env = ImageEnv {
            resources: resources.clone(),
            proxy: proxy.clone(),
            settings: ImageSettings::default(),
        };
        (QemuImageDriver::new(env), resources, proxy)
    }

    #[tokio::test]
    async fn test_define_chain_from_params() {
        let (driver, _, _) = driver().await;
        let params = Params::new()
            .with("image_chain", "base sn")
            .with("image_format_base", "raw")
            .with("image_size", "5G");

        let config = driver.define_config("sn", &params).await.unwrap();
        assert_eq!(config.meta.name, "sn");
        assert_eq!(config.meta.topology, Topology::Chain(vec!["base".into(), "sn".into()]));

        let base = config.layer("base").unwrap();
        assert_eq!(base.spec.format, LayerFormat::Raw);
        assert!(base.spec.backing.is_none());
        assert!(base.spec.volume_config.is_some());

        let sn = config.layer("sn").unwrap();
        assert_eq!(sn.spec.format, LayerFormat::Qcow2);
        assert_eq!(sn.spec.backing.as_deref(), Some("base"));
        let volume = sn.spec.volume_config.as_ref().unwrap().volume().unwrap();
        assert_eq!(volume.size, 5 * 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_create_object_creates_bound_volumes_without_storage() {
        let (driver, resources, proxy) = driver().await;
        let config = driver.define_config("base", &Params::new()).await.unwrap();
        let mut image = driver.build(config);
        image.create_object().await.unwrap();

        let layer = image.config().layer("base").unwrap().clone();
        assert!(layer.spec.volume_config.is_none());
        let volume = resources.resource_config(layer.spec.volume.as_deref().unwrap()).await.unwrap();
        assert_eq!(volume.bound_nodes(), vec!["host1".to_string(), "host2".to_string()]);
        assert!(!volume.meta.allocated);
        assert!(proxy.calls().is_empty());

        let verbose = image.info(true).await.unwrap();
        assert_eq!(verbose["spec"]["images"]["base"]["spec"]["volume"]["meta"]["name"], "base");
    }

    #[tokio::test]
    async fn test_create_named_non_top_layer_is_illegal() {
        let (driver, _, proxy) = driver().await;
        let params = Params::new().with("image_chain", "base sn");
        let mut image = driver.build(driver.define_config("sn", &params).await.unwrap());
        image.create_object().await.unwrap();

        let err = image
            .update(ImageCommand::Create(TargetArgs::target("base")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));

        let err = image
            .update(ImageCommand::Create(TargetArgs::target("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LayerNotFound { .. }));
        assert!(proxy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_outside_image_nodes_is_rejected() {
        let (driver, _, _) = driver().await;
        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());
        image.create_object().await.unwrap();
        image
            .update(ImageCommand::Add(AddArgs {
                target: "data".into(),
                nodes: vec!["host1".into()],
                ..Default::default()
            }))
            .await
            .unwrap();

        let err = image
            .update(ImageCommand::Add(AddArgs {
                target: "other".into(),
                nodes: vec!["host3".into()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
        assert!(image.config().layer("other").is_none());
        // Not chained: the topology is unchanged
        assert_eq!(image.config().meta.topology, Topology::None(vec!["base".into()]));
    }

    #[tokio::test]
    async fn test_add_accepts_nodes_of_any_layer() {
        let (driver, _, _) = driver().await;
        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());
        image.create_object().await.unwrap();
        image
            .update(ImageCommand::Add(AddArgs {
                target: "data".into(),
                backing_chain: true,
                nodes: vec!["host2".into()],
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(image.config().meta.name, "data");

        // host1 only reaches the base layer
        image
            .update(ImageCommand::Add(AddArgs {
                target: "extra".into(),
                nodes: vec!["host1".into()],
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(image.config().layer("extra").is_some());

        let err = image
            .update(ImageCommand::Add(AddArgs {
                target: "other".into(),
                nodes: vec!["host3".into()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
    }

    #[tokio::test]
    async fn test_lower_chain_layers_cannot_be_destroyed_or_removed() {
        let (driver, _, proxy) = driver().await;
        let params = Params::new().with("image_chain", "base sn");
        let mut image = driver.build(driver.define_config("sn", &params).await.unwrap());
        image.create_object().await.unwrap();
        image.update(ImageCommand::Create(TargetArgs::default())).await.unwrap();
        let calls = proxy.calls().len();

        let err = image
            .update(ImageCommand::Destroy(TargetArgs::target("base")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));

        let err = image
            .update(ImageCommand::Remove(RemoveArgs { target: "base".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));
        assert_eq!(proxy.calls().len(), calls);
        assert_eq!(image.config().meta.topology, Topology::Chain(vec!["base".into(), "sn".into()]));
    }

    #[tokio::test]
    async fn test_allocated_top_must_be_destroyed_before_remove() {
        let (driver, _, proxy) = driver().await;
        let params = Params::new().with("image_chain", "base sn");
        let mut image = driver.build(driver.define_config("sn", &params).await.unwrap());
        image.create_object().await.unwrap();
        image.update(ImageCommand::Create(TargetArgs::default())).await.unwrap();
        let calls = proxy.calls().len();

        let err = image
            .update(ImageCommand::Remove(RemoveArgs { target: "sn".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));
        assert_eq!(proxy.calls().len(), calls);
        assert!(image.config().layer("sn").is_some());

        image.update(ImageCommand::Destroy(TargetArgs::target("sn"))).await.unwrap();
        image
            .update(ImageCommand::Remove(RemoveArgs { target: "sn".into() }))
            .await
            .unwrap();
        assert_eq!(image.config().meta.name, "base");
        assert_eq!(image.config().meta.topology, Topology::None(vec!["base".into()]));
    }

    #[tokio::test]
    async fn test_rebase_onto_existing_layer_is_illegal() {
        let (driver, _, proxy) = driver().await;
        let params = Params::new().with("image_chain", "base sn");
        let mut image = driver.build(driver.define_config("sn", &params).await.unwrap());
        image.create_object().await.unwrap();
        image.update(ImageCommand::Create(TargetArgs::default())).await.unwrap();
        let calls = proxy.calls().len();

        let err = image
            .update(ImageCommand::Rebase(RebaseArgs { target: "base".into(), ..Default::default() }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));
        assert_eq!(proxy.calls().len(), calls);
        assert!(proxy.calls_for("rebase").is_empty());
        assert_eq!(image.config().meta.name, "sn");
    }

    #[tokio::test]
    async fn test_rebase_puts_new_top_over_old() {
        let (driver, _, proxy) = driver().await;
        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());
        image.create_object().await.unwrap();
        image.update(ImageCommand::Create(TargetArgs::default())).await.unwrap();

        image
            .update(ImageCommand::from_request(json!({"rebase": {"target": "top"}})).unwrap())
            .await
            .unwrap();

        let config = image.config();
        assert_eq!(config.meta.name, "top");
        assert_eq!(config.meta.topology, Topology::Chain(vec!["base".into(), "top".into()]));
        assert_eq!(config.layer("top").unwrap().spec.backing.as_deref(), Some("base"));

        let rebase = proxy.calls_for("rebase");
        assert_eq!(rebase.len(), 1);
        assert_eq!(rebase[0].command_args().unwrap()["source"], "base");
        assert_eq!(rebase[0].command_args().unwrap()["target"], "top");
    }

    #[tokio::test]
    async fn test_failed_rebase_rolls_back_new_layer() {
        let proxy = Arc::new(MockProxy::new());
        let resources = Arc::new(ResourceManager::new(
            Arc::new(StaticCluster::with_nodes(["host1"])),
            proxy.clone(),
        ));
        let pool = resources
            .define_pool_config("fs", PoolType::Filesystem, &Params::new())
            .unwrap();
        let pool_id = resources.create_pool_object(pool).await.unwrap();
        let driver = QemuImageDriver::new(ImageEnv {
            resources: resources.clone(),
            proxy: proxy.clone(),
            settings: ImageSettings {
                recovery: crate::config::RecoveryStrategy::Rollback,
                ..Default::default()
            },
        });

        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());
        image.create_object().await.unwrap();
        proxy.fail_image_command("rebase", 1, "backing file missing");

        let err = image
            .update(ImageCommand::Rebase(RebaseArgs { target: "top".into(), ..Default::default() }))
            .await
            .unwrap_err();
        assert_eq!(err.remote_message(), Some("backing file missing"));
        assert!(image.config().layer("top").is_none());
        assert_eq!(image.config().meta.name, "base");
        assert_eq!(resources.query_resources(Some(&pool_id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_edits_owner_only() {
        let (driver, _, _) = driver().await;
        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());

        image
            .update(ImageCommand::Config(ConfigArgs { name: None, owner: Some("vm1".into()) }))
            .await
            .unwrap();
        assert!(image.is_owned_by("vm1"));

        let err = image
            .update(ImageCommand::Config(ConfigArgs { name: Some("other".into()), owner: None }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_restore_without_backup_is_illegal() {
        let (driver, _, _) = driver().await;
        let mut image = driver.build(driver.define_config("base", &Params::new()).await.unwrap());
        image.create_object().await.unwrap();

        let err = image
            .update(ImageCommand::Restore(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition(_)));
    }
}
