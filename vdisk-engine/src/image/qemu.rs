//! qemu-img style virtual images.
//!
//! Layers form an ordered backing chain (base first). Storage-affecting
//! operations go to the image service of the image's primary node, the first
//! (by name) of the nodes its layer volumes are bound to.

use std::collections::BTreeSet;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::RecoveryStrategy;
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::proxy::{self, IMAGE_SERVICE, UPDATE_IMAGE};
use crate::resource::{new_object_id, random_suffix, CommandArgs, NodeArgs, ResourceCommand, ResourceType};
use super::command::{AddArgs, ConfigArgs, ImageCommand, RebaseArgs, RemoveArgs, TargetArgs};
use super::layer::{self as layers, create_layer_object, define_layer_config, destroy_layer_object};
use super::traits::{ImageDriver, ImageEnv, VirtualImage};
use super::types::{ImageConfig, ImageMeta, ImageSpec, ImageType, LayerConfig, LayerMeta, LayerSpec, Topology};

/// Driver for qemu images.
pub struct QemuImageDriver {
    env: ImageEnv,
}

impl QemuImageDriver {
    pub fn new(env: ImageEnv) -> Self {
        Self { env }
    }
}

#[async_trait]
impl ImageDriver for QemuImageDriver {
    fn image_type(&self) -> ImageType {
        ImageType::Qemu
    }

    /// `image_chain` lists the layers base first (default: just `name`);
    /// each layer reads its own parameters with `<key>_<layer>` overrides.
    async fn define_config(&self, name: &str, params: &Params) -> Result<ImageConfig> {
        let mut chain = params.objects("image_chain");
        if chain.is_empty() {
            chain.push(name.to_string());
        }

        let mut images = IndexMap::new();
        let mut backing: Option<String> = None;
        for layer_name in &chain {
            let mut layer = define_layer_config(&self.env, layer_name, &params.object_params(layer_name)).await?;
            layer.spec.backing = backing.replace(layer_name.clone());
            images.insert(layer_name.clone(), layer);
        }

        let topology = Topology::from_names(chain);
        let top = topology.top().unwrap_or(name).to_string();
        if top != name {
            debug!(name = %name, top = %top, "Image named after its top layer");
        }

        Ok(ImageConfig {
            meta: ImageMeta {
                uuid: None,
                name: top,
                image_type: ImageType::Qemu,
                owner: params.get("vm_name").map(str::to_string),
                topology,
            },
            spec: ImageSpec { images },
        })
    }

    fn build(&self, config: ImageConfig) -> Box<dyn VirtualImage> {
        Box::new(QemuVirtualImage::new(config, self.env.clone()))
    }
}

/// A qemu image object.
pub struct QemuVirtualImage {
    config: ImageConfig,
    env: ImageEnv,
}

impl QemuVirtualImage {
    /// Create the image object; assigns the image ID.
    pub fn new(mut config: ImageConfig, env: ImageEnv) -> Self {
        config.meta.uuid = Some(new_object_id());
        Self { config, env }
    }

    fn topology(&self) -> &Topology {
        &self.config.meta.topology
    }

    fn layer(&self, name: &str) -> Result<&LayerConfig> {
        self.config.spec.images.get(name).ok_or_else(|| EngineError::LayerNotFound {
            image: self.id().to_string(),
            layer: name.to_string(),
        })
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut LayerConfig> {
        let image = self.id().to_string();
        self.config
            .spec
            .images
            .get_mut(name)
            .ok_or_else(|| EngineError::LayerNotFound { image, layer: name.to_string() })
    }

    fn top(&self) -> Result<String> {
        self.topology().top().map(str::to_string).ok_or_else(|| {
            EngineError::Internal(format!("Image {} has an empty topology", self.id()))
        })
    }

    /// Nodes the image can be used from: every node a layer volume is
    /// bound to, in name order.
    async fn access_nodes(&self) -> Result<Vec<String>> {
        let mut nodes = BTreeSet::new();
        for (_, volume) in self.config.volumes() {
            nodes.extend(self.env.resources.resource_config(volume).await?.bound_nodes());
        }
        Ok(nodes.into_iter().collect())
    }

    async fn primary_node(&self) -> Result<String> {
        self.access_nodes().await?.into_iter().next().ok_or_else(|| {
            EngineError::IllegalTransition(format!("Image {} is not bound to any node", self.id()))
        })
    }

    /// Forward `{command: args}` to the image service on the primary node.
    async fn call_node(&self, command: &str, args: Value) -> Result<Value> {
        let node = self.primary_node().await?;
        let mut cmd = Map::new();
        cmd.insert(command.to_string(), args);
        let request = json!({
            "image": self.info(true).await?,
            "command": Value::Object(cmd),
        });
        proxy::invoke(self.env.proxy.as_ref(), &node, IMAGE_SERVICE, UPDATE_IMAGE, request).await
    }

    /// Layers a create/destroy acts on. A named chain layer must be the top.
    fn targets(&self, target: Option<&str>, all_layers: bool) -> Result<Vec<String>> {
        let Some(target) = target else {
            return Ok(if all_layers {
                self.config.spec.images.keys().cloned().collect()
            } else {
                self.topology().names().to_vec()
            });
        };

        self.layer(target)?;
        if self.topology().contains(target) && self.topology().top() != Some(target) {
            return Err(EngineError::IllegalTransition(format!(
                "Layer {} is not the top of image {}",
                target,
                self.id()
            )));
        }
        Ok(vec![target.to_string()])
    }

    /// Release volumes allocated by a failed operation.
    async fn release_volumes(&self, volumes: &[String]) {
        for volume in volumes {
            let release = ResourceCommand::Release(Map::new());
            if let Err(e) = self.env.resources.update_resource_with(volume, release).await {
                warn!(image_id = %self.id(), volume = %volume, error = %e, "Failed to release volume");
            }
        }
    }

    async fn create(&mut self, args: TargetArgs) -> Result<Value> {
        let targets = self.targets(args.target.as_deref(), false)?;

        let mut allocated = Vec::new();
        for name in &targets {
            let layer = self.layer(name)?;
            match layers::allocate(&self.env, layer).await {
                Ok(true) => allocated.push(layers::volume_of(layer)?.to_string()),
                Ok(false) => {}
                Err(e) => {
                    self.release_volumes(&allocated).await;
                    return Err(e);
                }
            }
        }

        match self.call_node("create", serde_json::to_value(&args)?).await {
            Ok(out) => {
                info!(image_id = %self.id(), layers = ?targets, "Image storage created");
                Ok(out)
            }
            Err(e) => {
                self.release_volumes(&allocated).await;
                Err(e)
            }
        }
    }

    async fn destroy(&mut self, args: TargetArgs) -> Result<Value> {
        let targets = self.targets(args.target.as_deref(), true)?;
        for name in &targets {
            let layer = self.layer(name)?;
            if layer.spec.volume.is_some() {
                layers::release(&self.env, layer).await?;
            }
        }
        info!(image_id = %self.id(), layers = ?targets, "Image storage destroyed");
        Ok(Value::Null)
    }

    async fn add(&mut self, args: AddArgs) -> Result<Value> {
        if self.config.spec.images.contains_key(&args.target) {
            return Err(EngineError::IllegalTransition(format!(
                "Layer {} already exists in image {}",
                args.target,
                self.id()
            )));
        }

        let access = self.access_nodes().await?;
        let nodes = if args.nodes.is_empty() { access.clone() } else { args.nodes };
        let outside: Vec<&String> = nodes.iter().filter(|n| !access.contains(n)).collect();
        if !outside.is_empty() {
            return Err(EngineError::PolicyViolation(format!(
                "Nodes {:?} cannot access image {}",
                outside,
                self.id()
            )));
        }

        let mut params = args.target_params;
        if params.get("vm_node").is_none() {
            if let Some(node) = nodes.first() {
                params.set("vm_node", node.clone());
            }
        }

        let mut layer = define_layer_config(&self.env, &args.target, &params).await?;
        create_layer_object(&self.env, &mut layer, &nodes).await?;

        if args.backing_chain {
            let top = self.top()?;
            layer.spec.backing = Some(top);
            self.config.meta.topology = self.topology().pushed(&args.target);
            self.config.meta.name = args.target.clone();
        }

        let out = serde_json::to_value(&layer)?;
        self.config.spec.images.insert(args.target.clone(), layer);
        info!(image_id = %self.id(), layer = %args.target, chained = args.backing_chain, "Layer added");

        Ok(out)
    }

    async fn remove(&mut self, args: RemoveArgs) -> Result<Value> {
        let target = args.target;
        let layer = self.layer(&target)?;

        if self.config.spec.images.len() == 1 {
            return Err(EngineError::IllegalTransition(format!(
                "Cannot remove {}, the last layer of image {}",
                target,
                self.id()
            )));
        }

        let in_chain = self.topology().contains(&target);
        if in_chain && !self.topology().is_chain() {
            return Err(EngineError::IllegalTransition(format!(
                "Cannot remove {}, the only layer of image {}",
                target,
                self.id()
            )));
        }
        if in_chain && self.topology().top() != Some(target.as_str()) {
            return Err(EngineError::IllegalTransition(format!(
                "Cannot remove {}, only the top of image {} can be removed",
                target,
                self.id()
            )));
        }
        if layers::is_allocated(&self.env, layer).await? {
            return Err(EngineError::IllegalTransition(format!(
                "Layer {} is still allocated, destroy it first",
                target
            )));
        }

        let env = self.env.clone();
        destroy_layer_object(&env, self.layer_mut(&target)?).await?;
        self.config.spec.images.shift_remove(&target);

        for other in self.config.spec.images.values_mut() {
            if other.spec.backup.as_deref() == Some(target.as_str()) {
                other.spec.backup = None;
            }
        }

        if in_chain {
            self.config.meta.topology = self.topology().popped();
            self.config.meta.name = self.top()?;
        }
        info!(image_id = %self.id(), layer = %target, "Layer removed");

        Ok(Value::Null)
    }

    async fn rebase(&mut self, args: RebaseArgs) -> Result<Value> {
        let target = args.target.clone();
        if self.config.spec.images.contains_key(&target) {
            return Err(EngineError::IllegalTransition(format!(
                "Layer {} already exists in image {}",
                target,
                self.id()
            )));
        }
        let source = self.top()?;

        self.add(AddArgs {
            target: target.clone(),
            target_params: args.target_params,
            backing_chain: false,
            nodes: args.nodes,
        })
        .await?;

        let mut forward = args.extra;
        forward.insert("source".to_string(), json!(source));
        forward.insert("target".to_string(), json!(target));

        let rebased = match self.create(TargetArgs::target(target.clone())).await {
            Ok(_) => self.call_node("rebase", Value::Object(forward)).await,
            Err(e) => Err(e),
        };

        let out = match rebased {
            Ok(out) => out,
            Err(e) => {
                if self.env.settings.recovery == RecoveryStrategy::Rollback {
                    self.drop_layer(&target).await;
                }
                return Err(e);
            }
        };

        self.layer_mut(&target)?.spec.backing = Some(source.clone());
        self.config.meta.topology = self.topology().pushed(&target);
        self.config.meta.name = target.clone();
        info!(image_id = %self.id(), source = %source, target = %target, "Image rebased");

        Ok(out)
    }

    /// Best-effort release and removal of a layer that is not in the chain.
    async fn drop_layer(&mut self, name: &str) {
        let Some(layer) = self.config.spec.images.shift_remove(name) else {
            return;
        };
        if let Some(volume) = layer.spec.volume.as_deref() {
            self.env.resources.discard(volume).await;
        }
        for other in self.config.spec.images.values_mut() {
            if other.spec.backup.as_deref() == Some(name) {
                other.spec.backup = None;
            }
        }
        debug!(image_id = %self.id(), layer = %name, "Layer rolled back");
    }

    fn edit_config(&mut self, args: ConfigArgs) -> Result<Value> {
        if let Some(name) = args.name {
            if name != self.config.meta.name {
                return Err(EngineError::IllegalTransition(format!(
                    "Image {} is named after its top layer {}",
                    self.id(),
                    self.config.meta.name
                )));
            }
        }
        if let Some(owner) = args.owner {
            self.config.meta.owner = if owner.is_empty() { None } else { Some(owner) };
        }
        Ok(serde_json::to_value(&self.config.meta)?)
    }

    async fn backup(&mut self, args: CommandArgs) -> Result<Value> {
        let mut created = Vec::new();
        match self.backup_layers(&mut created, args).await {
            Ok(out) => Ok(out),
            Err(e) => {
                if self.env.settings.recovery == RecoveryStrategy::Rollback {
                    for name in created.iter().rev() {
                        self.drop_layer(name).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Create a backup layer for every chain layer lacking one, then ask the
    /// node to copy the data. `created` collects the new layer names.
    async fn backup_layers(&mut self, created: &mut Vec<String>, args: CommandArgs) -> Result<Value> {
        let primary = self.primary_node().await?;
        let request = Params::new()
            .with("storage_type", "filesystem")
            .with("vm_node", primary.clone());
        let pool_id = self
            .env
            .resources
            .select_pool(ResourceType::Volume, &request)
            .await
            .ok_or_else(|| {
                EngineError::PolicyViolation(format!(
                    "No filesystem pool reachable from {} for backups of image {}",
                    primary,
                    self.id()
                ))
            })?;

        let suffix = format!("backup_{}", random_suffix(self.env.settings.suffix_length));
        let pending: Vec<String> = self
            .topology()
            .names()
            .iter()
            .filter(|n| self.config.spec.images.get(*n).is_some_and(|l| l.spec.backup.is_none()))
            .cloned()
            .collect();

        for name in pending {
            let source = self.layer(&name)?.clone();
            let volume = self
                .env
                .resources
                .create_resource_object_from_with_suffix(layers::volume_of(&source)?, &pool_id, &suffix)
                .await?;
            let backup_name = format!("{}_{}", name, suffix);

            self.config.spec.images.insert(
                backup_name.clone(),
                LayerConfig {
                    meta: LayerMeta {
                        uuid: Some(new_object_id()),
                        name: backup_name.clone(),
                        image_type: ImageType::Qemu,
                    },
                    spec: LayerSpec {
                        format: source.spec.format,
                        backing: None,
                        backup: None,
                        volume: Some(volume.clone()),
                        volume_config: None,
                        cluster_size: None,
                        preallocation: None,
                        secret: source.spec.secret.clone(),
                    },
                },
            );
            self.layer_mut(&name)?.spec.backup = Some(backup_name.clone());
            created.push(backup_name);

            let resources = &self.env.resources;
            resources
                .update_resource_with(&volume, ResourceCommand::Bind(NodeArgs::new([primary.clone()])))
                .await?;
            resources
                .update_resource_with(&volume, ResourceCommand::Allocate(Map::new()))
                .await?;
        }

        let out = self.call_node("backup", Value::Object(args)).await?;
        info!(image_id = %self.id(), pool_id = %pool_id, "Image backed up");
        Ok(out)
    }

    async fn restore(&mut self, args: CommandArgs) -> Result<Value> {
        let has_backup = self
            .topology()
            .names()
            .iter()
            .filter_map(|n| self.config.spec.images.get(n))
            .any(|l| l.spec.backup.is_some());
        if !has_backup {
            return Err(EngineError::IllegalTransition(format!(
                "Image {} has no backups to restore",
                self.id()
            )));
        }

        let out = self.call_node("restore", Value::Object(args)).await?;
        info!(image_id = %self.id(), "Image restored");
        Ok(out)
    }

    /// Copy the chain into `clone`'s layer map. `created` collects the new
    /// volume IDs.
    async fn clone_layers(&self, suffix: &str, created: &mut Vec<String>) -> Result<QemuVirtualImage> {
        let resources = &self.env.resources;
        let names: Vec<String> = self
            .topology()
            .names()
            .iter()
            .map(|n| format!("{}_{}", n, suffix))
            .collect();

        let mut images = IndexMap::new();
        for name in self.topology().names() {
            let source = self.layer(name)?;
            let source_volume = resources.resource_config(layers::volume_of(source)?).await?;
            let pool_id = source_volume.meta.pool.clone().unwrap_or_default();

            let volume = resources
                .create_resource_object_from_with_suffix(source_volume.id(), &pool_id, suffix)
                .await?;
            created.push(volume.clone());
            resources
                .update_resource_with(&volume, ResourceCommand::Bind(NodeArgs::new(source_volume.bound_nodes())))
                .await?;
            resources
                .update_resource_with(&volume, ResourceCommand::Allocate(Map::new()))
                .await?;

            let clone_name = format!("{}_{}", name, suffix);
            let mut spec = source.spec.clone();
            spec.backing = spec.backing.map(|b| format!("{}_{}", b, suffix));
            spec.backup = None;
            spec.volume = Some(volume);
            spec.volume_config = None;

            images.insert(
                clone_name.clone(),
                LayerConfig {
                    meta: LayerMeta {
                        uuid: Some(new_object_id()),
                        name: clone_name,
                        image_type: ImageType::Qemu,
                    },
                    spec,
                },
            );
        }

        let topology = Topology::from_names(names.clone());
        let config = ImageConfig {
            meta: ImageMeta {
                uuid: None,
                name: topology.top().unwrap_or_default().to_string(),
                image_type: ImageType::Qemu,
                owner: self.config.meta.owner.clone(),
                topology,
            },
            spec: ImageSpec { images },
        };
        let clone = QemuVirtualImage::new(config, self.env.clone());

        // Rebuild the backing chain on the node
        for pair in names.windows(2) {
            clone
                .call_node("rebase", json!({ "source": pair[0], "target": pair[1] }))
                .await?;
        }

        Ok(clone)
    }
}

#[async_trait]
impl VirtualImage for QemuVirtualImage {
    fn config(&self) -> &ImageConfig {
        &self.config
    }

    #[instrument(skip(self), fields(image_id = %self.id(), image_name = %self.name()))]
    async fn create_object(&mut self) -> Result<()> {
        let env = self.env.clone();

        let mut failure = None;
        for layer in self.config.spec.images.values_mut() {
            if let Err(e) = create_layer_object(&env, layer, &[]).await {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            // Nothing is allocated yet, dropping the objects is safe
            for layer in self.config.spec.images.values_mut() {
                if let Err(err) = destroy_layer_object(&env, layer).await {
                    warn!(layer = %layer.meta.name, error = %err, "Failed to drop layer object");
                }
            }
            return Err(e);
        }

        info!(layers = self.config.spec.images.len(), "Image object created");
        Ok(())
    }

    #[instrument(skip(self), fields(image_id = %self.id()))]
    async fn destroy_object(&mut self) -> Result<()> {
        for (name, layer) in &self.config.spec.images {
            if layers::is_allocated(&self.env, layer).await? {
                return Err(EngineError::IllegalTransition(format!(
                    "Layer {} of image {} is still allocated",
                    name,
                    self.id()
                )));
            }
        }

        // Top-down through the chain, then the rest (backups)
        let mut order: Vec<String> = self.topology().names().iter().rev().cloned().collect();
        order.extend(
            self.config
                .spec
                .images
                .keys()
                .filter(|n| !self.topology().contains(n))
                .cloned(),
        );

        let env = self.env.clone();
        for name in order {
            destroy_layer_object(&env, self.layer_mut(&name)?).await?;
        }

        info!("Image object destroyed");
        Ok(())
    }

    #[instrument(skip(self, command), fields(image_id = %self.id(), command = command.name()))]
    async fn update(&mut self, command: ImageCommand) -> Result<Value> {
        match command {
            ImageCommand::Create(args) => self.create(args).await,
            ImageCommand::Destroy(args) => self.destroy(args).await,
            ImageCommand::Rebase(args) => self.rebase(args).await,
            ImageCommand::Add(args) => self.add(args).await,
            ImageCommand::Remove(args) => self.remove(args).await,
            ImageCommand::Config(args) => self.edit_config(args),
            ImageCommand::Backup(args) => self.backup(args).await,
            ImageCommand::Restore(args) => self.restore(args).await,
            ImageCommand::Commit(args) => self.call_node("commit", Value::Object(args)).await,
            ImageCommand::Snapshot(args) => self.call_node("snapshot", Value::Object(args)).await,
            ImageCommand::Info(args) => self.call_node("info", Value::Object(args)).await,
            ImageCommand::Check(args) => self.call_node("check", Value::Object(args)).await,
        }
    }

    async fn info(&self, verbose: bool) -> Result<Value> {
        let mut info = serde_json::to_value(&self.config)?;
        if verbose {
            for (name, volume) in self.config.volumes() {
                info["spec"]["images"][name]["spec"]["volume"] =
                    self.env.resources.get_resource_info(volume, None, false).await?;
            }
        }
        Ok(info)
    }

    #[instrument(skip(self), fields(image_id = %self.id()))]
    async fn clone_image(&self) -> Result<Box<dyn VirtualImage>> {
        let suffix = random_suffix(self.env.settings.suffix_length);
        let mut created = Vec::new();

        match self.clone_layers(&suffix, &mut created).await {
            Ok(clone) => {
                info!(clone_id = %clone.id(), clone_name = %clone.name(), "Image cloned");
                Ok(Box::new(clone))
            }
            Err(e) => {
                if self.env.settings.recovery == RecoveryStrategy::Rollback {
                    for volume in &created {
                        self.env.resources.discard(volume).await;
                    }
                }
                Err(e)
            }
        }
    }
}
