//! Resource trait definition.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::pool::PoolConfig;
use crate::proxy::{self, NodeProxy, RESOURCE_SERVICE};
use super::command::{CommandArgs, NodeArgs, ResizeArgs, ResourceCommand};
use super::types::{Binding, ResourceConfig, ResourceType, VolumeKind};

/// What a resource handler may see of its surroundings.
pub struct ResourceContext<'a> {
    /// Configuration of the owning pool
    pub pool: &'a PoolConfig,
    /// Path to the node agents
    pub proxy: &'a dyn NodeProxy,
}

/// Constructor table entry for one resource implementation.
pub struct ResourceClass {
    /// Resource type this class implements
    pub resource_type: ResourceType,
    /// Volume backing, for volume classes
    pub volume_kind: Option<VolumeKind>,
    /// Build a configuration from parameters
    pub define: fn(&str, &Params) -> Result<ResourceConfig>,
    /// Convert a configuration produced by another class of the same
    /// resource type (clone/backup into a different kind of pool)
    pub adopt: fn(ResourceConfig) -> ResourceConfig,
    /// Instantiate the resource object
    pub build: fn(ResourceConfig) -> Box<dyn Resource>,
}

/// A resource defines what users request. It can be bound to backings on
/// several worker nodes, but to only one backing per node.
///
/// Implementations provide the type-specific hooks; the lifecycle handlers
/// (`bind`, `unbind`, `allocate`, `release`, `sync`) have shared default
/// implementations driven by those hooks.
#[async_trait]
pub trait Resource: Send + Sync {
    /// The resource document.
    fn config(&self) -> &ResourceConfig;

    /// Mutable access to the resource document.
    fn config_mut(&mut self) -> &mut ResourceConfig;

    /// A renamed, unallocated, unbound copy of this resource's configuration
    /// to be created in `pool_id`.
    fn define_config_from(&self, pool_id: &str, suffix: &str) -> ResourceConfig;

    /// The node-local backing used when binding to `node`.
    fn backing_for(&self, pool: &PoolConfig, node: &str) -> Result<String>;

    /// Record what the node reported after allocation.
    fn apply_allocation(&mut self, out: &Value);

    /// Forget allocation details after release.
    fn clear_allocation(&mut self);

    /// Record what the node reported on sync.
    fn apply_sync(&mut self, out: &Value);

    /// Whether this resource handles `command` (the update handler lookup).
    fn supports(&self, command: &ResourceCommand) -> bool {
        !matches!(command, ResourceCommand::Resize(_))
    }

    /// Hook run when the object is registered in its pool.
    fn create_object(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hook run when the object is removed from its pool.
    fn destroy_object(&mut self) -> Result<()> {
        Ok(())
    }

    fn id(&self) -> &str {
        self.config().id()
    }

    fn name(&self) -> &str {
        &self.config().meta.name
    }

    fn resource_type(&self) -> ResourceType {
        self.config().meta.resource_type
    }

    fn is_allocated(&self) -> bool {
        self.config().meta.allocated
    }

    /// Dispatch a command to its handler.
    async fn handle(&mut self, ctx: &ResourceContext<'_>, command: ResourceCommand) -> Result<Value> {
        if !self.supports(&command) {
            return Err(EngineError::UnsupportedCommand {
                command: command.name().to_string(),
                target: format!("resource {}", self.id()),
            });
        }

        match command {
            ResourceCommand::Bind(args) => self.bind(ctx, args).await,
            ResourceCommand::Unbind(args) => self.unbind(ctx, args).await,
            ResourceCommand::Allocate(args) => self.allocate(ctx, args).await,
            ResourceCommand::Release(args) => self.release(ctx, args).await,
            ResourceCommand::Sync(args) => self.sync(ctx, args).await,
            ResourceCommand::Resize(args) => self.resize(ctx, args).await,
        }
    }

    /// Bind the resource to one or more worker nodes.
    async fn bind(&mut self, ctx: &ResourceContext<'_>, args: NodeArgs) -> Result<Value> {
        let nodes = if args.nodes.is_empty() {
            ctx.pool.access_nodes().to_vec()
        } else {
            args.nodes
        };

        // Resolve every backing before touching the bindings
        let mut new_bindings = Vec::new();
        for node in nodes {
            if self.config().meta.bindings.contains_key(&node) {
                debug!(resource_id = %self.id(), node = %node, "Already bound, keeping binding");
                continue;
            }
            let backing = self.backing_for(ctx.pool, &node)?;
            new_bindings.push((node, Binding { backing }));
        }

        let id = self.id().to_string();
        let bindings = &mut self.config_mut().meta.bindings;
        for (node, binding) in new_bindings {
            info!(resource_id = %id, node = %node, backing = %binding.backing, "Resource bound");
            bindings.insert(node, binding);
        }

        Ok(json!(self.config().bound_nodes()))
    }

    /// Remove node bindings.
    async fn unbind(&mut self, _ctx: &ResourceContext<'_>, args: NodeArgs) -> Result<Value> {
        let bound = self.config().bound_nodes();
        let nodes: Vec<String> = if args.nodes.is_empty() {
            bound.clone()
        } else {
            args.nodes.into_iter().filter(|n| bound.contains(n)).collect()
        };

        if self.is_allocated() && nodes.len() == bound.len() && !bound.is_empty() {
            return Err(EngineError::IllegalTransition(format!(
                "Resource {} is still allocated, release it before unbinding its last node",
                self.id()
            )));
        }

        let id = self.id().to_string();
        let bindings = &mut self.config_mut().meta.bindings;
        for node in nodes {
            bindings.remove(&node);
            info!(resource_id = %id, node = %node, "Resource unbound");
        }

        Ok(json!(self.config().bound_nodes()))
    }

    /// Materialize the backing storage through the first bound node.
    async fn allocate(&mut self, ctx: &ResourceContext<'_>, args: CommandArgs) -> Result<Value> {
        if self.is_allocated() {
            debug!(resource_id = %self.id(), "Resource already allocated");
            return Ok(serde_json::to_value(&self.config().spec)?);
        }

        let node = self.first_bound_node("allocated")?;
        let out = self.call_node(ctx, &node, "allocate", args).await?;

        self.apply_allocation(&out);
        self.config_mut().meta.allocated = true;
        info!(resource_id = %self.id(), node = %node, "Resource allocated");

        Ok(serde_json::to_value(&self.config().spec)?)
    }

    /// Free the backing storage; bindings stay.
    async fn release(&mut self, ctx: &ResourceContext<'_>, args: CommandArgs) -> Result<Value> {
        if !self.is_allocated() {
            debug!(resource_id = %self.id(), "Resource not allocated, nothing to release");
            return Ok(Value::Null);
        }

        let node = self.first_bound_node("released")?;
        self.call_node(ctx, &node, "release", args).await?;

        self.clear_allocation();
        self.config_mut().meta.allocated = false;
        info!(resource_id = %self.id(), node = %node, "Resource released");

        Ok(Value::Null)
    }

    /// Refresh the spec from the authoritative node state.
    async fn sync(&mut self, ctx: &ResourceContext<'_>, args: CommandArgs) -> Result<Value> {
        let node = self.first_bound_node("synced")?;
        let out = self.call_node(ctx, &node, "sync", args).await?;
        self.apply_sync(&out);
        debug!(resource_id = %self.id(), node = %node, "Resource synced");

        Ok(serde_json::to_value(&self.config().spec)?)
    }

    /// Grow the resource. Only some implementations support it.
    async fn resize(&mut self, _ctx: &ResourceContext<'_>, _args: ResizeArgs) -> Result<Value> {
        Err(EngineError::UnsupportedCommand {
            command: "resize".to_string(),
            target: format!("resource {}", self.id()),
        })
    }

    /// The node used for node-side operations.
    fn first_bound_node(&self, action: &str) -> Result<String> {
        self.config().meta.bindings.keys().next().cloned().ok_or_else(|| {
            EngineError::IllegalTransition(format!(
                "Resource {} is not bound to any node and cannot be {}",
                self.id(),
                action
            ))
        })
    }

    /// Forward `method` to the resource service on `node`.
    async fn call_node(
        &self,
        ctx: &ResourceContext<'_>,
        node: &str,
        method: &str,
        args: CommandArgs,
    ) -> Result<Value> {
        let request = json!({
            "resource": serde_json::to_value(self.config())?,
            "pool": serde_json::to_value(ctx.pool)?,
            "arguments": args,
        });
        proxy::invoke(ctx.proxy, node, RESOURCE_SERVICE, method, request).await
    }
}

/// Assign a fresh object ID.
pub(crate) fn new_object_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Random lowercase alphanumeric suffix for clone/backup names.
pub(crate) fn random_suffix(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}
