//! Virtual image update commands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::resource::{split_request, CommandArgs};

/// Arguments of `create` and `destroy`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetArgs {
    /// Layer to act on; every layer when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Forwarded to the node agent
    #[serde(flatten)]
    pub extra: CommandArgs,
}

impl TargetArgs {
    pub fn target(name: impl Into<String>) -> Self {
        Self { target: Some(name.into()), extra: Map::new() }
    }
}

/// Arguments of `add`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddArgs {
    /// Name of the new layer
    pub target: String,
    /// Parameters defining the new layer
    #[serde(default)]
    pub target_params: Params,
    /// Put the new layer on top of the chain
    #[serde(default, alias = "backingChain")]
    pub backing_chain: bool,
    /// Nodes to bind the layer's volume to; the image's nodes when empty
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Arguments of `remove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveArgs {
    pub target: String,
}

/// Arguments of `rebase`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebaseArgs {
    /// Name of the new top layer
    pub target: String,
    #[serde(default)]
    pub target_params: Params,
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Forwarded to the node agent
    #[serde(flatten)]
    pub extra: CommandArgs,
}

/// Arguments of `config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigArgs {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Update command for a virtual image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCommand {
    /// Create storage for the image or one layer
    Create(TargetArgs),
    /// Release storage of the image or one layer
    Destroy(TargetArgs),
    /// Put a new top layer over the current one
    Rebase(RebaseArgs),
    /// Merge the top into its backing
    Commit(CommandArgs),
    /// Internal snapshot operations
    Snapshot(CommandArgs),
    /// Add a layer object
    Add(AddArgs),
    /// Remove a layer object
    Remove(RemoveArgs),
    /// Report node side image information
    Info(CommandArgs),
    /// Check consistency
    Check(CommandArgs),
    /// Edit meta options
    Config(ConfigArgs),
    /// Copy every chain layer to a backup layer
    Backup(CommandArgs),
    /// Copy the backup layers back
    Restore(CommandArgs),
}

const COMMANDS: &[&str] = &[
    "create", "destroy", "rebase", "commit", "snapshot", "add", "remove", "info", "check",
    "config", "backup", "restore",
];

impl ImageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ImageCommand::Create(_) => "create",
            ImageCommand::Destroy(_) => "destroy",
            ImageCommand::Rebase(_) => "rebase",
            ImageCommand::Commit(_) => "commit",
            ImageCommand::Snapshot(_) => "snapshot",
            ImageCommand::Add(_) => "add",
            ImageCommand::Remove(_) => "remove",
            ImageCommand::Info(_) => "info",
            ImageCommand::Check(_) => "check",
            ImageCommand::Config(_) => "config",
            ImageCommand::Backup(_) => "backup",
            ImageCommand::Restore(_) => "restore",
        }
    }

    /// Target nodes named by the command.
    pub fn nodes_mut(&mut self) -> Option<&mut Vec<String>> {
        match self {
            ImageCommand::Add(args) => Some(&mut args.nodes),
            ImageCommand::Rebase(args) => Some(&mut args.nodes),
            _ => None,
        }
    }

    /// Parse a `{"<command>": {<arguments>}}` request.
    pub fn from_request(request: Value) -> Result<Self> {
        let (name, args) = split_request(request)?;
        if !COMMANDS.contains(&name.as_str()) {
            return Err(EngineError::UnsupportedCommand {
                command: name,
                target: "image".to_string(),
            });
        }

        let mut map = Map::new();
        map.insert(name.clone(), args);
        serde_json::from_value(Value::Object(map)).map_err(|e| {
            EngineError::InvalidRequest(format!("Bad arguments for {}: {}", name, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_add_with_legacy_chain_flag() {
        let cmd = ImageCommand::from_request(json!({
            "add": {"target": "sn", "backingChain": true, "target_params": {"image_format": "qcow2"}}
        }))
        .unwrap();

        match cmd {
            ImageCommand::Add(args) => {
                assert_eq!(args.target, "sn");
                assert!(args.backing_chain);
                assert_eq!(args.target_params.get("image_format"), Some("qcow2"));
                assert!(args.nodes.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_create_keeps_forwarded_arguments() {
        let cmd = ImageCommand::from_request(json!({"create": {"target": "sn", "cache": "none"}})).unwrap();
        let ImageCommand::Create(args) = cmd else {
            panic!("expected create");
        };
        assert_eq!(args.target.as_deref(), Some("sn"));
        assert_eq!(args.extra["cache"], "none");
        assert_eq!(serde_json::to_value(&args).unwrap(), json!({"target": "sn", "cache": "none"}));
    }

    #[test]
    fn test_parse_errors() {
        let err = ImageCommand::from_request(json!({"resize": {}})).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCommand { .. }));

        let err = ImageCommand::from_request(json!({"remove": {}})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let cmd = ImageCommand::from_request(json!({"info": null})).unwrap();
        assert_eq!(cmd.name(), "info");
    }
}
