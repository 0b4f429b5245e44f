//! Resource update commands.
//!
//! Commands travel as single-entry maps, `{"<command>": {<arguments>}}`,
//! which is exactly serde's externally tagged enum representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::params::normalize_size;

/// Free-form arguments forwarded to the node agent.
pub type CommandArgs = Map<String, Value>;

/// Arguments naming target nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeArgs {
    /// Node names; empty means "every node the pool can reach"
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl NodeArgs {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { nodes: nodes.into_iter().map(Into::into).collect() }
    }
}

/// A size given either in bytes or as a human string (`"30G"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeArg {
    Bytes(u64),
    Human(String),
}

impl SizeArg {
    pub fn to_bytes(&self) -> Result<u64> {
        match self {
            SizeArg::Bytes(b) => Ok(*b),
            SizeArg::Human(s) => normalize_size(s),
        }
    }
}

/// Arguments of `resize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub size: SizeArg,
}

/// Lifecycle command for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCommand {
    /// Bind the resource to one or more nodes
    Bind(NodeArgs),
    /// Remove node bindings
    Unbind(NodeArgs),
    /// Materialize the backing storage
    Allocate(CommandArgs),
    /// Free the backing storage
    Release(CommandArgs),
    /// Refresh the spec from the node
    Sync(CommandArgs),
    /// Grow a file volume
    Resize(ResizeArgs),
}

const COMMANDS: &[&str] = &["bind", "unbind", "allocate", "release", "sync", "resize"];

impl ResourceCommand {
    /// Command name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceCommand::Bind(_) => "bind",
            ResourceCommand::Unbind(_) => "unbind",
            ResourceCommand::Allocate(_) => "allocate",
            ResourceCommand::Release(_) => "release",
            ResourceCommand::Sync(_) => "sync",
            ResourceCommand::Resize(_) => "resize",
        }
    }

    /// Node names this command targets, if any.
    pub fn nodes(&self) -> Vec<String> {
        match self {
            ResourceCommand::Bind(a) | ResourceCommand::Unbind(a) => a.nodes.clone(),
            ResourceCommand::Allocate(a) | ResourceCommand::Release(a) | ResourceCommand::Sync(a) => {
                nodes_in(a)
            }
            ResourceCommand::Resize(_) => Vec::new(),
        }
    }

    /// Parse a `{"<command>": {<arguments>}}` request.
    pub fn from_request(request: Value) -> Result<Self> {
        let (name, args) = split_request(request)?;
        if !COMMANDS.contains(&name.as_str()) {
            return Err(EngineError::UnsupportedCommand {
                command: name,
                target: "resource".to_string(),
            });
        }

        let mut map = Map::new();
        map.insert(name.clone(), args);
        serde_json::from_value(Value::Object(map)).map_err(|e| {
            EngineError::InvalidRequest(format!("Bad arguments for {}: {}", name, e))
        })
    }
}

/// Split a single-command request map into its name and arguments.
///
/// `null` arguments are treated as an empty map.
pub(crate) fn split_request(request: Value) -> Result<(String, Value)> {
    let Value::Object(map) = request else {
        return Err(EngineError::InvalidRequest(
            "Command request must be a {command: arguments} map".to_string(),
        ));
    };
    if map.len() != 1 {
        return Err(EngineError::InvalidRequest(format!(
            "Command request must hold exactly one command, got {}",
            map.len()
        )));
    }

    let (name, args) = map.into_iter().next().ok_or_else(|| {
        EngineError::Internal("Command map unexpectedly empty".to_string())
    })?;
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    Ok((name, args))
}

/// Node names under a free-form `nodes` argument.
pub(crate) fn nodes_in(args: &CommandArgs) -> Vec<String> {
    args.get("nodes")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bind() {
        let cmd = ResourceCommand::from_request(json!({"bind": {"nodes": ["host1"]}})).unwrap();
        assert_eq!(cmd, ResourceCommand::Bind(NodeArgs::new(["host1"])));
        assert_eq!(cmd.nodes(), vec!["host1".to_string()]);
        assert_eq!(cmd.name(), "bind");
    }

    #[test]
    fn test_parse_null_and_empty_arguments() {
        let cmd = ResourceCommand::from_request(json!({"release": null})).unwrap();
        assert!(matches!(cmd, ResourceCommand::Release(ref a) if a.is_empty()));

        let cmd = ResourceCommand::from_request(json!({"unbind": {}})).unwrap();
        assert_eq!(cmd, ResourceCommand::Unbind(NodeArgs::default()));
    }

    #[test]
    fn test_parse_resize_sizes() {
        let cmd = ResourceCommand::from_request(json!({"resize": {"size": "2G"}})).unwrap();
        let ResourceCommand::Resize(args) = cmd else { panic!("expected resize") };
        assert_eq!(args.size.to_bytes().unwrap(), 2 * 1024 * 1024 * 1024);

        let cmd = ResourceCommand::from_request(json!({"resize": {"size": 4096}})).unwrap();
        let ResourceCommand::Resize(args) = cmd else { panic!("expected resize") };
        assert_eq!(args.size.to_bytes().unwrap(), 4096);
    }

    #[test]
    fn test_unknown_and_malformed_requests() {
        let err = ResourceCommand::from_request(json!({"explode": {}})).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCommand { .. }));

        let err = ResourceCommand::from_request(json!({"bind": {}, "unbind": {}})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let err = ResourceCommand::from_request(json!("bind")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let err = ResourceCommand::from_request(json!({"bind": {"nodes": "host1"}})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn test_free_form_nodes() {
        let cmd = ResourceCommand::from_request(json!({"allocate": {"nodes": ["a", "b"]}})).unwrap();
        assert_eq!(cmd.nodes(), vec!["a".to_string(), "b".to_string()]);
    }
}
