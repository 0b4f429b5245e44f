//! Mock node agent for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::Result;
use crate::proxy::{NodeProxy, ProxyReply, IMAGE_SERVICE};

/// One call received by the mock agent.
#[derive(Debug, Clone)]
pub struct ProxyCall {
    pub node: String,
    pub service: String,
    pub method: String,
    /// Image command name for `image.update_image` calls
    pub command: Option<String>,
    pub args: Value,
    pub at: DateTime<Utc>,
}

impl ProxyCall {
    /// Arguments of the image command carried by this call.
    pub fn command_args(&self) -> Option<&Value> {
        let name = self.command.as_deref()?;
        self.args.get("command").and_then(|c| c.get(name))
    }
}

/// Mock agent answering every node in memory.
///
/// Resource allocations report the bound backing as `uri` and the virtual
/// size as `allocation`. Failures can be scripted per method or image
/// command name and stay active until cleared.
pub struct MockProxy {
    calls: RwLock<Vec<ProxyCall>>,
    failures: RwLock<HashMap<String, (i32, String)>>,
    sync_allocation: AtomicU64,
    next_fd: AtomicI32,
}

impl MockProxy {
    /// Create a new mock agent.
    pub fn new() -> Self {
        info!("Creating mock node agent");
        Self {
            calls: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            sync_allocation: AtomicU64::new(0),
            next_fd: AtomicI32::new(10),
        }
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls whose method or image command is `name`.
    pub fn calls_for(&self, name: &str) -> Vec<ProxyCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == name || c.command.as_deref() == Some(name))
            .collect()
    }

    /// Make every call of `name` (a method or image command) fail.
    pub fn fail_method(&self, name: &str, status: i32, message: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(name.to_string(), (status, message.to_string()));
        }
    }

    /// Make the image command `command` fail.
    pub fn fail_image_command(&self, command: &str, status: i32, message: &str) {
        self.fail_method(command, status, message);
    }

    /// Stop failing calls of `name`.
    pub fn clear_failure(&self, name: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.remove(name);
        }
    }

    /// Allocation reported by subsequent `sync` calls.
    pub fn set_sync_allocation(&self, bytes: u64) {
        self.sync_allocation.store(bytes, Ordering::SeqCst);
    }

    fn scripted_failure(&self, method: &str, command: Option<&str>) -> Option<(i32, String)> {
        let failures = self.failures.read().ok()?;
        command
            .and_then(|c| failures.get(c))
            .or_else(|| failures.get(method))
            .cloned()
    }

    fn resource_reply(&self, node: &str, method: &str, args: &Value) -> Value {
        let resource = &args["resource"];
        let is_port = resource["meta"]["type"] == "port";

        match (method, is_port) {
            ("allocate", false) => json!({
                "uri": resource["meta"]["bindings"][node]["backing"],
                "allocation": resource["spec"]["size"],
            }),
            ("allocate", true) => {
                let ifname = match resource["spec"]["ifname"].as_str() {
                    Some(name) => name.to_string(),
                    None => format!("tap-{}", resource["meta"]["name"].as_str().unwrap_or("port")),
                };
                let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
                json!({ "ifname": ifname, "fds": [fd] })
            }
            ("sync", false) => json!({
                "allocation": self.sync_allocation.load(Ordering::SeqCst),
            }),
            ("sync", true) => json!({ "ifname": resource["spec"]["ifname"] }),
            _ => Value::Null,
        }
    }

    fn image_reply(command: Option<&str>, args: &Value) -> Value {
        let image = &args["image"];
        match command {
            Some("info") => json!({
                "image": image["meta"]["name"],
                "topology": image["meta"]["topology"],
            }),
            Some("check") => json!("No errors were found on the image."),
            _ => Value::Null,
        }
    }
}

impl Default for MockProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeProxy for MockProxy {
    async fn call(&self, node: &str, service: &str, method: &str, args: Value) -> Result<ProxyReply> {
        let command = if service == IMAGE_SERVICE {
            args.get("command")
                .and_then(Value::as_object)
                .and_then(|c| c.keys().next().cloned())
        } else {
            None
        };

        debug!(node = %node, service = %service, method = %method, command = ?command, "Mock agent call");

        if let Ok(mut calls) = self.calls.write() {
            calls.push(ProxyCall {
                node: node.to_string(),
                service: service.to_string(),
                method: method.to_string(),
                command: command.clone(),
                args: args.clone(),
                at: Utc::now(),
            });
        }

        if let Some((status, message)) = self.scripted_failure(method, command.as_deref()) {
            return Ok(ProxyReply::failed(status, message));
        }

        let out = if service == IMAGE_SERVICE {
            Self::image_reply(command.as_deref(), &args)
        } else {
            self.resource_reply(node, method, &args)
        };

        Ok(ProxyReply::ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{RESOURCE_SERVICE, UPDATE_IMAGE};

    #[tokio::test]
    async fn test_allocate_reports_backing_and_size() {
        let proxy = MockProxy::new();
        let args = json!({
            "resource": {
                "meta": {"type": "volume", "bindings": {"host1": {"backing": "/pool/a.qcow2"}}},
                "spec": {"size": 1024}
            },
            "pool": {},
            "arguments": {}
        });

        let out = proxy.call("host1", RESOURCE_SERVICE, "allocate", args).await.unwrap().out();
        assert_eq!(out["uri"], "/pool/a.qcow2");
        assert_eq!(out["allocation"], 1024);
        assert_eq!(proxy.calls_for("allocate").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_image_failure() {
        let proxy = MockProxy::new();
        proxy.fail_image_command("create", 1, "disk full");
        let args = json!({"image": {}, "command": {"create": {}}});

        let reply = proxy.call("host1", IMAGE_SERVICE, UPDATE_IMAGE, args.clone()).await.unwrap();
        assert_eq!(reply.status, 1);
        assert_eq!(reply.out(), json!("disk full"));

        proxy.clear_failure("create");
        let reply = proxy.call("host1", IMAGE_SERVICE, UPDATE_IMAGE, args).await.unwrap();
        assert_eq!(reply.status, 0);

        let calls = proxy.calls_for("create");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command_args(), Some(&json!({})));
    }
}
