//! Boundary to the per-node execution agent.
//!
//! Every storage-affecting operation is forwarded to the agent running on a
//! worker node. The transport is opaque to the engine: a call either returns a
//! status code with a result document, or fails to reach the node at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use vdisk_common::TimedOperation;

use crate::error::{EngineError, Result};

/// Service handling resource backings on a node.
pub const RESOURCE_SERVICE: &str = "resource";
/// Service handling storage-format (qemu-img style) operations on a node.
pub const IMAGE_SERVICE: &str = "image";
/// The single method exposed by the image service.
pub const UPDATE_IMAGE: &str = "update_image";

/// Raw reply of a proxied call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyReply {
    /// 0 on success
    pub status: i32,
    /// Result document; on failure `out` carries the diagnostic text
    pub result: Value,
}

impl ProxyReply {
    /// A successful reply whose `out` is `out`.
    pub fn ok(out: Value) -> Self {
        Self {
            status: 0,
            result: serde_json::json!({ "out": out }),
        }
    }

    /// A failed reply carrying a diagnostic.
    pub fn failed(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            result: serde_json::json!({ "out": message.into() }),
        }
    }

    /// The `out` member of the result document.
    pub fn out(&self) -> Value {
        self.result.get("out").cloned().unwrap_or(Value::Null)
    }

    /// Convert into the `out` document, or a [`EngineError::RemoteFailure`].
    pub fn into_result(self, node: &str) -> Result<Value> {
        if self.status == 0 {
            return Ok(self.out());
        }

        let message = match self.out() {
            Value::String(s) => s,
            Value::Null => format!("remote call failed with status {}", self.status),
            other => other.to_string(),
        };
        warn!(node = %node, status = self.status, error = %message, "Remote call failed");

        Err(EngineError::RemoteFailure {
            node: node.to_string(),
            status: self.status,
            message,
        })
    }
}

/// Synchronous request/response call to a named node.
#[async_trait]
pub trait NodeProxy: Send + Sync {
    /// Invoke `service.method(args)` on `node`.
    ///
    /// `Err` means the call could not be delivered; agent-side failures are
    /// reported through a non-zero [`ProxyReply::status`].
    async fn call(&self, node: &str, service: &str, method: &str, args: Value) -> Result<ProxyReply>;
}

/// Call a node and map non-zero status to a remote failure.
pub(crate) async fn invoke(
    proxy: &dyn NodeProxy,
    node: &str,
    service: &str,
    method: &str,
    args: Value,
) -> Result<Value> {
    debug!(node = %node, service = %service, method = %method, "Calling node agent");
    let op = TimedOperation::start(format!("{}.{}@{}", service, method, node));
    let reply = proxy.call(node, service, method, args).await?;
    op.finish();
    reply.into_result(node)
}
