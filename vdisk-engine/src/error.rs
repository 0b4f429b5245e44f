//! Error types for the lifecycle engine.

use thiserror::Error;

/// Broad classes of failure, stable enough for callers to build retry or
/// backoff policy on without matching diagnostic strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    IllegalTransition,
    PolicyViolation,
    RemoteFailure,
    TypeMismatch,
    InvalidRequest,
    Internal,
}

/// Errors that can occur during resource, pool and image operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A pool was not found.
    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    /// A resource was not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A virtual image was not found.
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// A lower-level image (layer) was not found in its virtual image.
    #[error("Layer {layer} not found in image {image}")]
    LayerNotFound { image: String, layer: String },

    /// A node tag could not be resolved to a cluster node.
    #[error("Node not found for tag: {0}")]
    NodeNotFound(String),

    /// A dot-separated info request named a path that does not exist.
    #[error("Invalid query path: {0}")]
    QueryPathNotFound(String),

    /// The operation violates a lifecycle or topology invariant.
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    /// A node set or pool policy forbids the request.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// The per-node agent returned a non-zero status.
    #[error("{message}")]
    RemoteFailure {
        node: String,
        status: i32,
        message: String,
    },

    /// The destination pool does not support the resource type.
    #[error("The {resource_type} type resource is not supported by pool {pool_id}")]
    TypeMismatch {
        resource_type: String,
        pool_id: String,
    },

    /// The command name is not handled by the target object.
    #[error("Unsupported command {command} for {target}")]
    UnsupportedCommand { command: String, target: String },

    /// Malformed request, parameter or configuration.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::PoolNotFound(_)
            | EngineError::ResourceNotFound(_)
            | EngineError::ImageNotFound(_)
            | EngineError::LayerNotFound { .. }
            | EngineError::NodeNotFound(_)
            | EngineError::QueryPathNotFound(_) => ErrorCategory::NotFound,
            EngineError::IllegalTransition(_) => ErrorCategory::IllegalTransition,
            EngineError::PolicyViolation(_) => ErrorCategory::PolicyViolation,
            EngineError::RemoteFailure { .. } => ErrorCategory::RemoteFailure,
            EngineError::TypeMismatch { .. } => ErrorCategory::TypeMismatch,
            EngineError::UnsupportedCommand { .. } | EngineError::InvalidRequest(_) => {
                ErrorCategory::InvalidRequest
            }
            EngineError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// The diagnostic text reported by the node agent, if this is a remote failure.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            EngineError::RemoteFailure { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("Document serialization failed: {}", e))
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
