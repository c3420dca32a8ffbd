//! Mesh protocol errors.

use tessera_core::{CoreError, ServerId};
use tessera_fabric::FabricError;

/// Mesh result type
pub type MeshResult<T> = Result<T, MeshError>;

/// Failure kinds of the discovery, dispatch and health protocols
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    /// Referenced server is not in the local registry
    #[error("Unknown server: {0}")]
    UnknownServer(ServerId),

    /// No peer satisfies the task's requirements
    #[error("No compatible server for task {task_type:?}")]
    NoCompatibleServer {
        /// Task that could not be placed
        task_type: String,
    },

    /// No task response within the bounded wait
    #[error("Task {task_type:?} on {server} timed out after {timeout_ms}ms")]
    DispatchTimeout {
        /// Task that was dispatched
        task_type: String,
        /// Server it was sent to
        server: ServerId,
        /// Wait that elapsed
        timeout_ms: u64,
    },

    /// A handler failed while executing a task
    #[error("Handler on {server} failed: {message}")]
    HandlerExecution {
        /// Server whose handler failed
        server: ServerId,
        /// Message reported by the handler
        message: String,
    },

    /// Operation is not valid against the node's own descriptor
    #[error("Invalid operation on self: {0}")]
    InvalidSelfOperation(String),

    /// Fabric rejected an operation
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    /// Configuration is invalid
    #[error("Invalid config: {0}")]
    Config(String),
}

/// Coarse classification of a [`MeshError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`MeshError::UnknownServer`]
    UnknownServer,
    /// See [`MeshError::NoCompatibleServer`]
    NoCompatibleServer,
    /// See [`MeshError::DispatchTimeout`]
    DispatchTimeout,
    /// See [`MeshError::HandlerExecution`]
    HandlerExecution,
    /// See [`MeshError::InvalidSelfOperation`]
    InvalidSelfOperation,
    /// See [`MeshError::Fabric`]
    Fabric,
    /// See [`MeshError::Config`]
    Config,
}

impl MeshError {
    /// Kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownServer(_) => ErrorKind::UnknownServer,
            Self::NoCompatibleServer { .. } => ErrorKind::NoCompatibleServer,
            Self::DispatchTimeout { .. } => ErrorKind::DispatchTimeout,
            Self::HandlerExecution { .. } => ErrorKind::HandlerExecution,
            Self::InvalidSelfOperation(_) => ErrorKind::InvalidSelfOperation,
            Self::Fabric(_) => ErrorKind::Fabric,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<CoreError> for MeshError {
    fn from(err: CoreError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let id = ServerId::new("n2").unwrap();
        assert_eq!(
            MeshError::UnknownServer(id.clone()).kind(),
            ErrorKind::UnknownServer
        );
        assert_eq!(
            MeshError::DispatchTimeout {
                task_type: "echo".into(),
                server: id,
                timeout_ms: 50,
            }
            .kind(),
            ErrorKind::DispatchTimeout
        );
    }

    #[test]
    fn test_handler_error_carries_message() {
        let err = MeshError::HandlerExecution {
            server: ServerId::new("n3").unwrap(),
            message: "division by zero".into(),
        };
        let text = err.to_string();
        assert!(text.contains("n3"));
        assert!(text.contains("division by zero"));
    }

    #[test]
    fn test_from_fabric_error() {
        let err: MeshError = FabricError::UnknownNode(ServerId::new("x").unwrap()).into();
        assert_eq!(err.kind(), ErrorKind::Fabric);
    }
}
