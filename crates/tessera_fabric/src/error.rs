//! Fabric errors.

use tessera_core::ServerId;

/// Fabric result type
pub type FabricResult<T> = Result<T, FabricError>;

/// Fabric errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FabricError {
    /// Node is not registered
    #[error("Node not registered: {0}")]
    UnknownNode(ServerId),

    /// Node id already in use
    #[error("Node already registered: {0}")]
    AlreadyRegistered(ServerId),

    /// A link from a node to itself was requested
    #[error("Self link is not a connection: {0}")]
    SelfLink(ServerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_error_display() {
        let id = ServerId::new("n1").unwrap();
        assert_eq!(
            FabricError::UnknownNode(id.clone()).to_string(),
            "Node not registered: n1"
        );
        assert!(FabricError::SelfLink(id).to_string().contains("n1"));
    }
}
