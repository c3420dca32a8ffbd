//! Simulation errors.

use tessera_mesh::MeshError;

/// Simulation result type
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised while setting up or driving a simulation
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// A node protocol operation failed
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// No node with this name in the harness
    #[error("No such node: {0}")]
    UnknownNode(String),

    /// Scenario references a handler that does not exist
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    /// Scenario file is malformed
    #[error("Invalid scenario: {0}")]
    Scenario(String),

    /// Scenario file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        Self::Scenario(err.to_string())
    }
}
