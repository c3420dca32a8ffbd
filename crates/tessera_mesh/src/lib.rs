//! TESSERA.MESH Node Protocols
//!
//! Discovery, task dispatch and health monitoring for servers sharing a
//! [`tessera_fabric::ConnectivityFabric`]. Each [`MeshNode`] keeps its own
//! [`LocalRegistry`] of peers and talks to them only through fabric
//! messages, so a partition looks like silence rather than an error.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod message;
pub mod node;
mod pending;
pub mod registry;

pub use config::NodeConfig;
pub use discovery::{DiscoveryQuery, DiscoveryResult};
pub use dispatch::{DispatchOptions, DispatchPhase, HandlerError, TaskHandler, TaskOutcome};
pub use error::{ErrorKind, MeshError, MeshResult};
pub use health::{HealthReport, HealthSource};
pub use message::{topics, MeshFabric, Message, TaskRequest, TaskResponse, TaskResult};
pub use node::MeshNode;
pub use registry::{LocalRegistry, MeshStats, Registration};
