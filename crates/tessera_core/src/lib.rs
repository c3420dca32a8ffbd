//! TESSERA.MESH Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything a node advertises about itself lives here: identifiers,
//! feature sets with their compatibility fingerprints, and descriptors.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod descriptor;
pub mod error;
pub mod feature;
pub mod hash;
pub mod id;
pub mod time;

// Re-exports
pub use descriptor::{HealthMetrics, HealthStatus, ServerDescriptor};
pub use error::{CoreError, CoreResult};
pub use feature::{FeatureSet, Fingerprint, ServerRole};
pub use hash::Hash;
pub use id::{CorrelationId, ServerId};
pub use time::Timestamp;
