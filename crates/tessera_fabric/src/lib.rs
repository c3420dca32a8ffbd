//! TESSERA.MESH Connectivity Fabric
//!
//! An in-process network: nodes register a mailbox, subscribe to topics,
//! and publish envelopes. Every delivery is gated by a connectivity matrix
//! that can be partitioned and healed, so unreachable peers look like
//! silence rather than errors.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fabric;
pub mod topic;

pub use error::{FabricError, FabricResult};
pub use fabric::{ConnectivityFabric, FabricStats};
pub use topic::{mailbox, Envelope, Inbox, Mailbox, Topic};
