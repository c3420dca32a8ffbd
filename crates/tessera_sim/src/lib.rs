//! TESSERA mesh simulation
//!
//! Runs many mesh nodes on one in-process fabric, drives them through
//! partitions and heals, and records what each step observed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handlers;
pub mod harness;
pub mod record;
pub mod scenario;

pub use error::{SimError, SimResult};
pub use handlers::{builtin, BUILTIN_HANDLERS};
pub use harness::{MeshHarness, DEFAULT_SETTLE_MS};
pub use record::{ScenarioReport, StepRecord};
pub use scenario::{Expect, Scenario, ScenarioNode, ScenarioStep, Step, DEMO_NODES};
