//! Multi-agent workflow orchestration.
//!
//! The [`Orchestrator`] owns every agent record and the active workflow.
//! Agents run on sessions opened through the external
//! [`SessionApi`](crate::session::SessionApi); the orchestrator gates their
//! concurrency, waits on their dependencies, groups them into phases with
//! approval gates, and recovers them after failures.

pub mod approval;
pub mod dependencies;
pub mod inflight;
pub mod lifecycle;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod slots;
pub mod snapshot;
pub mod timers;
pub mod types;
pub mod workflow;

pub use orchestrator::{Orchestrator, OrchestratorEvent};
pub use recovery::{ErrorClass, ErrorCode};
pub use snapshot::Snapshot;
