//! Batch operations
//!
//! Fan-out of lifecycle operations across every resource of a node, and the
//! slot planner used to provision a depot's free RIDs.

pub mod orchestrator;
pub mod slots;

pub use orchestrator::{unit, BatchMode, BatchOrchestrator, BatchReport, BatchUnit};
pub use slots::{depot_number_from_hostname, SlotPlanner};
