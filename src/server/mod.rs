//! Storage daemon integration
//!
//! - [`ibp`]: the daemon's attach/detach tools behind [`ServerControl`](crate::domain::ports::ServerControl)
//! - [`merge`]: assembly of the daemon's `ibp.conf`
//! - [`control`]: repair and drive-count reconciliation

pub mod control;
pub mod ibp;
pub mod merge;

pub use control::{ReconcileReport, ServerCoordinator};
pub use ibp::IbpServer;
pub use merge::merge_config;
