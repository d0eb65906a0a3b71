//! Domain layer - Core types and port definitions
//!
//! This module defines the resource types shared by every component and the
//! traits (ports) that host adapters implement.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
