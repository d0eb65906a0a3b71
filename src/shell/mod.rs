//! Shell execution
//!
//! External command runner with bounded timeouts and an injected result cache.

pub mod cache;
pub mod executor;

pub use cache::CommandCache;
pub use executor::{CommandClass, CommandOutput, CommandSpec, ShellExecutor};
