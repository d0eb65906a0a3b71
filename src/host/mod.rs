//! Host adapters
//!
//! Production implementations of the host ports, all running through a
//! [`CommandRunner`](crate::domain::ports::CommandRunner).

pub mod linux;

pub use linux::LinuxHost;
