//! Device discovery
//!
//! Maps resources to block devices through their filesystem labels.

pub mod index;

pub use index::{is_block_device, mounted_rids, DeviceIndex};
