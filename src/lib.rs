//! RID Manager - Depot Resource Lifecycle
//!
//! Manages the storage resources (RIDs) of a depot node. Each resource is a
//! whole disk with an ext4 metadata partition and an ext4 data partition,
//! identified by its filesystem labels and mounted under `/depot/rid-<RID>`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                ridctl (CLI)                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐                    ┌─────────────────────────────┐  │
//! │  │  Batch Orchestrator │                    │     Server Coordinator      │  │
//! │  │ (JoinSet+Semaphore) │                    │ (repair / reconcile / merge)│  │
//! │  └──────────┬──────────┘                    └──────────────┬──────────────┘  │
//! │             └──────────────────┬───────────────────────────┘                 │
//! │                   ┌────────────┴────────────┐                                │
//! │                   │     Resource Manager    │  per-RID flock, cancellation,  │
//! │                   │ create · mount · umount │  rollback, metrics             │
//! │                   │ import · export · fsck  │                                │
//! │                   │ sequester · settings    │                                │
//! │                   └────────────┬────────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                        Host Ports (traits)                                   │
//! │  MountTable · OpenFileProbe · DiskPartitioner · FilesystemTools · ...        │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ┌─────────────────────┐  ┌────┴────────────────┐  ┌─────────────────────┐   │
//! │  │     LinuxHost       │  │   Shell Executor    │  │    Device Index     │   │
//! │  │ mount/parted/mkfs…  │──│ timeouts + cache    │  │  /dev/disk/by-label │   │
//! │  └─────────────────────┘  └─────────────────────┘  └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`lifecycle`]: Per-resource operations and their state machine
//! - [`batch`]: Concurrent fan-out and empty-slot planning
//! - [`server`]: Storage daemon start/stop, attach/detach, repair, reconciliation
//! - [`host`]: Linux implementations of the host ports
//! - [`shell`]: External command execution with timeouts and caching
//! - [`device`]: RID <-> block device index
//! - [`domain`]: Core domain types and traits
//! - [`config`]: Depot configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling
//! - [`testing`]: In-process fakes of the host ports

pub mod batch;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod server;
pub mod shell;
pub mod testing;

// Re-export commonly used types
pub use batch::{BatchMode, BatchOrchestrator, BatchReport, SlotPlanner};

pub use config::DepotConfig;

pub use device::DeviceIndex;

pub use domain::ports::{
    AssumeNo, AssumeYes, CommandRunner, Confirm, DiskPartitioner, FilesystemTools, HostPorts,
    MountTable, OpenFileProbe, ResourceInitializer, ServerControl,
};
pub use domain::{
    BlockDevice, DaemonProcess, LedgerEntry, LedgerStatus, MountDescriptor, MountState,
    ResourceSummary, Rid, SequesterState,
};

pub use error::{Error, ErrorKind, Result};

pub use host::LinuxHost;

pub use lifecycle::{OptionScope, ResourceManager, SequesterOutcome};

pub use server::{IbpServer, ReconcileReport, ServerCoordinator};

pub use shell::{CommandCache, ShellExecutor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
