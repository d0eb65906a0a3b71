//! Domain Ports - Core trait definitions for the RID manager
//!
//! These traits define the boundaries between the lifecycle logic and the
//! host it runs on. The Linux adapters in [`crate::host`] and
//! [`crate::server`] implement them on top of the shell executor; tests
//! substitute [`crate::testing::FakeHost`].

use crate::domain::types::{BlockDevice, DaemonProcess, Rid};
use crate::error::Result;
use crate::shell::{CommandOutput, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Command Execution
// =============================================================================

/// Port for running external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, bypassing the cache
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command, reusing a cached result younger than `ttl`
    async fn run_cached(&self, spec: &CommandSpec, ttl: Duration) -> Result<CommandOutput>;
}

// =============================================================================
// Mount Table
// =============================================================================

/// One entry of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mounted device (e.g. `/dev/sdb1`)
    pub device: PathBuf,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem type
    pub fs_type: String,
}

/// Port for mounting and querying mounts
#[async_trait]
pub trait MountTable: Send + Sync {
    /// Mount `device` at `target` with comma-separated `options`
    async fn mount(&self, device: &Path, target: &Path, options: &str) -> Result<()>;

    /// Unmount whatever is mounted at `target`
    async fn umount(&self, target: &Path) -> Result<()>;

    /// Current mount table
    async fn entries(&self) -> Result<Vec<MountEntry>>;

    /// Check whether `target` is a mount point
    async fn is_mountpoint(&self, target: &Path) -> Result<bool> {
        Ok(self.entries().await?.iter().any(|e| e.target == target))
    }

    /// Where `device` is mounted, if anywhere
    async fn mountpoint_of(&self, device: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.device == device)
            .map(|e| e.target))
    }

    /// Mounts whose device is a partition of `disk`
    async fn mounts_of_disk(&self, disk: &BlockDevice) -> Result<Vec<MountEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.device != disk.path() && BlockDevice::from_partition(&e.device) == *disk)
            .collect())
    }
}

// =============================================================================
// Open File Probe
// =============================================================================

/// Port for the open-file safety gate (an `lsof` equivalent)
#[async_trait]
pub trait OpenFileProbe: Send + Sync {
    /// Describe every open handle under `path`; empty means idle
    async fn open_files(&self, path: &Path) -> Result<Vec<String>>;
}

// =============================================================================
// Disk Partitioning
// =============================================================================

/// Port for partition table and filesystem creation
#[async_trait]
pub trait DiskPartitioner: Send + Sync {
    /// Check that `device` is a block device
    async fn is_block_device(&self, device: &BlockDevice) -> Result<bool>;

    /// Partition numbers currently on `device`
    async fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<u32>>;

    /// Remove partition `number`
    async fn remove_partition(&self, device: &BlockDevice, number: u32) -> Result<()>;

    /// Write a fresh GPT label
    async fn make_gpt_label(&self, device: &BlockDevice) -> Result<()>;

    /// Create the metadata partition of `md_size_mb` and a data partition
    /// spanning the rest of the device
    async fn create_resource_partitions(&self, device: &BlockDevice, md_size_mb: u64)
        -> Result<()>;

    /// Check whether the kernel exposes `partition`
    async fn partition_exists(&self, partition: &Path) -> Result<bool>;

    /// Format `partition` as ext4 with filesystem `label`
    async fn format_ext4(&self, partition: &Path, label: &str) -> Result<()>;

    /// Whole disks with no partitions and nothing mounted
    async fn blank_disks(&self) -> Result<Vec<BlockDevice>>;
}

// =============================================================================
// Filesystem Maintenance
// =============================================================================

/// Port for filesystem checking and defragmentation
#[async_trait]
pub trait FilesystemTools: Send + Sync {
    /// Check and repair an unmounted filesystem
    async fn check(&self, partition: &Path) -> Result<()>;

    /// Number of extents of `file`
    async fn extents(&self, file: &Path) -> Result<u64>;

    /// Defragment `file`, returning its extent count afterwards
    async fn defragment(&self, file: &Path) -> Result<u64>;
}

// =============================================================================
// Resource Initialization
// =============================================================================

/// Port for the external metadata initializer
#[async_trait]
pub trait ResourceInitializer: Send + Sync {
    /// Initialize a freshly mounted partition pair, returning the settings text
    async fn initialize(&self, rid: Rid, data_dir: &Path, md_dir: &Path) -> Result<String>;
}

// =============================================================================
// Storage Daemon
// =============================================================================

/// Port for running the storage daemon and changing the resources it serves
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// The running daemon, if any
    async fn status(&self) -> Result<Option<DaemonProcess>>;

    /// Start the daemon on `config`, stopping a running instance first
    async fn start(&self, config: &Path) -> Result<DaemonProcess>;

    /// Ask the daemon to quit and wait until it has exited
    ///
    /// Returns the stopped process, or `None` when nothing was running.
    async fn stop(&self) -> Result<Option<DaemonProcess>>;

    /// RIDs the daemon currently serves or has pending
    async fn attached_rids(&self) -> Result<BTreeSet<Rid>>;

    /// Attach a resource
    async fn attach(&self, rid: Rid, message: &str) -> Result<()>;

    /// Detach a resource
    async fn detach(&self, rid: Rid, message: &str) -> Result<()>;
}

// =============================================================================
// Operator Confirmation
// =============================================================================

/// Port for confirming destructive steps
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Confirmation that always agrees (`--yes`)
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _question: &str) -> bool {
        true
    }
}

/// Confirmation that always declines
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&self, _question: &str) -> bool {
        false
    }
}

// =============================================================================
// Port References
// =============================================================================

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
pub type MountTableRef = Arc<dyn MountTable>;
pub type OpenFileProbeRef = Arc<dyn OpenFileProbe>;
pub type DiskPartitionerRef = Arc<dyn DiskPartitioner>;
pub type FilesystemToolsRef = Arc<dyn FilesystemTools>;
pub type ResourceInitializerRef = Arc<dyn ResourceInitializer>;
pub type ServerControlRef = Arc<dyn ServerControl>;

/// The host adapters a resource manager needs
#[derive(Clone)]
pub struct HostPorts {
    pub mounts: MountTableRef,
    pub open_files: OpenFileProbeRef,
    pub disks: DiskPartitionerRef,
    pub filesystems: FilesystemToolsRef,
    pub initializer: ResourceInitializerRef,
}
