//! Resource lifecycle
//!
//! The [`ResourceManager`] drives every per-resource transition: provisioning,
//! mount and unmount, metadata relocation, quarantine, settings edits and
//! filesystem maintenance. Each public operation holds the resource's
//! advisory lock for its whole duration and checks for cancellation between
//! steps; rollback, once started, always runs to completion.
//!
//! ```text
//!                 create                 import
//!   (raw device) ───────► MountedDirect ────────► MountedImported
//!                           │     ▲      ◄────────      │
//!                    umount │     │ mount  export       │ umount
//!                           ▼     │                     ▼
//!                          Unmounted ◄──────────────────┘
//! ```

pub mod listing;
pub mod lock;
pub mod maintenance;
pub mod mount;
pub mod provision;
pub mod relocate;
pub mod rollback;
pub mod sequester;
pub mod settings;
pub mod transient;
mod tree;

pub use lock::RidLock;
pub use maintenance::{DefragReport, FsckReport};
pub use relocate::SNAPSHOT_DIR;
pub use rollback::Rollback;
pub use sequester::{SequesterLedger, SequesterOutcome};
pub use settings::{set_ini_option, IniDocument, OptionScope};
pub use transient::{MetadataAccess, TransientMount};

use crate::config::DepotConfig;
use crate::device::{mounted_rids, DeviceIndex};
use crate::domain::ports::HostPorts;
use crate::domain::{BlockDevice, MountDescriptor, MountState, Rid};
use crate::error::{Error, Result};
use crate::metrics::LifecycleMetrics;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mount descriptor file inside a resource directory
pub const DESCRIPTOR_FILE: &str = "rid.info";

/// Settings file inside the metadata tree
pub const SETTINGS_FILE: &str = "rid.settings";

/// Sequester ledger inside the metadata tree
pub const LEDGER_FILE: &str = "SEQUESTER_STATUS";

/// Import marker inside the metadata tree
pub const IMPORT_MARKER: &str = "import";

// =============================================================================
// Resource Paths
// =============================================================================

/// Filesystem locations of one resource on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePaths {
    /// `<depot>/rid-<RID>`
    pub root: PathBuf,
    /// `<depot>/rid-<RID>/data`
    pub data: PathBuf,
    /// `<depot>/rid-<RID>/md`
    pub md: PathBuf,
    /// `<depot>/rid-<RID>/rid.info`
    pub descriptor: PathBuf,
    /// `<import>/md-<RID>`
    pub default_import: PathBuf,
}

impl ResourcePaths {
    pub fn new(config: &DepotConfig, rid: Rid) -> Self {
        let root = config.depot_dir.join(rid.dir_name());
        Self {
            data: root.join("data"),
            md: root.join("md"),
            descriptor: root.join(DESCRIPTOR_FILE),
            default_import: config.import_dir.join(rid.import_dir_name()),
            root,
        }
    }

    pub fn settings(&self) -> PathBuf {
        self.md.join(SETTINGS_FILE)
    }
}

/// Read the import marker in a metadata tree, if present
pub fn read_import_marker(md_dir: &Path) -> Result<Option<PathBuf>> {
    let marker = md_dir.join(IMPORT_MARKER);
    if !marker.is_file() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&marker)?;
    let target = contents.lines().next().unwrap_or("").trim();
    if target.is_empty() {
        return Err(Error::malformed(
            "import marker",
            format!("{} is empty", marker.display()),
        ));
    }
    Ok(Some(PathBuf::from(target)))
}

// =============================================================================
// Resource Manager
// =============================================================================

/// Drives lifecycle transitions for the resources of one node
pub struct ResourceManager {
    config: Arc<DepotConfig>,
    ports: HostPorts,
    cancel: CancellationToken,
    metrics: Arc<LifecycleMetrics>,
}

impl ResourceManager {
    pub fn new(config: DepotConfig, ports: HostPorts) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            ports,
            cancel: CancellationToken::new(),
            metrics: Arc::new(LifecycleMetrics::new()?),
        })
    }

    /// Use `token` to cancel in-flight operations
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &DepotConfig {
        &self.config
    }

    pub fn ports(&self) -> &HostPorts {
        &self.ports
    }

    pub fn metrics(&self) -> &LifecycleMetrics {
        &self.metrics
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn paths(&self, rid: Rid) -> ResourcePaths {
        ResourcePaths::new(&self.config, rid)
    }

    /// Fresh snapshot of the label index
    pub fn index(&self) -> Result<DeviceIndex> {
        DeviceIndex::scan(&self.config.label_dir)
    }

    /// Mount state derived from the resource directory and its descriptor
    pub fn mount_state(&self, rid: Rid) -> Result<MountState> {
        Ok(match self.read_descriptor_if_present(rid)? {
            Some(descriptor) => descriptor.state(),
            None => MountState::Unmounted,
        })
    }

    pub(crate) async fn lock(&self, rid: Rid) -> Result<RidLock> {
        RidLock::acquire(&self.config.lock_dir, rid, self.config.timeouts.lock()).await
    }

    /// Fail with `Cancelled` once cancellation was requested
    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub(crate) async fn instrumented<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        debug!(operation, %outcome, elapsed = ?started.elapsed(), "Operation finished");
        self.metrics.record(operation, &outcome, started.elapsed());
        if let Ok(rids) = mounted_rids(&self.config.depot_dir) {
            self.metrics.set_mounted(rids.len());
        }
        result
    }

    pub(crate) fn device(&self, rid: Rid) -> Result<BlockDevice> {
        self.index()?
            .device_for(rid)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                rid,
                reason: format!("no {} label", rid.data_label()),
            })
    }

    /// Descriptor of a mounted resource
    ///
    /// `AlreadyInState` when there is no resource directory, `MissingDescriptor`
    /// when the directory exists without `rid.info`.
    pub(crate) fn read_descriptor(&self, rid: Rid) -> Result<MountDescriptor> {
        let paths = self.paths(rid);
        if !paths.root.is_dir() {
            return Err(Error::AlreadyInState {
                rid,
                state: MountState::Unmounted.to_string(),
            });
        }
        self.read_descriptor_if_present(rid)?
            .ok_or(Error::MissingDescriptor {
                rid,
                path: paths.descriptor,
            })
    }

    pub(crate) fn read_descriptor_if_present(&self, rid: Rid) -> Result<Option<MountDescriptor>> {
        let paths = self.paths(rid);
        if !paths.root.is_dir() {
            return Ok(None);
        }
        match fs::read_to_string(&paths.descriptor) {
            Ok(contents) => Ok(Some(contents.parse()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingDescriptor {
                rid,
                path: paths.descriptor,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Hard safety gate: fail with `Busy` if anything is open under `paths`
    pub(crate) async fn ensure_idle(&self, rid: Rid, paths: &[&Path]) -> Result<()> {
        for path in paths {
            if !path.exists() {
                continue;
            }
            let holders = self.ports.open_files.open_files(path).await?;
            if !holders.is_empty() {
                return Err(Error::Busy {
                    rid,
                    path: path.to_path_buf(),
                    holders,
                });
            }
        }
        Ok(())
    }
}
