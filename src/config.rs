//! Depot configuration
//!
//! Every path and tunable used by the lifecycle components. Defaults match a
//! production depot node; a YAML file can override any subset of fields.

use crate::error::{Error, Result};
use crate::shell::CommandClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Depot Configuration
// =============================================================================

/// Configuration for a depot node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Root under which `rid-<RID>` resource directories live
    pub depot_dir: PathBuf,
    /// Directory of filesystem-label symlinks
    pub label_dir: PathBuf,
    /// Default import destination root
    pub import_dir: PathBuf,
    /// Directory holding per-resource lock files
    pub lock_dir: PathBuf,
    /// Directory for transient metadata mounts
    pub scratch_dir: PathBuf,
    /// Kernel mount table
    pub mounts_file: PathBuf,
    /// Mount options for resource partitions
    pub mount_options: String,
    /// Size of the metadata partition in MB
    pub md_partition_mb: u64,
    /// Candidate names of the metadata initializer binary
    pub initializer_programs: Vec<String>,
    /// Maximum concurrently running batch units
    pub batch_concurrency: usize,
    /// Command result cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// Empty-slot planning
    pub slots: SlotConfig,
    /// Defragmentation
    pub defrag: DefragConfig,
    /// Storage daemon
    pub server: ServerConfig,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            depot_dir: PathBuf::from("/depot"),
            label_dir: PathBuf::from("/dev/disk/by-label"),
            import_dir: PathBuf::from("/depot/import"),
            lock_dir: PathBuf::from("/run/lock/ridctl"),
            scratch_dir: PathBuf::from("/run/ridctl"),
            mounts_file: PathBuf::from("/proc/mounts"),
            mount_options: "noatime,nodiratime".to_string(),
            md_partition_mb: 10_000, // 10 GB
            initializer_programs: vec!["mkfs.resource".to_string(), "mkfs_resource".to_string()],
            batch_concurrency: 36,
            cache_ttl_secs: 5,
            timeouts: TimeoutConfig::default(),
            slots: SlotConfig::default(),
            defrag: DefragConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl DepotConfig {
    /// Load from a YAML file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: DepotConfig = serde_yaml::from_str(&contents)?;
        debug!(path = %path.display(), "Loaded depot configuration");
        config.validate()?;
        Ok(config)
    }

    /// Configuration with every node path placed under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            depot_dir: root.join("depot"),
            label_dir: root.join("dev/disk/by-label"),
            import_dir: root.join("depot/import"),
            lock_dir: root.join("run/lock/ridctl"),
            scratch_dir: root.join("run/ridctl"),
            defrag: DefragConfig {
                log_dir: root.join("var/log/defrag"),
                ..DefragConfig::default()
            },
            server: ServerConfig {
                drive_count_file: root.join("etc/number_of_storage_drives"),
                staging_dir: root.join("tmp"),
                proc_dir: root.join("proc"),
                ..ServerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Move the depot root, keeping the import directory beneath it
    pub fn with_depot_dir(mut self, depot_dir: PathBuf) -> Self {
        if self.import_dir.starts_with(&self.depot_dir) {
            if let Ok(rest) = self.import_dir.strip_prefix(&self.depot_dir) {
                self.import_dir = depot_dir.join(rest);
            }
        }
        self.depot_dir = depot_dir;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("depot_dir", &self.depot_dir),
            ("label_dir", &self.label_dir),
            ("import_dir", &self.import_dir),
            ("lock_dir", &self.lock_dir),
            ("scratch_dir", &self.scratch_dir),
        ] {
            if !path.is_absolute() {
                return Err(Error::Configuration(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    path.display()
                )));
            }
        }
        if self.scratch_dir == self.depot_dir {
            return Err(Error::Configuration(
                "scratch_dir must differ from depot_dir".into(),
            ));
        }
        if self.md_partition_mb == 0 {
            return Err(Error::Configuration("md_partition_mb must be positive".into()));
        }
        if self.batch_concurrency == 0 {
            return Err(Error::Configuration("batch_concurrency must be positive".into()));
        }
        if self.initializer_programs.is_empty() {
            return Err(Error::Configuration(
                "at least one initializer program is required".into(),
            ));
        }
        if self.slots.drives_per_depot == 0 || self.slots.first_rid == 0 {
            return Err(Error::Configuration(
                "slot planning needs positive drives_per_depot and first_rid".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Bounded waits, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Read-only queries (`lsblk`, `lsof`, `parted print`, `filefrag`)
    pub query_secs: u64,
    /// `mount` / `umount`
    pub mount_secs: u64,
    /// `parted` changes, `mkfs`, the metadata initializer
    pub format_secs: u64,
    /// `fsck`, `e4defrag`
    pub check_secs: u64,
    /// Waiting for a resource lock
    pub lock_secs: u64,
    /// Waiting for new partitions to appear
    pub settle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_secs: 30,
            mount_secs: 120,
            format_secs: 1800,
            check_secs: 6 * 3600,
            lock_secs: 60,
            settle_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: CommandClass) -> Duration {
        let secs = match class {
            CommandClass::Query => self.query_secs,
            CommandClass::Mount => self.mount_secs,
            CommandClass::Format => self.format_secs,
            CommandClass::Check => self.check_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

// =============================================================================
// Slot Planning
// =============================================================================

/// Mapping of depot drive slots to RIDs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    /// Drive slots per depot
    pub drives_per_depot: u32,
    /// RID of the first slot of the first depot
    pub first_rid: u32,
    /// Number of the first depot
    pub first_depot: u32,
    /// Hostname prefix followed by the depot number
    pub hostname_prefix: String,
    /// Explicit depot number, overriding the hostname
    pub depot_number: Option<u32>,
    /// Options applied to every freshly formatted slot
    pub default_options: BTreeMap<String, String>,
}

impl Default for SlotConfig {
    fn default() -> Self {
        let mut default_options = BTreeMap::new();
        default_options.insert("enable_chksum".to_string(), "1".to_string());
        default_options.insert("minfree_size".to_string(), "40960".to_string());
        Self {
            drives_per_depot: 36,
            first_rid: 1501,
            first_depot: 1,
            hostname_prefix: "cms-depot".to_string(),
            depot_number: None,
            default_options,
        }
    }
}

// =============================================================================
// Defragmentation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefragConfig {
    /// Directory receiving `extents-rid-<RID>.log`
    pub log_dir: PathBuf,
    /// Files with more extents than this are defragmented
    pub extent_threshold: u64,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/log/defrag"),
            extent_threshold: 3,
        }
    }
}

// =============================================================================
// Storage Daemon
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Daemon host; the local hostname when unset
    pub host: Option<String>,
    /// Daemon control port
    pub port: u16,
    /// File holding the number of drives this node should expose
    pub drive_count_file: PathBuf,
    /// Daemon executables looked up in `PATH`, first match wins
    pub executables: Vec<String>,
    /// Directory the running copy of the daemon binary is staged in
    pub staging_dir: PathBuf,
    /// `LD_LIBRARY_PATH` of the daemon
    pub library_dir: PathBuf,
    /// `LD_PRELOAD` of the daemon, when the library exists
    pub preload: Option<PathBuf>,
    /// procfs mount used to find the running daemon
    pub proc_dir: PathBuf,
    /// How long `stop` waits for the daemon to exit
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 6714,
            drive_count_file: PathBuf::from("/etc/number_of_storage_drives"),
            executables: vec!["ibp_server.exe".to_string(), "ibp_server".to_string()],
            staging_dir: PathBuf::from("/tmp"),
            library_dir: PathBuf::from("/usr/local/lib"),
            preload: Some(PathBuf::from("/usr/local/lib/libtcmalloc.so")),
            proc_dir: PathBuf::from("/proc"),
            shutdown_timeout_secs: 1800,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Local hostname from `/etc/hostname`, falling back to the kernel's
pub fn local_hostname() -> Result<String> {
    for source in ["/etc/hostname", "/proc/sys/kernel/hostname"] {
        if let Ok(hostname) = fs::read_to_string(source) {
            let hostname = hostname.trim();
            if !hostname.is_empty() {
                return Ok(hostname.to_string());
            }
        }
    }
    Err(Error::Configuration("cannot determine hostname".into()))
}
