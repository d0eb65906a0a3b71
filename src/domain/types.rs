//! Domain Types - Resource identity, devices, mount descriptors and ledger entries
//!
//! These types carry the on-disk conventions of a depot node: directory and
//! label naming derived from a RID, kernel partition naming, and the exact
//! text formats of `rid.info` and `SEQUESTER_STATUS`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Filesystem label prefix of the metadata partition
pub const MD_LABEL_PREFIX: &str = "rid-md-";

/// Filesystem label prefix of the data partition
pub const DATA_LABEL_PREFIX: &str = "rid-data-";

/// Resource directory prefix under the depot root
pub const RESOURCE_DIR_PREFIX: &str = "rid-";

/// Import directory prefix under an import root
pub const IMPORT_DIR_PREFIX: &str = "md-";

/// Ledger timestamp format (UTC)
pub const LEDGER_TIME_FORMAT: &str = "%a %b %d %T %Z %Y";

// =============================================================================
// Resource Identity
// =============================================================================

/// Resource ID, the strictly positive integer identity of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Rid(u32);

impl Rid {
    /// Create a RID, rejecting zero
    pub fn new(value: u32) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidArgument("RID must be a positive integer".into()));
        }
        Ok(Self(value))
    }

    /// Numeric value
    pub fn get(self) -> u32 {
        self.0
    }

    /// Resource directory name (`rid-<RID>`)
    pub fn dir_name(self) -> String {
        format!("{}{}", RESOURCE_DIR_PREFIX, self.0)
    }

    /// Metadata partition label (`rid-md-<RID>`)
    pub fn md_label(self) -> String {
        format!("{}{}", MD_LABEL_PREFIX, self.0)
    }

    /// Data partition label (`rid-data-<RID>`)
    pub fn data_label(self) -> String {
        format!("{}{}", DATA_LABEL_PREFIX, self.0)
    }

    /// Import directory name (`md-<RID>`)
    pub fn import_dir_name(self) -> String {
        format!("{}{}", IMPORT_DIR_PREFIX, self.0)
    }

    /// Parse a resource directory name (`rid-<RID>`)
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix(RESOURCE_DIR_PREFIX)?.parse().ok()
    }
}

impl TryFrom<u32> for Rid {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Rid::new(value)
    }
}

impl From<Rid> for u32 {
    fn from(rid: Rid) -> u32 {
        rid.0
    }
}

impl FromStr for Rid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid RID '{}'", s)))?;
        Rid::new(value)
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Block Devices
// =============================================================================

/// A whole block device (e.g. `/dev/sdb`, `/dev/nvme0n1`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockDevice(PathBuf);

impl BlockDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Path of partition `number`, following kernel naming
    ///
    /// Devices whose name ends in a digit get a `p` separator
    /// (`/dev/nvme0n1` -> `/dev/nvme0n1p1`), others do not
    /// (`/dev/sdb` -> `/dev/sdb1`).
    pub fn partition(&self, number: u32) -> PathBuf {
        let raw = self.0.to_string_lossy();
        let separator = if raw.ends_with(|c: char| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        };
        PathBuf::from(format!("{}{}{}", raw, separator, number))
    }

    /// Metadata partition (partition 1)
    pub fn md_partition(&self) -> PathBuf {
        self.partition(1)
    }

    /// Data partition (partition 2)
    pub fn data_partition(&self) -> PathBuf {
        self.partition(2)
    }

    /// Derive the whole device from one of its partitions
    pub fn from_partition(partition: &Path) -> Self {
        let raw = partition.to_string_lossy();
        let without_digits = raw.trim_end_matches(|c: char| c.is_ascii_digit());
        if without_digits.len() == raw.len() {
            return Self(partition.to_path_buf());
        }
        // nvme0n1p2 -> nvme0n1, mmcblk0p1 -> mmcblk0
        let base = match without_digits.strip_suffix('p') {
            Some(stem) if stem.ends_with(|c: char| c.is_ascii_digit()) => stem,
            _ => without_digits,
        };
        Self(PathBuf::from(base))
    }
}

impl std::fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// =============================================================================
// Mount Descriptor
// =============================================================================

/// Contents of `rid.info`, the canonical "currently mounted" marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum MountDescriptor {
    /// Metadata partition mounted at `md`
    Direct {
        md_partition: PathBuf,
        data_partition: PathBuf,
    },
    /// Metadata lives in `external_dir`; `md` is a symlink to it
    Imported {
        md_partition: PathBuf,
        data_partition: PathBuf,
        external_dir: PathBuf,
    },
}

impl MountDescriptor {
    pub fn md_partition(&self) -> &Path {
        match self {
            MountDescriptor::Direct { md_partition, .. }
            | MountDescriptor::Imported { md_partition, .. } => md_partition,
        }
    }

    pub fn data_partition(&self) -> &Path {
        match self {
            MountDescriptor::Direct { data_partition, .. }
            | MountDescriptor::Imported { data_partition, .. } => data_partition,
        }
    }

    pub fn external_dir(&self) -> Option<&Path> {
        match self {
            MountDescriptor::Direct { .. } => None,
            MountDescriptor::Imported { external_dir, .. } => Some(external_dir),
        }
    }

    pub fn state(&self) -> MountState {
        match self {
            MountDescriptor::Direct { .. } => MountState::MountedDirect,
            MountDescriptor::Imported { .. } => MountState::MountedImported,
        }
    }
}

impl std::fmt::Display for MountDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountDescriptor::Direct {
                md_partition,
                data_partition,
            } => write!(f, "dev:{}:{}", md_partition.display(), data_partition.display()),
            MountDescriptor::Imported {
                md_partition,
                data_partition,
                external_dir,
            } => write!(
                f,
                "dev:{}:{}:{}",
                md_partition.display(),
                data_partition.display(),
                external_dir.display()
            ),
        }
    }
}

impl FromStr for MountDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let line = s.lines().next().unwrap_or("").trim();
        let fields: Vec<&str> = line.splitn(4, ':').collect();

        // Older nodes wrote a "dir" tag for imported resources.
        if !matches!(fields.first(), Some(&"dev") | Some(&"dir")) {
            return Err(Error::malformed(
                "mount descriptor",
                format!("unknown mount type in '{}'", line),
            ));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(Error::malformed(
                "mount descriptor",
                format!("empty field in '{}'", line),
            ));
        }

        match fields.as_slice() {
            [_, md, data] => Ok(MountDescriptor::Direct {
                md_partition: PathBuf::from(md),
                data_partition: PathBuf::from(data),
            }),
            [_, md, data, dir] => Ok(MountDescriptor::Imported {
                md_partition: PathBuf::from(md),
                data_partition: PathBuf::from(data),
                external_dir: PathBuf::from(dir),
            }),
            _ => Err(Error::malformed(
                "mount descriptor",
                format!("expected 3 or 4 fields in '{}'", line),
            )),
        }
    }
}

/// Mount state of a resource on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    MountedDirect,
    MountedImported,
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountState::Unmounted => write!(f, "unmounted"),
            MountState::MountedDirect => write!(f, "mounted"),
            MountState::MountedImported => write!(f, "mounted (imported)"),
        }
    }
}

// =============================================================================
// Sequester Ledger
// =============================================================================

/// Quarantine state recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequesterState {
    Sequestered,
    NotSequestered,
}

impl std::fmt::Display for SequesterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequesterState::Sequestered => write!(f, "SEQUESTERED"),
            SequesterState::NotSequestered => write!(f, "NOT_SEQUESTERED"),
        }
    }
}

/// One ledger line: `<STATE> | <timestamp> | <message>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub state: SequesterState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LedgerEntry {
    pub fn now(state: SequesterState, message: impl Into<String>) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} | {}",
            self.state,
            self.timestamp.format(LEDGER_TIME_FORMAT),
            self.message
        )
    }
}

/// Current ledger status: the last non-empty line, or the implicit default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub state: SequesterState,
    /// Raw ledger line, or `NOT_SEQUESTERED` when the ledger is absent
    pub line: String,
}

impl LedgerStatus {
    pub fn not_sequestered() -> Self {
        Self {
            state: SequesterState::NotSequestered,
            line: SequesterState::NotSequestered.to_string(),
        }
    }

    /// Interpret a ledger line; only a leading `SEQUESTERED` token quarantines
    ///
    /// The token ends at the first `|` or whitespace, so hand-written lines
    /// such as `SEQUESTERED bad SMART` count as well.
    pub fn from_line(line: &str) -> Self {
        let line = line.trim();
        let tag = line
            .split(|c: char| c == '|' || c.is_whitespace())
            .next()
            .unwrap_or("");
        let state = if tag == "SEQUESTERED" {
            SequesterState::Sequestered
        } else {
            SequesterState::NotSequestered
        };
        Self {
            state,
            line: line.to_string(),
        }
    }

    /// Status of a whole ledger file's contents
    pub fn from_ledger(contents: &str) -> Self {
        contents
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(Self::from_line)
            .unwrap_or_else(Self::not_sequestered)
    }

    pub fn is_sequestered(&self) -> bool {
        self.state == SequesterState::Sequestered
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.line)
    }
}

// =============================================================================
// Listing
// =============================================================================

/// One row of `ridctl list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub rid: Rid,
    pub state: MountState,
    pub md_partition: Option<PathBuf>,
    pub data_partition: Option<PathBuf>,
    pub import_dir: Option<PathBuf>,
    pub sequester: LedgerStatus,
}

// =============================================================================
// Storage Daemon
// =============================================================================

/// A running storage daemon process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonProcess {
    pub pid: u32,
    /// Process name as the kernel reports it
    pub name: String,
}

impl std::fmt::Display for DaemonProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn test_rid_parsing() {
        assert_eq!("1501".parse::<Rid>().unwrap().get(), 1501);
        assert_matches!("0".parse::<Rid>(), Err(Error::InvalidArgument(_)));
        assert_matches!("-3".parse::<Rid>(), Err(Error::InvalidArgument(_)));
        assert_matches!("abc".parse::<Rid>(), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_rid_names() {
        let rid = Rid::new(1501).unwrap();
        assert_eq!(rid.dir_name(), "rid-1501");
        assert_eq!(rid.md_label(), "rid-md-1501");
        assert_eq!(rid.data_label(), "rid-data-1501");
        assert_eq!(rid.import_dir_name(), "md-1501");
        assert_eq!(Rid::from_dir_name("rid-1501"), Some(rid));
        assert_eq!(Rid::from_dir_name("rid-data-1501"), None);
        assert_eq!(Rid::from_dir_name("import"), None);
    }

    #[test]
    fn test_partition_naming() {
        let sdb = BlockDevice::new("/dev/sdb");
        assert_eq!(sdb.md_partition(), PathBuf::from("/dev/sdb1"));
        assert_eq!(sdb.data_partition(), PathBuf::from("/dev/sdb2"));

        let nvme = BlockDevice::new("/dev/nvme0n1");
        assert_eq!(nvme.partition(1), PathBuf::from("/dev/nvme0n1p1"));
    }

    #[test]
    fn test_device_from_partition() {
        assert_eq!(
            BlockDevice::from_partition(Path::new("/dev/sdb2")),
            BlockDevice::new("/dev/sdb")
        );
        assert_eq!(
            BlockDevice::from_partition(Path::new("/dev/sdaa12")),
            BlockDevice::new("/dev/sdaa")
        );
        assert_eq!(
            BlockDevice::from_partition(Path::new("/dev/nvme0n1p2")),
            BlockDevice::new("/dev/nvme0n1")
        );
        assert_eq!(
            BlockDevice::from_partition(Path::new("/dev/sdb")),
            BlockDevice::new("/dev/sdb")
        );
    }

    #[test]
    fn test_descriptor_formats() {
        let direct: MountDescriptor = "dev:/dev/sdb1:/dev/sdb2\n".parse().unwrap();
        assert_eq!(
            direct,
            MountDescriptor::Direct {
                md_partition: "/dev/sdb1".into(),
                data_partition: "/dev/sdb2".into(),
            }
        );
        assert_eq!(direct.to_string(), "dev:/dev/sdb1:/dev/sdb2");
        assert_eq!(direct.state(), MountState::MountedDirect);

        let imported: MountDescriptor = "dev:/dev/sdb1:/dev/sdb2:/depot/import/md-1501"
            .parse()
            .unwrap();
        assert_eq!(
            imported.external_dir(),
            Some(Path::new("/depot/import/md-1501"))
        );
        assert_eq!(
            imported.to_string(),
            "dev:/dev/sdb1:/dev/sdb2:/depot/import/md-1501"
        );
    }

    #[test]
    fn test_descriptor_legacy_tag() {
        let legacy: MountDescriptor = "dir:/dev/sdb1:/dev/sdb2:/ssd/md-1501".parse().unwrap();
        assert_eq!(legacy.state(), MountState::MountedImported);
        assert!(legacy.to_string().starts_with("dev:"));
    }

    #[test]
    fn test_descriptor_rejects_malformed() {
        assert_matches!("".parse::<MountDescriptor>(), Err(Error::Malformed { .. }));
        assert_matches!("dev:/dev/sdb1".parse::<MountDescriptor>(), Err(Error::Malformed { .. }));
        assert_matches!(
            "nfs:/dev/sdb1:/dev/sdb2".parse::<MountDescriptor>(),
            Err(Error::Malformed { .. })
        );
        assert_matches!("dev::/dev/sdb2".parse::<MountDescriptor>(), Err(Error::Malformed { .. }));
    }

    #[test]
    fn test_ledger_entry_format() {
        let entry = LedgerEntry {
            state: SequesterState::Sequestered,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            message: "bad SMART".into(),
        };
        assert_eq!(
            entry.to_string(),
            "SEQUESTERED | Tue Mar 05 14:07:09 UTC 2024 | bad SMART"
        );
    }

    #[test]
    fn test_ledger_status() {
        assert!(!LedgerStatus::from_ledger("").is_sequestered());
        assert_eq!(LedgerStatus::from_ledger("").line, "NOT_SEQUESTERED");

        let ledger = "SEQUESTERED | t1 | bad\nNOT_SEQUESTERED | t2 | fixed\nSEQUESTERED | t3 | again\n\n";
        let status = LedgerStatus::from_ledger(ledger);
        assert!(status.is_sequestered());
        assert_eq!(status.line, "SEQUESTERED | t3 | again");

        let status = LedgerStatus::from_ledger("SEQUESTERED | t1 | bad\nNOT_SEQUESTERED | t2 | ok");
        assert!(!status.is_sequestered());
    }

    #[test]
    fn test_ledger_status_without_separators() {
        assert!(LedgerStatus::from_line("SEQUESTERED bad SMART").is_sequestered());
        assert!(LedgerStatus::from_line("SEQUESTERED").is_sequestered());
        assert!(LedgerStatus::from_line("  SEQUESTERED|t1|bad").is_sequestered());
        assert!(LedgerStatus::from_line("SEQUESTERED\tpulled by ops").is_sequestered());

        assert!(!LedgerStatus::from_line("NOT_SEQUESTERED bad SMART").is_sequestered());
        assert!(!LedgerStatus::from_line("UNSEQUESTERED | t2 | fixed").is_sequestered());
        assert!(!LedgerStatus::from_line("SEQUESTERED_OLD | t1 | bad").is_sequestered());
        assert!(!LedgerStatus::from_line("sequestered | t1 | bad").is_sequestered());
    }
}
