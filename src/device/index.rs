//! Device/Resource index
//!
//! Builds the RID <-> block device mapping from filesystem-label symlinks.
//! The index is a read-time snapshot; rescan after hot-plug.

use crate::domain::types::{BlockDevice, Rid, DATA_LABEL_PREFIX};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::{debug, warn};

/// Snapshot of the resources visible on this node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIndex {
    by_rid: BTreeMap<Rid, BlockDevice>,
    by_device: BTreeMap<BlockDevice, Rid>,
}

impl DeviceIndex {
    /// Scan `label_dir` for `rid-data-<RID>` labels
    ///
    /// A missing label directory yields an empty index.
    pub fn scan(label_dir: &Path) -> Result<Self> {
        let mut index = Self::default();
        if !label_dir.is_dir() {
            debug!(dir = %label_dir.display(), "Label directory missing");
            return Ok(index);
        }

        let pattern = label_dir.join(format!("{}*", DATA_LABEL_PREFIX));
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Configuration(format!("invalid label pattern {}: {}", pattern, e)))?;

        for entry in entries {
            let link = match entry {
                Ok(link) => link,
                Err(e) => {
                    warn!("Skipping unreadable label entry: {}", e);
                    continue;
                }
            };
            let Some(rid) = link
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(DATA_LABEL_PREFIX))
                .and_then(|n| n.parse::<Rid>().ok())
            else {
                debug!(label = %link.display(), "Ignoring non-resource label");
                continue;
            };
            let partition = match fs::canonicalize(&link) {
                Ok(partition) => partition,
                Err(e) => {
                    warn!(label = %link.display(), "Dangling label symlink: {}", e);
                    continue;
                }
            };
            index.insert(rid, BlockDevice::from_partition(&partition));
        }

        debug!(resources = index.len(), "Device index built");
        Ok(index)
    }

    /// Build an index from explicit pairs
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Rid, BlockDevice)>) -> Self {
        let mut index = Self::default();
        for (rid, device) in pairs {
            index.insert(rid, device);
        }
        index
    }

    fn insert(&mut self, rid: Rid, device: BlockDevice) {
        if let Some(previous) = self.by_rid.get(&rid) {
            warn!(%rid, first = %previous, second = %device, "RID labelled on two devices");
        }
        self.by_device.insert(device.clone(), rid);
        self.by_rid.insert(rid, device);
    }

    /// `ResourceToDevice`
    pub fn resource_to_device(&self) -> &BTreeMap<Rid, BlockDevice> {
        &self.by_rid
    }

    /// `DeviceToResource`
    pub fn device_to_resource(&self) -> &BTreeMap<BlockDevice, Rid> {
        &self.by_device
    }

    pub fn resource_exists(&self, rid: Rid) -> bool {
        self.by_rid.contains_key(&rid)
    }

    pub fn device_for(&self, rid: Rid) -> Option<&BlockDevice> {
        self.by_rid.get(&rid)
    }

    pub fn resource_for(&self, device: &BlockDevice) -> Option<Rid> {
        self.by_device.get(device).copied()
    }

    /// All indexed RIDs in ascending order
    pub fn rids(&self) -> Vec<Rid> {
        self.by_rid.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_rid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rid.is_empty()
    }
}

/// Check whether `path` is a block device node
pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// RIDs with a resource directory under `depot_dir`, in ascending order
pub fn mounted_rids(depot_dir: &Path) -> Result<Vec<Rid>> {
    if !depot_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut rids = Vec::new();
    for entry in fs::read_dir(depot_dir)? {
        let entry = entry?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(rid) = entry.file_name().to_str().and_then(Rid::from_dir_name) {
            rids.push(rid);
        }
    }
    rids.sort();
    Ok(rids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    fn fake_partition(dir: &TempDir, name: &str) -> PathBuf {
        let dev = dir.path().join("dev");
        fs::create_dir_all(&dev).unwrap();
        let path = dev.join(name);
        fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn test_scan_labels() {
        let dir = TempDir::new().unwrap();
        let labels = dir.path().join("by-label");
        fs::create_dir_all(&labels).unwrap();

        let sdb2 = fake_partition(&dir, "sdb2");
        let sdb1 = fake_partition(&dir, "sdb1");
        let nvme = fake_partition(&dir, "nvme0n1p2");
        symlink(&sdb2, labels.join("rid-data-1501")).unwrap();
        symlink(&sdb1, labels.join("rid-md-1501")).unwrap();
        symlink(&nvme, labels.join("rid-data-1502")).unwrap();
        symlink(&sdb2, labels.join("rid-data-scratch")).unwrap();
        symlink(dir.path().join("dev/gone2"), labels.join("rid-data-1503")).unwrap();

        let index = DeviceIndex::scan(&labels).unwrap();
        let dev = fs::canonicalize(dir.path().join("dev")).unwrap();

        assert_eq!(index.rids(), vec![rid(1501), rid(1502)]);
        assert_eq!(
            index.device_for(rid(1501)),
            Some(&BlockDevice::new(dev.join("sdb")))
        );
        assert_eq!(
            index.resource_for(&BlockDevice::new(dev.join("nvme0n1"))),
            Some(rid(1502))
        );
        assert!(!index.resource_exists(rid(1503)));
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = TempDir::new().unwrap();
        let index = DeviceIndex::scan(&dir.path().join("absent")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_mounted_rids() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("rid-1502")).unwrap();
        fs::create_dir(dir.path().join("rid-1501")).unwrap();
        fs::create_dir(dir.path().join("import")).unwrap();
        fs::write(dir.path().join("rid-1600"), "").unwrap();

        assert_eq!(mounted_rids(dir.path()).unwrap(), vec![rid(1501), rid(1502)]);
    }

    #[test]
    fn test_is_block_device() {
        let dir = TempDir::new().unwrap();
        assert!(!is_block_device(&fake_partition(&dir, "sdz1")));
        assert!(!is_block_device(&dir.path().join("absent")));
    }
}
