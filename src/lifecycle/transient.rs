//! Transient metadata access
//!
//! Inspecting a resource's metadata may require mounting its metadata
//! partition on a scratch directory. [`MetadataAccess`] records whether the
//! access owns such a mount, so callers release exactly what they created
//! and leave pre-existing mounts in place.

use crate::domain::ports::MountTable;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A partition mounted on a private scratch directory
#[derive(Debug)]
pub struct TransientMount {
    partition: PathBuf,
    path: PathBuf,
    released: bool,
}

impl TransientMount {
    /// Mount `partition` on a fresh directory under `scratch_dir`
    pub async fn mount(
        mounts: &dyn MountTable,
        scratch_dir: &Path,
        partition: &Path,
        options: &str,
    ) -> Result<Self> {
        fs::create_dir_all(scratch_dir)?;
        let name = format!(
            "md-{}-{}",
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let path = scratch_dir.join(name);
        fs::create_dir(&path)?;

        if let Err(e) = mounts.mount(partition, &path, options).await {
            let _ = fs::remove_dir(&path);
            return Err(e);
        }
        debug!(partition = %partition.display(), at = %path.display(), "Transient mount");
        Ok(Self {
            partition: partition.to_path_buf(),
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmount and remove the scratch directory
    pub async fn release(mut self, mounts: &dyn MountTable) -> Result<()> {
        mounts.umount(&self.path).await?;
        self.released = true;
        fs::remove_dir(&self.path)?;
        debug!(partition = %self.partition.display(), "Transient mount released");
        Ok(())
    }
}

impl Drop for TransientMount {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                partition = %self.partition.display(),
                at = %self.path.display(),
                "Transient mount left in place"
            );
        }
    }
}

/// Where a resource's metadata tree was found
#[derive(Debug)]
pub enum MetadataAccess {
    /// Metadata relocated to an external directory
    External(PathBuf),
    /// Metadata partition was already mounted; it stays mounted
    AlreadyMounted(PathBuf),
    /// Metadata partition mounted by this access; released afterwards
    Transient(TransientMount),
}

impl MetadataAccess {
    pub fn path(&self) -> &Path {
        match self {
            MetadataAccess::External(path) | MetadataAccess::AlreadyMounted(path) => path,
            MetadataAccess::Transient(mount) => mount.path(),
        }
    }

    /// Undo whatever this access mounted
    pub async fn release(self, mounts: &dyn MountTable) -> Result<()> {
        match self {
            MetadataAccess::Transient(mount) => mount.release(mounts).await,
            MetadataAccess::External(_) | MetadataAccess::AlreadyMounted(_) => Ok(()),
        }
    }
}
