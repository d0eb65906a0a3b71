//! Metadata relocation
//!
//! `import` moves a directly mounted resource's metadata tree to an external
//! directory (typically on faster storage) and remounts it in imported form;
//! `export` copies the live external tree back onto the metadata partition
//! and remounts directly. The import marker is written both on the partition,
//! where `mount` looks for it, and in the external tree.
//!
//! A quarantined resource is refused before anything changes. Once the
//! resource has been unmounted for the switch, a failed remount puts the
//! partition marker back the way it was and mounts the previous form again.

use crate::domain::{MountDescriptor, MountState, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::transient::TransientMount;
use crate::lifecycle::tree::{copy_tree, mirror_into};
use crate::lifecycle::{read_import_marker, ResourceManager, Rollback, IMPORT_MARKER};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Directory under the import root holding `--snap` copies
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Entries of a partition root that belong to the filesystem, not the tree
const FILESYSTEM_ENTRIES: &[&str] = &["lost+found"];

impl ResourceManager {
    /// Relocate a resource's metadata to `<target_dir>/md-<RID>`
    ///
    /// With `snapshot`, a timestamped copy of the tree is also kept under
    /// `<target_dir>/snapshots/`.
    pub async fn import(&self, rid: Rid, target_dir: &Path, snapshot: bool) -> Result<PathBuf> {
        self.instrumented("import", async {
            let _lock = self.lock(rid).await?;
            self.import_unlocked(rid, target_dir, snapshot).await
        })
        .await
    }

    /// Move an imported resource's metadata back onto its partition
    ///
    /// With `snapshot`, the external tree is kept as a timestamped copy under
    /// `<target_dir>/snapshots/` before it is deleted.
    pub async fn export(&self, rid: Rid, target_dir: &Path, snapshot: bool) -> Result<()> {
        self.instrumented("export", async {
            let _lock = self.lock(rid).await?;
            self.export_unlocked(rid, target_dir, snapshot).await
        })
        .await
    }

    pub(crate) async fn import_unlocked(
        &self,
        rid: Rid,
        target_dir: &Path,
        snapshot: bool,
    ) -> Result<PathBuf> {
        let target_dir = std::path::absolute(target_dir)?;
        let target_dir = target_dir.as_path();
        let paths = self.paths(rid);
        let descriptor = self.read_descriptor(rid)?;
        if descriptor.state() != MountState::MountedDirect {
            return Err(Error::AlreadyInState {
                rid,
                state: MountState::MountedImported.to_string(),
            });
        }
        if paths.md.join(IMPORT_MARKER).exists() {
            return Err(Error::Inconsistent {
                rid,
                reason: "directly mounted metadata carries an import marker".into(),
            });
        }
        let destination = target_dir.join(rid.import_dir_name());
        if destination.exists() {
            return Err(Error::DestinationExists { path: destination });
        }
        self.ensure_not_sequestered(rid).await?;
        self.ensure_idle(rid, &[&paths.data, &paths.md]).await?;
        self.checkpoint()?;

        fs::create_dir_all(target_dir)?;
        if snapshot {
            self.snapshot(rid, &paths.md, target_dir).await?;
        }

        info!(%rid, to = %destination.display(), "Importing metadata");
        let mounts = self.ports().mounts.as_ref();
        let mut rollback = Rollback::new();
        if let Err(e) = self
            .stage_import(&paths.md, &destination, &mut rollback)
            .await
        {
            rollback.unwind(mounts).await;
            return Err(e);
        }

        if let Err(e) = self.umount_unlocked(rid).await {
            warn!(%rid, "Unmount during import failed: {}", e);
            // the staged tree only goes while the partition still holds its marker
            if paths.md.join(IMPORT_MARKER).is_file() {
                rollback.unwind(mounts).await;
            } else {
                rollback.commit();
            }
            return Err(e);
        }
        rollback.commit();

        match self.mount_unlocked(rid).await {
            Ok(MountDescriptor::Imported { external_dir, .. }) if external_dir == destination => {
                info!(%rid, at = %external_dir.display(), "Metadata imported");
                Ok(external_dir)
            }
            Ok(other) => Err(Error::Inconsistent {
                rid,
                reason: format!("remount after import produced '{}'", other),
            }),
            Err(cause) => {
                warn!(%rid, "Remount after import failed, reverting: {}", cause);
                let failures = self.revert_import(rid, &destination).await;
                Err(Error::PartialFailure {
                    rid,
                    operation: "import",
                    cause: Box::new(cause),
                    rollback: failures,
                })
            }
        }
    }

    /// Copy the tree and write both markers
    async fn stage_import(
        &self,
        md: &Path,
        destination: &Path,
        rollback: &mut Rollback,
    ) -> Result<()> {
        rollback.created_tree(destination);
        copy_tree(md, destination).await?;
        let marker = format!("{}\n", destination.display());
        fs::write(destination.join(IMPORT_MARKER), &marker)?;
        fs::write(md.join(IMPORT_MARKER), &marker)?;
        rollback.created_file(md.join(IMPORT_MARKER));
        Ok(())
    }

    /// Return an unmounted resource whose imported remount failed to its
    /// direct form, dropping the external copy
    async fn revert_import(&self, rid: Rid, destination: &Path) -> Vec<String> {
        let mut failures = Vec::new();
        let reverted = match self.device(rid) {
            Ok(device) => self.set_partition_marker(&device.md_partition(), None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = reverted {
            failures.push(format!("partition marker: {}", e));
            return failures;
        }
        if let Err(e) = fs::remove_dir_all(destination) {
            failures.push(format!("{}: {}", destination.display(), e));
        }
        if let Err(e) = self.mount_unlocked(rid).await {
            failures.push(format!("remount: {}", e));
        }
        failures
    }

    /// Set or clear the import marker of an unmounted metadata partition
    async fn set_partition_marker(&self, md_partition: &Path, target: Option<&Path>) -> Result<()> {
        let mounts = self.ports().mounts.as_ref();
        let partition = TransientMount::mount(
            mounts,
            &self.config().scratch_dir,
            md_partition,
            &self.config().mount_options,
        )
        .await?;
        let marker = partition.path().join(IMPORT_MARKER);
        let written = match target {
            Some(dir) => fs::write(&marker, format!("{}\n", dir.display())),
            None => fs::remove_file(&marker),
        };
        partition.release(mounts).await?;
        Ok(written?)
    }

    /// Refuse to relocate a quarantined resource
    async fn ensure_not_sequestered(&self, rid: Rid) -> Result<()> {
        let status = self.check_sequester_unlocked(rid).await?;
        if status.is_sequestered() {
            return Err(Error::Sequestered {
                rid,
                status: status.line,
            });
        }
        Ok(())
    }

    pub(crate) async fn export_unlocked(
        &self,
        rid: Rid,
        target_dir: &Path,
        snapshot: bool,
    ) -> Result<()> {
        let target_dir = std::path::absolute(target_dir)?;
        let target_dir = target_dir.as_path();
        let paths = self.paths(rid);
        let (md_partition, external_dir) = match self.read_descriptor(rid)? {
            MountDescriptor::Imported {
                md_partition,
                external_dir,
                ..
            } => (md_partition, external_dir),
            MountDescriptor::Direct { .. } => {
                return Err(Error::AlreadyInState {
                    rid,
                    state: "exported (metadata on its partition)".into(),
                });
            }
        };
        if external_dir.parent() != Some(target_dir) {
            warn!(%rid, external = %external_dir.display(), "External metadata outside the given directory");
        }
        match read_import_marker(&external_dir)? {
            Some(marker) if marker == external_dir => {}
            other => {
                return Err(Error::Inconsistent {
                    rid,
                    reason: format!(
                        "descriptor names {} but the external tree's marker is {:?}",
                        external_dir.display(),
                        other
                    ),
                });
            }
        }
        self.ensure_not_sequestered(rid).await?;
        self.ensure_idle(rid, &[&paths.data, &external_dir]).await?;
        self.checkpoint()?;

        if snapshot {
            self.snapshot(rid, &external_dir, target_dir).await?;
        }

        info!(%rid, from = %external_dir.display(), "Exporting metadata");
        let mounts = self.ports().mounts.as_ref();
        let partition = TransientMount::mount(
            mounts,
            &self.config().scratch_dir,
            &md_partition,
            &self.config().mount_options,
        )
        .await?;

        let restored = self
            .restore_partition(rid, partition.path(), &external_dir)
            .await;
        partition.release(mounts).await?;
        restored?;

        if let Err(e) = self.umount_unlocked(rid).await {
            warn!(%rid, "Unmount during export failed, keeping the import: {}", e);
            if let Err(marker) = self
                .set_partition_marker(&md_partition, Some(&external_dir))
                .await
            {
                warn!(%rid, "Cannot restore the partition's import marker: {}", marker);
            }
            return Err(e);
        }
        match self.mount_unlocked(rid).await {
            Ok(MountDescriptor::Direct { .. }) => {}
            Ok(other) => {
                return Err(Error::Inconsistent {
                    rid,
                    reason: format!("remount after export produced '{}'", other),
                });
            }
            Err(cause) => {
                warn!(%rid, "Remount after export failed, reverting: {}", cause);
                let mut failures = Vec::new();
                match self
                    .set_partition_marker(&md_partition, Some(&external_dir))
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = self.mount_unlocked(rid).await {
                            failures.push(format!("remount: {}", e));
                        }
                    }
                    Err(e) => failures.push(format!("partition marker: {}", e)),
                }
                return Err(Error::PartialFailure {
                    rid,
                    operation: "export",
                    cause: Box::new(cause),
                    rollback: failures,
                });
            }
        }

        fs::remove_dir_all(&external_dir)?;
        info!(%rid, "Metadata exported");
        Ok(())
    }

    /// Replace the partition's tree with the external one
    ///
    /// The partition's marker is removed first and restored if the copy
    /// fails, so a failed export leaves the resource imported.
    async fn restore_partition(&self, rid: Rid, md_root: &Path, external_dir: &Path) -> Result<()> {
        let marker = md_root.join(IMPORT_MARKER);
        match read_import_marker(md_root)? {
            Some(target) if target == external_dir => {}
            other => {
                return Err(Error::Inconsistent {
                    rid,
                    reason: format!(
                        "partition marker {:?} does not match {}",
                        other,
                        external_dir.display()
                    ),
                });
            }
        }
        fs::remove_file(&marker)?;

        let skip: Vec<&str> = FILESYSTEM_ENTRIES
            .iter()
            .copied()
            .chain([IMPORT_MARKER])
            .collect();
        if let Err(e) = mirror_into(external_dir, md_root, FILESYSTEM_ENTRIES, &skip).await {
            warn!(%rid, "Copy-back failed, restoring import marker: {}", e);
            fs::write(&marker, format!("{}\n", external_dir.display()))?;
            return Err(e);
        }
        Ok(())
    }

    async fn snapshot(&self, rid: Rid, source: &Path, target_dir: &Path) -> Result<PathBuf> {
        let dir = target_dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)?;
        let destination = dir.join(format!(
            "{}-{}",
            rid.import_dir_name(),
            Utc::now().format("%Y%m%dT%H%M%SZ")
        ));
        copy_tree(source, &destination).await?;
        info!(%rid, at = %destination.display(), "Metadata snapshot kept");
        Ok(destination)
    }
}
