//! Mount/Unmount state machine
//!
//! `mount` brings an unmounted resource into `MountedDirect` or
//! `MountedImported` depending on the import marker found on its metadata
//! partition; `umount` reverses either form. Any failure after the first
//! mutation unwinds what was done before the error is returned.
//!
//! Cancellation is honoured only before a public operation starts; the
//! `*_unlocked` forms run to completion so that import and export can
//! remount without stopping halfway.

use crate::domain::ports::MountTable;
use crate::domain::{MountDescriptor, MountState, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::settings::has_identity_marker;
use crate::lifecycle::transient::{MetadataAccess, TransientMount};
use crate::lifecycle::{
    read_import_marker, ResourceManager, Rollback, DESCRIPTOR_FILE, SETTINGS_FILE,
};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

impl ResourceManager {
    /// Mount a resource
    pub async fn mount(&self, rid: Rid) -> Result<MountDescriptor> {
        self.instrumented("mount", async {
            let _lock = self.lock(rid).await?;
            self.checkpoint()?;
            self.mount_unlocked(rid).await
        })
        .await
    }

    /// Unmount a resource
    pub async fn umount(&self, rid: Rid) -> Result<()> {
        self.instrumented("umount", async {
            let _lock = self.lock(rid).await?;
            self.checkpoint()?;
            self.umount_unlocked(rid).await
        })
        .await
    }

    /// Remove whatever a failed unmount left behind
    pub async fn force_cleanup(&self, rid: Rid) -> Result<()> {
        self.instrumented("cleanup", async {
            let _lock = self.lock(rid).await?;
            self.force_cleanup_unlocked(rid).await
        })
        .await
    }

    pub(crate) async fn mount_unlocked(&self, rid: Rid) -> Result<MountDescriptor> {
        let paths = self.paths(rid);
        if paths.root.exists() {
            return Err(Error::AlreadyInState {
                rid,
                state: self.mount_state(rid)?.to_string(),
            });
        }
        let device = self.device(rid)?;

        let status = self.check_sequester_unlocked(rid).await?;
        if status.is_sequestered() {
            return Err(Error::Sequestered {
                rid,
                status: status.line,
            });
        }

        let md_partition = device.md_partition();
        let data_partition = device.data_partition();
        let import_dir = self.inspect_metadata_partition(rid, &md_partition).await?;
        if let Some(dir) = &import_dir {
            if !dir.is_dir() {
                return Err(Error::Inconsistent {
                    rid,
                    reason: format!("import marker points at missing {}", dir.display()),
                });
            }
        }

        let descriptor = match import_dir {
            None => MountDescriptor::Direct {
                md_partition,
                data_partition,
            },
            Some(external_dir) => MountDescriptor::Imported {
                md_partition,
                data_partition,
                external_dir,
            },
        };

        let mut rollback = Rollback::new();
        match self.apply_mount(rid, &descriptor, &mut rollback).await {
            Ok(()) => {
                rollback.commit();
                info!(%rid, state = %descriptor.state(), "Resource mounted");
                Ok(descriptor)
            }
            Err(cause) if rollback.is_empty() => Err(cause),
            Err(cause) => {
                let failures = rollback.unwind(self.ports().mounts.as_ref()).await;
                warn!(%rid, "Mount failed and was rolled back: {}", cause);
                Err(Error::PartialFailure {
                    rid,
                    operation: "mount",
                    cause: Box::new(cause),
                    rollback: failures,
                })
            }
        }
    }

    async fn apply_mount(
        &self,
        rid: Rid,
        descriptor: &MountDescriptor,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let paths = self.paths(rid);
        let mounts = self.ports().mounts.as_ref();
        let options = &self.config().mount_options;

        fs::create_dir_all(&self.config().depot_dir)?;
        fs::create_dir(&paths.root)?;
        rollback.created_dir(&paths.root);
        fs::create_dir(&paths.data)?;
        rollback.created_dir(&paths.data);

        match descriptor {
            MountDescriptor::Direct {
                md_partition,
                data_partition,
            } => {
                fs::create_dir(&paths.md)?;
                rollback.created_dir(&paths.md);
                mounts.mount(md_partition, &paths.md, options).await?;
                rollback.mounted(&paths.md);
                mounts.mount(data_partition, &paths.data, options).await?;
                rollback.mounted(&paths.data);
            }
            MountDescriptor::Imported {
                data_partition,
                external_dir,
                ..
            } => {
                mounts.mount(data_partition, &paths.data, options).await?;
                rollback.mounted(&paths.data);
                symlink(external_dir, &paths.md)?;
                rollback.created_file(&paths.md);
            }
        }

        fs::write(&paths.descriptor, format!("{}\n", descriptor))?;
        rollback.created_file(&paths.descriptor);
        debug!(%rid, %descriptor, "Descriptor written");
        Ok(())
    }

    /// Verify the settings identity and read the import marker of an
    /// unmounted resource's metadata partition
    async fn inspect_metadata_partition(
        &self,
        rid: Rid,
        md_partition: &Path,
    ) -> Result<Option<PathBuf>> {
        let mounts = self.ports().mounts.as_ref();
        let access = match mounts.mountpoint_of(md_partition).await? {
            Some(existing) => MetadataAccess::AlreadyMounted(existing),
            None => MetadataAccess::Transient(
                TransientMount::mount(
                    mounts,
                    &self.config().scratch_dir,
                    md_partition,
                    &self.config().mount_options,
                )
                .await?,
            ),
        };

        let inspected = inspect_tree(rid, access.path());
        access.release(mounts).await?;
        inspected
    }

    pub(crate) async fn umount_unlocked(&self, rid: Rid) -> Result<()> {
        let paths = self.paths(rid);
        let descriptor = self.read_descriptor(rid)?;
        let md_live = descriptor.external_dir().unwrap_or(&paths.md).to_path_buf();
        self.ensure_idle(rid, &[&paths.data, &md_live]).await?;

        let mounts = self.ports().mounts.as_ref();
        let mut failures = Vec::new();

        match unmount_and_remove(mounts, &paths.data).await {
            Ok(()) => debug!(%rid, "Data partition unmounted"),
            Err(e) => failures.push(format!("data: {}", e)),
        }

        match &descriptor {
            MountDescriptor::Direct { .. } => {
                if let Err(e) = unmount_and_remove(mounts, &paths.md).await {
                    failures.push(format!("md: {}", e));
                }
            }
            MountDescriptor::Imported { .. } => {
                if let Err(e) = remove_md_link(&paths.md) {
                    failures.push(format!("md: {}", e));
                }
            }
        }

        if failures.is_empty() {
            failures.extend(stray_entries(&paths.root)?);
        }
        if !failures.is_empty() {
            warn!(%rid, ?failures, "Unmount incomplete; descriptor kept");
            return Err(Error::IncompleteUnmount { rid, failures });
        }

        fs::remove_file(&paths.descriptor)?;
        fs::remove_dir(&paths.root)?;
        info!(%rid, "Resource unmounted");
        Ok(())
    }

    async fn force_cleanup_unlocked(&self, rid: Rid) -> Result<()> {
        let paths = self.paths(rid);
        if !paths.root.exists() {
            return Err(Error::AlreadyInState {
                rid,
                state: MountState::Unmounted.to_string(),
            });
        }
        let md_live = fs::read_link(&paths.md).unwrap_or_else(|_| paths.md.clone());
        self.ensure_idle(rid, &[&paths.data, &md_live]).await?;

        let mounts = self.ports().mounts.as_ref();
        let mut failures = Vec::new();

        if let Err(e) = unmount_and_remove(mounts, &paths.data).await {
            failures.push(format!("data: {}", e));
        }
        let md_is_link = fs::symlink_metadata(&paths.md)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        let md_result = if md_is_link {
            remove_md_link(&paths.md)
        } else {
            unmount_and_remove(mounts, &paths.md).await
        };
        if let Err(e) = md_result {
            failures.push(format!("md: {}", e));
        }
        if failures.is_empty() {
            failures.extend(stray_entries(&paths.root)?);
        }
        if failures.is_empty() {
            if let Err(e) = remove_if_exists(&paths.descriptor) {
                failures.push(format!("descriptor: {}", e));
            }
        }
        if failures.is_empty() {
            if let Err(e) = fs::remove_dir(&paths.root) {
                failures.push(format!("resource directory: {}", e));
            }
        }

        if failures.is_empty() {
            info!(%rid, "Resource directory cleaned up");
            Ok(())
        } else {
            Err(Error::IncompleteUnmount { rid, failures })
        }
    }
}

/// Identity check and import marker of a metadata tree
fn inspect_tree(rid: Rid, md_dir: &Path) -> Result<Option<PathBuf>> {
    let settings = md_dir.join(SETTINGS_FILE);
    let text = fs::read_to_string(&settings).map_err(|e| {
        Error::malformed(
            "resource settings",
            format!("cannot read {} for rid {}: {}", SETTINGS_FILE, rid, e),
        )
    })?;
    if !has_identity_marker(&text, rid) {
        return Err(Error::malformed(
            "resource settings",
            format!("{} for rid {} has no identity marker", SETTINGS_FILE, rid),
        ));
    }
    read_import_marker(md_dir)
}

async fn unmount_and_remove(mounts: &dyn MountTable, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if mounts.is_mountpoint(dir).await? {
        mounts.umount(dir).await?;
    }
    fs::remove_dir(dir)?;
    Ok(())
}

/// Entries of an emptied resource directory other than its descriptor
fn stray_entries(root: &Path) -> Result<Vec<String>> {
    let mut stray = Vec::new();
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name();
        if name != DESCRIPTOR_FILE {
            stray.push(format!("stray entry: {}", root.join(name).display()));
        }
    }
    Ok(stray)
}

fn remove_md_link(md: &Path) -> Result<()> {
    match fs::symlink_metadata(md) {
        Ok(meta) if meta.file_type().is_symlink() => Ok(fs::remove_file(md)?),
        Ok(_) => Err(Error::malformed(
            "metadata entry",
            format!("{} should be a symlink for an imported resource", md.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
