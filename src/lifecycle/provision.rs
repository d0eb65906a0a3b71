//! Partition provisioner
//!
//! Turns a raw block device into a two-partition resource: a fixed-size ext4
//! metadata partition labelled `rid-md-<RID>` and an ext4 data partition
//! labelled `rid-data-<RID>` spanning the rest of the device.

use crate::domain::ports::Confirm;
use crate::domain::{BlockDevice, MountDescriptor, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::{ResourceManager, Rollback, SETTINGS_FILE};
use backoff::ExponentialBackoff;
use std::fs;
use std::time::Duration;
use tracing::{debug, info, warn};

impl ResourceManager {
    /// Provision `device` as resource `rid` and leave it mounted
    ///
    /// Existing partitions are removed only after `confirm` agrees, unless
    /// `assume_destructive` is set.
    pub async fn create(
        &self,
        rid: Rid,
        device: &BlockDevice,
        assume_destructive: bool,
        confirm: &dyn Confirm,
    ) -> Result<MountDescriptor> {
        self.instrumented("create", async {
            let _lock = self.lock(rid).await?;
            self.create_unlocked(rid, device, assume_destructive, confirm)
                .await
        })
        .await
    }

    pub(crate) async fn create_unlocked(
        &self,
        rid: Rid,
        device: &BlockDevice,
        assume_destructive: bool,
        confirm: &dyn Confirm,
    ) -> Result<MountDescriptor> {
        let disks = self.ports().disks.as_ref();
        let mounts = self.ports().mounts.as_ref();
        let paths = self.paths(rid);

        if !disks.is_block_device(device).await? {
            return Err(Error::DeviceNotFound {
                device: device.to_string(),
            });
        }
        if paths.root.exists() {
            return Err(Error::AlreadyInState {
                rid,
                state: "provisioned and mounted".into(),
            });
        }
        if let Some(existing) = self.index()?.device_for(rid) {
            if existing != device {
                return Err(Error::AlreadyInState {
                    rid,
                    state: format!("provisioned on {}", existing),
                });
            }
        }

        let partitions = disks.list_partitions(device).await?;
        if !partitions.is_empty() && !assume_destructive {
            let question = format!(
                "{} has {} partition(s). Delete them and create resource {}?",
                device,
                partitions.len(),
                rid
            );
            if !confirm.confirm(&question) {
                return Err(Error::Declined(format!(
                    "existing partitions on {} kept",
                    device
                )));
            }
        }
        self.checkpoint()?;

        info!(%rid, %device, "Provisioning resource");
        for entry in mounts.mounts_of_disk(device).await? {
            debug!(partition = %entry.device.display(), target = %entry.target.display(), "Unmounting");
            mounts.umount(&entry.target).await?;
        }
        for number in &partitions {
            disks.remove_partition(device, *number).await?;
        }
        disks.make_gpt_label(device).await?;
        disks
            .create_resource_partitions(device, self.config().md_partition_mb)
            .await?;
        self.wait_for_partitions(device).await?;

        let md_partition = device.md_partition();
        let data_partition = device.data_partition();
        disks.format_ext4(&md_partition, &rid.md_label()).await?;
        disks.format_ext4(&data_partition, &rid.data_label()).await?;
        self.checkpoint()?;

        let descriptor = MountDescriptor::Direct {
            md_partition,
            data_partition,
        };
        let mut rollback = Rollback::new();
        match self.populate(rid, &descriptor, &mut rollback).await {
            Ok(()) => {
                rollback.commit();
                info!(%rid, %device, "Resource created");
                Ok(descriptor)
            }
            Err(cause) => {
                let failures = rollback.unwind(mounts).await;
                warn!(%rid, "Create failed and was rolled back: {}", cause);
                Err(Error::PartialFailure {
                    rid,
                    operation: "create",
                    cause: Box::new(cause),
                    rollback: failures,
                })
            }
        }
    }

    /// Mount the fresh partitions and run the metadata initializer
    async fn populate(
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
        fs::create_dir(&paths.md)?;
        rollback.created_dir(&paths.md);
        fs::create_dir(&paths.data)?;
        rollback.created_dir(&paths.data);

        mounts
            .mount(descriptor.md_partition(), &paths.md, options)
            .await?;
        rollback.mounted(&paths.md);
        mounts
            .mount(descriptor.data_partition(), &paths.data, options)
            .await?;
        rollback.mounted(&paths.data);

        let settings = self
            .ports()
            .initializer
            .initialize(rid, &paths.data, &paths.md)
            .await?;
        fs::write(paths.md.join(SETTINGS_FILE), settings)?;

        fs::write(&paths.descriptor, format!("{}\n", descriptor))?;
        rollback.created_file(&paths.descriptor);
        Ok(())
    }

    /// Poll until the kernel exposes both new partitions
    async fn wait_for_partitions(&self, device: &BlockDevice) -> Result<()> {
        let disks = self.ports().disks.as_ref();
        let expected = [device.md_partition(), device.data_partition()];
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.config().timeouts.settle()),
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(policy, || async {
            for partition in &expected {
                let present = disks
                    .partition_exists(partition)
                    .await
                    .map_err(backoff::Error::permanent)?;
                if !present {
                    debug!(partition = %partition.display(), "Waiting for partition");
                    return Err(backoff::Error::transient(Error::Timeout {
                        command: format!("wait for {}", partition.display()),
                        after: self.config().timeouts.settle(),
                    }));
                }
            }
            Ok(())
        })
        .await
    }
}
