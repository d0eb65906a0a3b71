//! Sequester ledger
//!
//! Append-only quarantine log kept in the metadata tree, so it travels with
//! import and export. The current status is the last non-empty line.

use crate::domain::{LedgerEntry, LedgerStatus, MountDescriptor, Rid, SequesterState};
use crate::error::Result;
use crate::lifecycle::transient::{MetadataAccess, TransientMount};
use crate::lifecycle::{read_import_marker, ResourceManager, LEDGER_FILE};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The `SEQUESTER_STATUS` file of one metadata tree
#[derive(Debug, Clone)]
pub struct SequesterLedger {
    path: PathBuf,
}

impl SequesterLedger {
    pub fn in_metadata(md_dir: &Path) -> Self {
        Self {
            path: md_dir.join(LEDGER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current status; an absent ledger is `NOT_SEQUESTERED`
    pub fn current(&self) -> Result<LedgerStatus> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(LedgerStatus::from_ledger(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(LedgerStatus::not_sequestered())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Result of a sequester or unsequester request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequesterOutcome {
    pub rid: Rid,
    /// False when the ledger already had the requested state
    pub changed: bool,
    pub status: LedgerStatus,
}

impl std::fmt::Display for SequesterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.status.state {
            SequesterState::Sequestered => "sequestered",
            SequesterState::NotSequestered => "unsequestered",
        };
        if self.changed {
            write!(f, "Rid {} is now {}.", self.rid, state)
        } else {
            write!(f, "Rid {} is already {}.", self.rid, state)
        }
    }
}

impl ResourceManager {
    /// Current sequester status of a resource
    pub async fn check_sequester(&self, rid: Rid) -> Result<LedgerStatus> {
        self.instrumented("check_sequester", async {
            let _lock = self.lock(rid).await?;
            self.check_sequester_unlocked(rid).await
        })
        .await
    }

    /// Quarantine a resource
    pub async fn sequester(&self, rid: Rid, reason: &str) -> Result<SequesterOutcome> {
        self.instrumented("sequester", async {
            let _lock = self.lock(rid).await?;
            self.record_sequester(rid, SequesterState::Sequestered, reason)
                .await
        })
        .await
    }

    /// Lift a quarantine
    pub async fn unsequester(&self, rid: Rid, reason: &str) -> Result<SequesterOutcome> {
        self.instrumented("unsequester", async {
            let _lock = self.lock(rid).await?;
            self.record_sequester(rid, SequesterState::NotSequestered, reason)
                .await
        })
        .await
    }

    pub(crate) async fn check_sequester_unlocked(&self, rid: Rid) -> Result<LedgerStatus> {
        let access = self.open_metadata(rid).await?;
        let status = SequesterLedger::in_metadata(access.path()).current();
        access.release(self.ports().mounts.as_ref()).await?;
        if let Ok(status) = &status {
            debug!(%rid, %status, "Sequester status");
        }
        status
    }

    async fn record_sequester(
        &self,
        rid: Rid,
        target: SequesterState,
        reason: &str,
    ) -> Result<SequesterOutcome> {
        self.checkpoint()?;
        let access = self.open_metadata(rid).await?;
        let ledger = SequesterLedger::in_metadata(access.path());

        let outcome = (|| -> Result<SequesterOutcome> {
            let current = ledger.current()?;
            if current.state == target {
                return Ok(SequesterOutcome {
                    rid,
                    changed: false,
                    status: current,
                });
            }
            let entry = LedgerEntry::now(target, reason);
            ledger.append(&entry)?;
            Ok(SequesterOutcome {
                rid,
                changed: true,
                status: LedgerStatus::from_line(&entry.to_string()),
            })
        })();

        access.release(self.ports().mounts.as_ref()).await?;
        if let Ok(outcome) = &outcome {
            if outcome.changed {
                info!(%rid, state = %target, reason, "Sequester ledger updated");
            }
        }
        outcome
    }

    /// Locate the live metadata tree of a resource
    ///
    /// Order: the external directory of an imported mount, the metadata
    /// partition wherever it is already mounted (left mounted), the default
    /// import directory, and finally a transient mount of the partition. A
    /// partition carrying an import marker redirects to the marker's target.
    pub async fn open_metadata(&self, rid: Rid) -> Result<MetadataAccess> {
        if let Some(MountDescriptor::Imported { external_dir, .. }) =
            self.read_descriptor_if_present(rid)?
        {
            return Ok(MetadataAccess::External(external_dir));
        }

        let md_partition = self.device(rid)?.md_partition();
        let mounts = self.ports().mounts.as_ref();

        if let Some(mountpoint) = mounts.mountpoint_of(&md_partition).await? {
            if let Some(external) = read_import_marker(&mountpoint)? {
                return Ok(MetadataAccess::External(external));
            }
            return Ok(MetadataAccess::AlreadyMounted(mountpoint));
        }

        let default_import = self.paths(rid).default_import;
        if default_import.is_dir() {
            return Ok(MetadataAccess::External(default_import));
        }

        let transient = TransientMount::mount(
            mounts,
            &self.config().scratch_dir,
            &md_partition,
            &self.config().mount_options,
        )
        .await?;
        match read_import_marker(transient.path()) {
            Ok(Some(external)) => {
                transient.release(mounts).await?;
                Ok(MetadataAccess::External(external))
            }
            Ok(None) => Ok(MetadataAccess::Transient(transient)),
            Err(e) => {
                transient.release(mounts).await?;
                Err(e)
            }
        }
    }
}
