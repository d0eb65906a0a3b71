//! Resource listing

use crate::device::mounted_rids;
use crate::domain::{LedgerStatus, MountState, ResourceSummary, Rid};
use crate::error::Result;
use crate::lifecycle::{ResourceManager, SequesterLedger};
use std::path::PathBuf;
use tracing::warn;

impl ResourceManager {
    /// RIDs mounted on this node
    pub fn list_rids(&self) -> Result<Vec<Rid>> {
        mounted_rids(&self.config().depot_dir)
    }

    /// Summaries of every mounted resource
    ///
    /// Read-only: the ledger is read through the mounted metadata path, so
    /// nothing is mounted or locked.
    pub fn list(&self) -> Result<Vec<ResourceSummary>> {
        let mut summaries = Vec::new();
        for rid in self.list_rids()? {
            let paths = self.paths(rid);
            let descriptor = match self.read_descriptor_if_present(rid) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(%rid, "Unreadable descriptor: {}", e);
                    None
                }
            };
            let sequester = SequesterLedger::in_metadata(&paths.md)
                .current()
                .unwrap_or_else(|_| LedgerStatus::not_sequestered());
            summaries.push(ResourceSummary {
                rid,
                state: descriptor
                    .as_ref()
                    .map(|d| d.state())
                    .unwrap_or(MountState::Unmounted),
                md_partition: descriptor.as_ref().map(|d| d.md_partition().to_path_buf()),
                data_partition: descriptor.as_ref().map(|d| d.data_partition().to_path_buf()),
                import_dir: descriptor
                    .as_ref()
                    .and_then(|d| d.external_dir())
                    .map(PathBuf::from),
                sequester,
            });
        }
        Ok(summaries)
    }
}
