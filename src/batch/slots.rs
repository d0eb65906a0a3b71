//! Empty-slot planning
//!
//! Each depot owns a contiguous block of RIDs derived from its number. A
//! slot is free when its RID has no labelled device; candidates for the
//! free slots are blank disks and disks still labelled with a RID that
//! belongs to another depot.

use crate::config::SlotConfig;
use crate::device::DeviceIndex;
use crate::domain::{BlockDevice, Rid};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Planner for a single depot
#[derive(Debug, Clone)]
pub struct SlotPlanner {
    config: SlotConfig,
    depot_number: u32,
}

impl SlotPlanner {
    pub fn new(config: SlotConfig, depot_number: u32) -> Self {
        Self {
            config,
            depot_number,
        }
    }

    /// Planner for the depot named by `hostname`, unless the configuration
    /// fixes the depot number
    pub fn for_host(config: SlotConfig, hostname: &str) -> Result<Self> {
        let depot_number = match config.depot_number {
            Some(number) => number,
            None => depot_number_from_hostname(&config.hostname_prefix, hostname)?,
        };
        Ok(Self::new(config, depot_number))
    }

    pub fn depot_number(&self) -> u32 {
        self.depot_number
    }

    /// RIDs belonging to this depot, ascending
    pub fn valid_rids(&self) -> Result<Vec<Rid>> {
        let base = self
            .config
            .first_rid
            .checked_add(self.config.drives_per_depot.saturating_mul(self.depot_number))
            .and_then(|v| v.checked_sub(self.config.first_depot))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "depot {} has no valid RID range",
                    self.depot_number
                ))
            })?;
        (0..self.config.drives_per_depot)
            .map(|i| Rid::new(base + i))
            .collect()
    }

    /// Pair free slots with candidate devices, lowest RID first
    pub fn plan(&self, index: &DeviceIndex, blank_disks: &[BlockDevice]) -> Result<Vec<(Rid, BlockDevice)>> {
        let valid: BTreeSet<Rid> = self.valid_rids()?.into_iter().collect();
        let free: Vec<Rid> = valid
            .iter()
            .copied()
            .filter(|rid| !index.resource_exists(*rid))
            .collect();

        let mut candidates: Vec<BlockDevice> = blank_disks.to_vec();
        for (rid, device) in index.resource_to_device() {
            if !valid.contains(rid) && !candidates.contains(device) {
                debug!(%rid, %device, "Reclaiming device labelled for another depot");
                candidates.push(device.clone());
            }
        }

        debug!(free = free.len(), candidates = candidates.len(), "Slot plan");
        Ok(free.into_iter().zip(candidates).collect())
    }
}

/// Depot number from a hostname such as `cms-depot12.example.org`
pub fn depot_number_from_hostname(prefix: &str, hostname: &str) -> Result<u32> {
    let short = hostname.split('.').next().unwrap_or(hostname);
    short
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "hostname '{}' does not match '{}<N>'; set slots.depot_number",
                hostname, prefix
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    #[test]
    fn test_hostname_parsing() {
        assert_eq!(depot_number_from_hostname("cms-depot", "cms-depot3.local").unwrap(), 3);
        assert_eq!(depot_number_from_hostname("cms-depot", "cms-depot12").unwrap(), 12);
        assert_matches!(
            depot_number_from_hostname("cms-depot", "storage7"),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_valid_rids() {
        let planner = SlotPlanner::new(SlotConfig::default(), 1);
        let rids = planner.valid_rids().unwrap();
        assert_eq!(rids.len(), 36);
        assert_eq!(rids[0], rid(1536));
        assert_eq!(rids[35], rid(1571));
    }

    #[test]
    fn test_plan_pairs_free_slots() {
        let config = SlotConfig {
            drives_per_depot: 3,
            depot_number: Some(1),
            ..SlotConfig::default()
        };
        let planner = SlotPlanner::for_host(config, "ignored").unwrap();
        // valid: 1503, 1504, 1505
        let index = DeviceIndex::from_pairs([
            (rid(1503), BlockDevice::new("/dev/sdb")),
            (rid(4100), BlockDevice::new("/dev/sdc")),
        ]);
        let blank = vec![BlockDevice::new("/dev/sdd")];

        let plan = planner.plan(&index, &blank).unwrap();
        assert_eq!(
            plan,
            vec![
                (rid(1504), BlockDevice::new("/dev/sdd")),
                (rid(1505), BlockDevice::new("/dev/sdc")),
            ]
        );
    }
}
