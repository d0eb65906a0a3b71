//! Daemon configuration merge
//!
//! The daemon reads a single `ibp.conf`, assembled from the depot-wide
//! `ibp.settings` and `phoebus.settings` followed by every mounted
//! resource's `rid.settings`.

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Merged daemon configuration file
pub const MERGED_CONFIG: &str = "ibp.conf";

/// Depot-wide settings, in merge order
pub const DEPOT_SETTINGS: &[&str] = &["ibp.settings", "phoebus.settings"];

/// Write `<depot_dir>/ibp.conf`
///
/// Depot-wide settings are required; a resource without a settings file is
/// skipped with a warning. The file is replaced atomically.
pub fn merge_config(depot_dir: &Path, resource_settings: &[PathBuf]) -> Result<PathBuf> {
    let mut merged = Vec::new();
    for name in DEPOT_SETTINGS {
        let path = depot_dir.join(name);
        let contents = fs::read(&path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        merged.extend_from_slice(&contents);
    }

    let mut included = 0;
    for settings in resource_settings {
        match fs::read(settings) {
            Ok(contents) => {
                merged.extend_from_slice(&contents);
                included += 1;
            }
            Err(e) => warn!(file = %settings.display(), "Skipping resource settings: {}", e),
        }
    }

    let target = depot_dir.join(MERGED_CONFIG);
    let staging = depot_dir.join(format!("{}.tmp", MERGED_CONFIG));
    {
        let mut file = fs::File::create(&staging)?;
        file.write_all(&merged)?;
        file.sync_all()?;
    }
    fs::rename(&staging, &target)?;
    debug!(bytes = merged.len(), "Daemon configuration written");
    info!(resources = included, path = %target.display(), "Merged daemon configuration");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_merge_order() {
        let dir = TempDir::new().unwrap();
        let depot = dir.path();
        fs::write(depot.join("ibp.settings"), "[server]\nport = 6714\n").unwrap();
        fs::write(depot.join("phoebus.settings"), "[phoebus]\n").unwrap();
        let rid_a = depot.join("a.settings");
        fs::write(&rid_a, "[resource 1501]\nrid = 1501\n").unwrap();
        let missing = depot.join("gone.settings");

        let path = merge_config(depot, &[rid_a, missing]).unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "[server]\nport = 6714\n[phoebus]\n[resource 1501]\nrid = 1501\n"
        );
        assert!(!depot.join("ibp.conf.tmp").exists());
    }

    #[test]
    fn test_missing_depot_settings() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ibp.settings"), "").unwrap();
        assert_matches!(
            merge_config(dir.path(), &[]),
            Err(Error::Configuration(_))
        );
        assert!(!dir.path().join(MERGED_CONFIG).exists());
    }
}
