//! Server coordination
//!
//! Keeps the storage daemon in step with the resources on disk: repairing a
//! single RID (detach, unmount, check, mount, re-attach) and reconciling the
//! expected drive count against what the OS and the daemon see.

use crate::domain::ports::ServerControlRef;
use crate::domain::{DaemonProcess, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::ResourceManager;
use crate::server::merge::merge_config;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Drive counts seen from each vantage point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Drives this node should have
    pub expected: usize,
    /// RIDs with a data label visible to the OS
    pub visible: BTreeSet<Rid>,
    /// RIDs the daemon serves
    pub attached: BTreeSet<Rid>,
    /// Visible but unattached RIDs that are quarantined
    pub sequestered: Vec<Rid>,
    /// Visible but unattached RIDs to repair
    pub repair: Vec<Rid>,
    /// Attached RIDs the OS no longer sees
    pub vanished: Vec<Rid>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.expected == self.visible.len() && self.expected == self.attached.len()
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_consistent() {
            write!(f, "All Drives = {}", self.expected)?;
            if !self.sequestered.is_empty() {
                write!(f, " (including {} sequestered drives)", self.sequestered.len())?;
            }
            return Ok(());
        }
        write!(
            f,
            "Expected = {}, OS = {}, Server = {}",
            self.expected,
            self.visible.len(),
            self.attached.len()
        )?;
        if !self.repair.is_empty() {
            write!(f, "; repair: {}", join(&self.repair))?;
        }
        if !self.sequestered.is_empty() {
            write!(f, "; sequestered: {}", join(&self.sequestered))?;
        }
        if !self.vanished.is_empty() {
            write!(f, "; vanished: {}", join(&self.vanished))?;
        }
        Ok(())
    }
}

fn join(rids: &[Rid]) -> String {
    rids.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drives the daemon-facing workflows
pub struct ServerCoordinator {
    manager: Arc<ResourceManager>,
    server: ServerControlRef,
}

impl ServerCoordinator {
    pub fn new(manager: Arc<ResourceManager>, server: ServerControlRef) -> Self {
        Self { manager, server }
    }

    pub fn server(&self) -> &ServerControlRef {
        &self.server
    }

    /// Start (or restart) the daemon
    ///
    /// Without an explicit `config`, `ibp.conf` is rebuilt from the mounted
    /// resources and used.
    pub async fn start_daemon(&self, config: Option<&Path>) -> Result<DaemonProcess> {
        let config = match config {
            Some(path) => path.to_path_buf(),
            None => self.merge_config()?,
        };
        let process = self.server.start(&config).await?;
        info!(%process, config = %config.display(), "Storage daemon running");
        Ok(process)
    }

    /// Rebuild `ibp.conf` from the depot settings and mounted resources
    pub fn merge_config(&self) -> Result<PathBuf> {
        let settings: Vec<PathBuf> = self
            .manager
            .list_rids()?
            .into_iter()
            .map(|rid| self.manager.paths(rid).settings())
            .collect();
        merge_config(&self.manager.config().depot_dir, &settings)
    }

    /// Cycle a resource through the daemon and a filesystem check
    pub async fn repair(&self, rid: Rid) -> Result<()> {
        if !self.manager.index()?.resource_exists(rid) {
            return Err(Error::ResourceNotFound {
                rid,
                reason: "not visible to the OS; the drive may need a reboot to reappear".into(),
            });
        }

        if self.server.attached_rids().await?.contains(&rid) {
            info!(%rid, "Detaching before repair");
            self.server.detach(rid, "Repairing rid").await?;
        }
        if self.manager.paths(rid).root.exists() {
            info!(%rid, "Unmounting before repair");
            self.manager.umount(rid).await?;
        }
        self.manager.fsck(rid).await?;
        self.manager.mount(rid).await?;
        self.merge_config()?;
        self.server.attach(rid, "Attaching repaired rid").await?;
        info!(%rid, "Resource repaired");
        Ok(())
    }

    /// Compare expected, visible and attached drives
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let expected = self.expected_drives()?;
        let visible: BTreeSet<Rid> = self.manager.index()?.rids().into_iter().collect();
        let attached = self.server.attached_rids().await?;

        let mut report = ReconcileReport {
            expected,
            vanished: attached.difference(&visible).copied().collect(),
            ..ReconcileReport::default()
        };
        for rid in visible.difference(&attached).copied() {
            match self.manager.check_sequester(rid).await {
                Ok(status) if status.is_sequestered() => report.sequestered.push(rid),
                Ok(_) => report.repair.push(rid),
                Err(e) => {
                    warn!(%rid, "Cannot read sequester status: {}", e);
                    report.repair.push(rid);
                }
            }
        }
        report.visible = visible;
        report.attached = attached;
        Ok(report)
    }

    /// Reconcile and repair every unattached, unsequestered RID
    pub async fn reconcile_and_repair(&self) -> Result<(ReconcileReport, Vec<(Rid, Error)>)> {
        let report = self.reconcile().await?;
        let mut failures = Vec::new();
        if report.is_consistent() {
            return Ok((report, failures));
        }
        for rid in &report.repair {
            if let Err(e) = self.repair(*rid).await {
                warn!(%rid, "Repair failed: {}", e);
                failures.push((*rid, e));
            }
        }
        Ok((report, failures))
    }

    fn expected_drives(&self) -> Result<usize> {
        let path = &self.manager.config().server.drive_count_file;
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        contents
            .trim()
            .parse()
            .map_err(|e| Error::malformed("drive count", format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use tempfile::TempDir;

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    fn coordinator(host: &Arc<FakeHost>) -> ServerCoordinator {
        let manager = ResourceManager::new(host.config(), host.ports()).unwrap();
        ServerCoordinator::new(Arc::new(manager), host.clone())
    }

    fn write_depot_settings(host: &FakeHost, drives: usize) {
        let config = host.config();
        fs::create_dir_all(&config.depot_dir).unwrap();
        fs::write(config.depot_dir.join("ibp.settings"), "[server]\n").unwrap();
        fs::write(config.depot_dir.join("phoebus.settings"), "").unwrap();
        let count = &config.server.drive_count_file;
        fs::create_dir_all(count.parent().unwrap()).unwrap();
        fs::write(count, format!("{}\n", drives)).unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_finds_unattached() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new(dir.path());
        host.add_resource("sdb", rid(1501)).unwrap();
        host.add_resource("sdc", rid(1502)).unwrap();
        host.add_resource("sdd", rid(1503)).unwrap();
        host.set_attached([rid(1501), rid(1599)]);
        write_depot_settings(&host, 3);
        let coordinator = coordinator(&host);
        coordinator.manager.sequester(rid(1503), "bad SMART").await.unwrap();

        let report = coordinator.reconcile().await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.repair, vec![rid(1502)]);
        assert_eq!(report.sequestered, vec![rid(1503)]);
        assert_eq!(report.vanished, vec![rid(1599)]);
    }

    #[tokio::test]
    async fn test_repair_cycles_resource() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new(dir.path());
        host.add_resource("sdb", rid(1501)).unwrap();
        host.set_attached([rid(1501)]);
        write_depot_settings(&host, 1);
        let coordinator = coordinator(&host);
        coordinator.manager.mount(rid(1501)).await.unwrap();

        coordinator.repair(rid(1501)).await.unwrap();

        assert!(host.attached().contains(&rid(1501)));
        assert!(coordinator.manager.paths(rid(1501)).descriptor.is_file());
        assert_eq!(host.checked().len(), 2);
        let merged = fs::read_to_string(host.config().depot_dir.join("ibp.conf")).unwrap();
        assert!(merged.contains("[resource 1501]"));
        let commands = host.commands();
        let detach = commands.iter().position(|c| c.starts_with("detach")).unwrap();
        let attach = commands.iter().position(|c| c.starts_with("attach")).unwrap();
        assert!(detach < attach);
    }

    #[tokio::test]
    async fn test_start_daemon_restarts_on_merged_config() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new(dir.path());
        host.add_resource("sdb", rid(1501)).unwrap();
        write_depot_settings(&host, 1);
        let coordinator = coordinator(&host);
        coordinator.manager.mount(rid(1501)).await.unwrap();

        let first = coordinator.start_daemon(None).await.unwrap();
        let second = coordinator.start_daemon(None).await.unwrap();

        assert_ne!(first.pid, second.pid);
        assert_eq!(coordinator.server().status().await.unwrap(), Some(second.clone()));
        let merged = host.config().depot_dir.join("ibp.conf");
        assert!(fs::read_to_string(&merged).unwrap().contains("[resource 1501]"));
        let commands = host.commands();
        let quit = commands
            .iter()
            .position(|c| c == &format!("kill -QUIT {}", first.pid))
            .unwrap();
        let restart = commands
            .iter()
            .rposition(|c| c == &format!("ibp_server {}", merged.display()))
            .unwrap();
        assert!(quit < restart);

        assert_eq!(coordinator.server().stop().await.unwrap(), Some(second));
        assert_eq!(coordinator.server().status().await.unwrap(), None);
    }
}
