//! Batch Orchestrator
//!
//! Runs one lifecycle operation over many resources. Every RID gets its own
//! task; a semaphore bounds how many run at once. In [`BatchMode::Join`] the
//! caller gets a [`BatchReport`] with each RID's outcome. In
//! [`BatchMode::Detach`] the tasks are handed to a tracker, log their own
//! outcome, and can be awaited later with
//! [`BatchOrchestrator::wait_detached`].

use crate::batch::slots::SlotPlanner;
use crate::domain::ports::AssumeYes;
use crate::domain::{BlockDevice, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::{OptionScope, ResourceManager};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// One unit of batch work
pub type BatchUnit = Arc<dyn Fn(Arc<ResourceManager>, Rid) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a closure as a [`BatchUnit`]
pub fn unit<F>(f: F) -> BatchUnit
where
    F: Fn(Arc<ResourceManager>, Rid) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Whether a batch waits for its units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Wait for every unit and report each outcome
    #[default]
    Join,
    /// Return once units are launched; outcomes are only logged
    Detach,
}

/// Outcome of a batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub operation: &'static str,
    pub succeeded: Vec<Rid>,
    pub failed: Vec<(Rid, Error)>,
    /// Units launched in detached mode
    pub detached: Vec<Rid>,
}

impl BatchReport {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.detached.len()
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed",
            self.operation,
            self.succeeded.len(),
            self.failed.len()
        )?;
        if !self.detached.is_empty() {
            write!(f, ", {} detached", self.detached.len())?;
        }
        Ok(())
    }
}

/// Runs lifecycle operations across resources
pub struct BatchOrchestrator {
    manager: Arc<ResourceManager>,
    permits: Arc<Semaphore>,
    detached: TaskTracker,
}

impl BatchOrchestrator {
    pub fn new(manager: Arc<ResourceManager>) -> Self {
        let concurrency = manager.config().batch_concurrency;
        Self {
            manager,
            permits: Arc::new(Semaphore::new(concurrency)),
            detached: TaskTracker::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Run `unit` for every target
    ///
    /// One unit's failure never stops its siblings. After cancellation no
    /// new unit starts; those not yet started are reported as `Cancelled`.
    pub async fn run(
        &self,
        operation: &'static str,
        targets: Vec<Rid>,
        mode: BatchMode,
        unit: BatchUnit,
    ) -> BatchReport {
        let mut report = BatchReport::new(operation);
        let mut tasks = JoinSet::new();
        info!(operation, units = targets.len(), ?mode, "Starting batch");

        for rid in targets {
            if self.manager.cancellation().is_cancelled() {
                report.failed.push((rid, Error::Cancelled));
                continue;
            }
            let task = run_unit(
                self.manager.clone(),
                self.permits.clone(),
                operation,
                rid,
                unit.clone(),
            );
            match mode {
                BatchMode::Join => {
                    tasks.spawn(task);
                }
                BatchMode::Detach => {
                    self.detached.spawn(async move {
                        match task.await {
                            (rid, Ok(())) => info!(operation, %rid, "Detached unit finished"),
                            (rid, Err(e)) => error!(operation, %rid, "Detached unit failed: {}", e),
                        }
                    });
                    report.detached.push(rid);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((rid, Ok(()))) => report.succeeded.push(rid),
                Ok((rid, Err(e))) => {
                    warn!(operation, %rid, "Unit failed: {}", e);
                    report.failed.push((rid, e));
                }
                Err(e) => error!(operation, "Batch task aborted: {}", e),
            }
        }

        report.succeeded.sort();
        report.failed.sort_by_key(|(rid, _)| *rid);
        info!(operation, %report, "Batch finished");
        report
    }

    /// Wait for every detached unit launched so far
    pub async fn wait_detached(&self) {
        self.detached.close();
        self.detached.wait().await;
        self.detached.reopen();
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Mount every indexed resource not yet mounted
    pub async fn mount_all(&self, mode: BatchMode) -> Result<BatchReport> {
        let targets = self
            .manager
            .index()?
            .rids()
            .into_iter()
            .filter(|rid| !self.manager.paths(*rid).root.exists())
            .collect();
        Ok(self
            .run(
                "mount_all",
                targets,
                mode,
                unit(|manager, rid| async move { manager.mount(rid).await.map(|_| ()) }.boxed()),
            )
            .await)
    }

    /// Unmount every mounted resource
    pub async fn umount_all(&self, mode: BatchMode) -> Result<BatchReport> {
        let targets = self.manager.list_rids()?;
        Ok(self
            .run(
                "umount_all",
                targets,
                mode,
                unit(|manager, rid| async move { manager.umount(rid).await }.boxed()),
            )
            .await)
    }

    /// Check every indexed resource
    pub async fn fsck_all(&self, mode: BatchMode) -> Result<BatchReport> {
        let targets = self.manager.index()?.rids();
        Ok(self
            .run(
                "fsck_all",
                targets,
                mode,
                unit(|manager, rid| async move { manager.fsck(rid).await.map(|_| ()) }.boxed()),
            )
            .await)
    }

    /// Defragment every mounted resource
    pub async fn defrag_all(&self, mode: BatchMode) -> Result<BatchReport> {
        let targets = self.manager.list_rids()?;
        Ok(self
            .run(
                "defrag_all",
                targets,
                mode,
                unit(|manager, rid| {
                    async move {
                        let defrag = manager.config().defrag.clone();
                        manager
                            .defrag(rid, &defrag.log_dir, defrag.extent_threshold)
                            .await
                            .map(|_| ())
                    }
                    .boxed()
                }),
            )
            .await)
    }

    /// Provision every free slot of this depot on a candidate device
    ///
    /// Each slot is created destructively, given the default options and
    /// imported to the default import directory.
    pub async fn format_empty_slots(&self, planner: &SlotPlanner, mode: BatchMode) -> Result<BatchReport> {
        let index = self.manager.index()?;
        let blank = self.manager.ports().disks.blank_disks().await?;
        let plan: BTreeMap<Rid, BlockDevice> = planner.plan(&index, &blank)?.into_iter().collect();
        for (rid, device) in &plan {
            info!(%rid, %device, "Slot planned");
        }
        let targets = plan.keys().copied().collect();
        let plan = Arc::new(plan);

        Ok(self
            .run(
                "format_empty_slots",
                targets,
                mode,
                unit(move |manager, rid| {
                    let plan = plan.clone();
                    async move {
                        let device = plan.get(&rid).cloned().ok_or_else(|| {
                            Error::Internal(format!("no device planned for rid {}", rid))
                        })?;
                        format_slot(&manager, rid, &device).await
                    }
                    .boxed()
                }),
            )
            .await)
    }
}

/// Acquire a permit and run one unit, turning a panic into an error
async fn run_unit(
    manager: Arc<ResourceManager>,
    permits: Arc<Semaphore>,
    operation: &'static str,
    rid: Rid,
    unit: BatchUnit,
) -> (Rid, Result<()>) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (rid, Err(Error::Cancelled)),
    };
    if manager.cancellation().is_cancelled() {
        return (rid, Err(Error::Cancelled));
    }
    let outcome = AssertUnwindSafe(unit(manager, rid)).catch_unwind().await;
    let result = outcome.unwrap_or_else(|_| {
        Err(Error::Internal(format!("{} of rid {} panicked", operation, rid)))
    });
    (rid, result)
}

async fn format_slot(manager: &ResourceManager, rid: Rid, device: &BlockDevice) -> Result<()> {
    let import_dir = manager.config().import_dir.clone();
    let stale = import_dir.join(rid.import_dir_name());
    if stale.is_dir() {
        let aside = import_dir.join(format!(
            "old-{}-{}",
            rid.import_dir_name(),
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        warn!(%rid, from = %stale.display(), to = %aside.display(), "Moving stale import aside");
        fs::rename(&stale, &aside)?;
    }

    manager.create(rid, device, true, &AssumeYes).await?;
    for (key, value) in &manager.config().slots.default_options {
        manager.set_rid_option(rid, OptionScope::Rid, key, value).await?;
    }
    manager.import(rid, &import_dir, false).await?;
    Ok(())
}
