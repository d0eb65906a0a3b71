//! Filesystem maintenance
//!
//! `fsck` checks every unmounted partition of a resource's device; `defrag`
//! walks a mounted data tree and defragments files above an extent
//! threshold, logging each file it touches.

use crate::domain::Rid;
use crate::error::{Error, Result};
use crate::lifecycle::ResourceManager;
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Highest partition number probed on a resource device
const MAX_PARTITIONS: u32 = 128;

/// Data-tree directories never defragmented
const DEFRAG_SKIP: &[&str] = &["deleted_trash", "expired_trash", "lost+found"];

const BANNER: &str = "##########################################################";

/// Outcome of a filesystem check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub rid: Option<Rid>,
    /// Partitions checked
    pub checked: Vec<PathBuf>,
    /// Partitions skipped because they were mounted
    pub skipped: Vec<PathBuf>,
}

/// Outcome of a defragmentation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DefragReport {
    pub rid: Option<Rid>,
    pub scanned: usize,
    pub defragmented: usize,
    pub log: PathBuf,
}

impl ResourceManager {
    /// Check the resource's unmounted partitions
    pub async fn fsck(&self, rid: Rid) -> Result<FsckReport> {
        self.instrumented("fsck", async {
            let _lock = self.lock(rid).await?;
            self.fsck_unlocked(rid).await
        })
        .await
    }

    pub(crate) async fn fsck_unlocked(&self, rid: Rid) -> Result<FsckReport> {
        let device = self.device(rid)?;
        let disks = self.ports().disks.as_ref();
        let mounts = self.ports().mounts.as_ref();
        let mut report = FsckReport {
            rid: Some(rid),
            ..FsckReport::default()
        };

        for number in 1..=MAX_PARTITIONS {
            let partition = device.partition(number);
            if !disks.partition_exists(&partition).await? {
                continue;
            }
            if let Some(target) = mounts.mountpoint_of(&partition).await? {
                debug!(%rid, partition = %partition.display(), at = %target.display(), "Skipping mounted partition");
                report.skipped.push(partition);
                continue;
            }
            self.checkpoint()?;
            info!(%rid, partition = %partition.display(), "Checking filesystem");
            self.ports().filesystems.check(&partition).await?;
            report.checked.push(partition);
        }
        Ok(report)
    }

    /// Defragment fragmented files of a mounted resource
    pub async fn defrag(&self, rid: Rid, log_dir: &Path, extent_threshold: u64) -> Result<DefragReport> {
        self.instrumented("defrag", async {
            let _lock = self.lock(rid).await?;
            self.defrag_unlocked(rid, log_dir, extent_threshold).await
        })
        .await
    }

    pub(crate) async fn defrag_unlocked(
        &self,
        rid: Rid,
        log_dir: &Path,
        extent_threshold: u64,
    ) -> Result<DefragReport> {
        let data = self.paths(rid).data;
        self.read_descriptor(rid)?;
        let files = tokio::task::spawn_blocking({
            let data = data.clone();
            move || collect_files(&data)
        })
        .await
        .map_err(|e| Error::Internal(format!("data walk failed: {}", e)))??;

        fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(format!("extents-rid-{}.log", rid));
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        log.write_all(
            format!(
                "# TIME START RID {} SCAN - {}\n{}\n",
                rid,
                Local::now().format("%c"),
                BANNER
            )
            .as_bytes(),
        )
        .await?;

        let tools = self.ports().filesystems.as_ref();
        let mut report = DefragReport {
            rid: Some(rid),
            log: log_path.clone(),
            ..DefragReport::default()
        };
        for file in files {
            self.checkpoint()?;
            report.scanned += 1;
            let before = tools.extents(&file).await?;
            if before <= extent_threshold {
                continue;
            }
            let after = tools.defragment(&file).await?;
            let size = fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            log.write_all(
                format!(
                    "Rid = {} and Filename = {} and Filesize = {} and Extents Before = {} and Extents after = {}\n",
                    rid,
                    file.display(),
                    size,
                    before,
                    after
                )
                .as_bytes(),
            )
            .await?;
            report.defragmented += 1;
        }

        log.write_all(
            format!(
                "{}\n# TIME END RID {} SCAN - {}\n",
                BANNER,
                rid,
                Local::now().format("%c")
            )
            .as_bytes(),
        )
        .await?;
        log.flush().await?;
        info!(%rid, scanned = report.scanned, defragmented = report.defragmented, "Defragmentation finished");
        Ok(report)
    }
}

/// Regular files under `root`, skipping trash and `lost+found`
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let skipped = DEFRAG_SKIP.iter().any(|s| entry.file_name() == *s);
                if !skipped {
                    pending.push(entry.path());
                }
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
