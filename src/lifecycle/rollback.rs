//! Undo journal for multi-step transitions
//!
//! Steps that change host state push their inverse. On failure the journal is
//! unwound in reverse order; every undo step runs even if an earlier one
//! fails, and the failures are returned for reporting.

use crate::domain::ports::MountTable;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    Unmount(PathBuf),
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
    RemoveTree(PathBuf),
}

/// Journal of undo steps, unwound on failure
#[derive(Debug, Default)]
pub struct Rollback {
    steps: Vec<Undo>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// `target` was mounted
    pub fn mounted(&mut self, target: impl Into<PathBuf>) {
        self.steps.push(Undo::Unmount(target.into()));
    }

    /// `dir` was created empty
    pub fn created_dir(&mut self, dir: impl Into<PathBuf>) {
        self.steps.push(Undo::RemoveDir(dir.into()));
    }

    /// `file` (or symlink) was created
    pub fn created_file(&mut self, file: impl Into<PathBuf>) {
        self.steps.push(Undo::RemoveFile(file.into()));
    }

    /// `dir` was populated from scratch and may be deleted recursively
    pub fn created_tree(&mut self, dir: impl Into<PathBuf>) {
        self.steps.push(Undo::RemoveTree(dir.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything; the transition succeeded
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Undo every recorded step in reverse order
    pub async fn unwind(mut self, mounts: &dyn MountTable) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(step) = self.steps.pop() {
            debug!(?step, "Rolling back");
            let result = match &step {
                Undo::Unmount(target) => mounts.umount(target).await.map_err(|e| e.to_string()),
                Undo::RemoveDir(dir) => fs::remove_dir(dir).map_err(|e| e.to_string()),
                Undo::RemoveFile(file) => fs::remove_file(file).map_err(|e| e.to_string()),
                Undo::RemoveTree(dir) => fs::remove_dir_all(dir).map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                warn!(?step, "Rollback step failed: {}", e);
                failures.push(format!("{:?}: {}", step, e));
            }
        }
        failures
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            warn!(pending = self.steps.len(), "Rollback journal dropped without unwind");
        }
    }
}
