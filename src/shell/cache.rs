//! Command result cache
//!
//! Short-lived results keyed by the exact rendered command line. The cache is
//! an explicit object shared through `Arc`, never process-global, so tests
//! and concurrent batch passes do not observe each other's entries.

use crate::shell::CommandOutput;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedOutput {
    output: CommandOutput,
    stored_at: Instant,
}

/// Cache of command outputs
#[derive(Debug, Default)]
pub struct CommandCache {
    entries: DashMap<String, CachedOutput>,
}

impl CommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached output for `key` if younger than `ttl`
    pub fn get(&self, key: &str, ttl: Duration) -> Option<CommandOutput> {
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.output.clone());
        if fresh.is_none() {
            self.entries.remove_if(key, |_, entry| entry.stored_at.elapsed() >= ttl);
        }
        fresh
    }

    pub fn insert(&self, key: impl Into<String>, output: CommandOutput) {
        self.entries.insert(
            key.into(),
            CachedOutput {
                output,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
