//! Shell executor
//!
//! Runs external commands through `tokio::process` with a per-class timeout,
//! optionally serving repeated read-only queries from a [`CommandCache`].

use crate::config::TimeoutConfig;
use crate::domain::ports::CommandRunner;
use crate::error::{Error, Result};
use crate::shell::cache::CommandCache;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Command Description
// =============================================================================

/// Operation class of a command, selecting its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandClass {
    /// Read-only inspection
    Query,
    /// Mount table changes
    Mount,
    /// Partitioning, formatting, initialization
    Format,
    /// Filesystem check or defragmentation
    Check,
}

impl CommandClass {
    /// Commands of this class change host state
    pub fn is_mutating(self) -> bool {
        !matches!(self, CommandClass::Query)
    }
}

/// An external command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub class: CommandClass,
}

impl CommandSpec {
    /// A read-only query command
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            class: CommandClass::Query,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn class(mut self, class: CommandClass) -> Self {
        self.class = class;
        self
    }

    /// Exact command line, used as cache key and in diagnostics
    pub fn render(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn file_read_target(&self) -> Option<&str> {
        match self.args.as_slice() {
            [path] if self.program == "cat" => Some(path),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Captured result of a command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit status; `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into an `ExternalTool` error
    pub fn ensure_success(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let status = match self.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let detail = self.stderr.trim();
        let reason = if detail.is_empty() {
            status
        } else {
            format!("{}: {}", status, detail)
        };
        Err(Error::external(spec.render(), reason))
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs commands on the local host
pub struct ShellExecutor {
    cache: Arc<CommandCache>,
    timeouts: TimeoutConfig,
}

impl ShellExecutor {
    pub fn new(cache: Arc<CommandCache>, timeouts: TimeoutConfig) -> Self {
        Self { cache, timeouts }
    }

    pub fn cache(&self) -> &Arc<CommandCache> {
        &self.cache
    }

    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if let Some(path) = spec.file_read_target() {
            return Ok(read_file(path).await);
        }

        let limit = self.timeouts.for_class(spec.class);
        debug!(command = %spec, timeout = ?limit, "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::external(spec.render(), format!("cannot run: {}", e)));
            }
            Err(_) => {
                warn!(command = %spec, "Command timed out");
                return Err(Error::Timeout {
                    command: spec.render(),
                    after: limit,
                });
            }
        };

        if spec.class.is_mutating() {
            self.cache.clear();
        }

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

async fn read_file(path: &str) -> CommandOutput {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => CommandOutput {
            status: Some(0),
            stdout: contents,
            stderr: String::new(),
        },
        Err(e) => CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: format!("cat: {}: {}", path, e),
        },
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.execute(spec).await
    }

    async fn run_cached(&self, spec: &CommandSpec, ttl: Duration) -> Result<CommandOutput> {
        let key = spec.render();
        if let Some(hit) = self.cache.get(&key, ttl) {
            debug!(command = %key, "Command cache hit");
            return Ok(hit);
        }
        let output = self.execute(spec).await?;
        if !spec.class.is_mutating() {
            self.cache.insert(key, output.clone());
        }
        Ok(output)
    }
}
