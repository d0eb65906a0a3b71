//! Storage daemon client
//!
//! Talks to the running storage daemon through its command-line tools:
//! `get_version -a` lists the attached RIDs, `ibp_attach_rid` and
//! `ibp_detach_rid` change them. The daemon process itself is found in
//! procfs, started from a staged copy of its binary and stopped with
//! `SIGQUIT`.

use crate::config::ServerConfig;
use crate::domain::ports::{CommandRunnerRef, ServerControl};
use crate::domain::{DaemonProcess, Rid};
use crate::error::{Error, Result};
use crate::host::linux::find_in_path;
use crate::shell::{CommandClass, CommandSpec};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Process names of the daemon start with this, followed by a suffix
const DAEMON_PREFIX: &str = "ibp_server";

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// [`ServerControl`] over the daemon's command-line tools
pub struct IbpServer {
    runner: CommandRunnerRef,
    host: String,
    port: u16,
    daemon: ServerConfig,
}

impl IbpServer {
    pub fn new(runner: CommandRunnerRef, host: impl Into<String>, port: u16) -> Self {
        Self {
            runner,
            host: host.into(),
            port,
            daemon: ServerConfig::default(),
        }
    }

    /// Use `config` for locating, staging and stopping the daemon process
    pub fn with_daemon_config(mut self, config: ServerConfig) -> Self {
        self.daemon = config;
        self
    }

    fn control(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .arg(self.host.clone())
            .arg(self.port.to_string())
            .class(CommandClass::Mount)
    }

    /// Drop binaries staged by earlier starts
    fn purge_staged(&self) -> Result<()> {
        let dir = &self.daemon.staging_dir;
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if is_daemon_name(&name.to_string_lossy()) && entry.file_type()?.is_file() {
                debug!(path = %entry.path().display(), "Removing staged daemon binary");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Copy the installed daemon into the staging directory
    fn stage_binary(&self) -> Result<PathBuf> {
        let installed = self
            .daemon
            .executables
            .iter()
            .find_map(|name| find_in_path(name))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "none of {:?} found in PATH",
                    self.daemon.executables
                ))
            })?;
        fs::create_dir_all(&self.daemon.staging_dir)?;
        let staged = self
            .daemon
            .staging_dir
            .join(format!("{}.{}", DAEMON_PREFIX, std::process::id()));
        fs::copy(&installed, &staged)?;
        let mut permissions = fs::metadata(&staged)?.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        fs::set_permissions(&staged, permissions)?;
        debug!(from = %installed.display(), to = %staged.display(), "Daemon binary staged");
        Ok(staged)
    }
}

#[async_trait]
impl ServerControl for IbpServer {
    async fn status(&self) -> Result<Option<DaemonProcess>> {
        let process = find_daemon(&self.daemon.proc_dir)?;
        match &process {
            Some(process) => debug!(%process, "Storage daemon running"),
            None => debug!("Storage daemon not running"),
        }
        Ok(process)
    }

    async fn start(&self, config: &Path) -> Result<DaemonProcess> {
        if !config.is_file() {
            return Err(Error::Configuration(format!(
                "daemon configuration {} does not exist",
                config.display()
            )));
        }
        if self.stop().await?.is_none() {
            info!("Storage daemon is not running");
        }
        self.purge_staged()?;
        let staged = self.stage_binary()?;
        raise_descriptor_limit(required_descriptors(&fs::read_to_string(config)?))?;

        let mut command = tokio::process::Command::new(&staged);
        command
            .arg(config)
            .env("LD_LIBRARY_PATH", &self.daemon.library_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(preload) = self.daemon.preload.as_ref().filter(|p| p.is_file()) {
            command.env("LD_PRELOAD", preload);
        }
        let child = command
            .spawn()
            .map_err(|e| Error::external(staged.display().to_string(), e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("daemon exited before reporting a pid".into()))?;

        let process = DaemonProcess {
            pid,
            name: staged
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        info!(%process, config = %config.display(), "Storage daemon started");
        Ok(process)
    }

    async fn stop(&self) -> Result<Option<DaemonProcess>> {
        let Some(process) = find_daemon(&self.daemon.proc_dir)? else {
            return Ok(None);
        };
        let pid = Pid::from_raw(process.pid as i32);
        info!(%process, "Sending SIGQUIT to storage daemon");
        match kill(pid, Signal::SIGQUIT) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(Some(process)),
            Err(errno) => return Err(Error::Io(io::Error::from(errno))),
        }

        let started = Instant::now();
        let timeout = self.daemon.shutdown_timeout();
        while process_alive(pid) {
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    command: format!("shutdown of {}", process),
                    after: timeout,
                });
            }
            info!(%process, waited = ?started.elapsed(), "Waiting for storage daemon shutdown");
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        info!(%process, "Storage daemon stopped");
        Ok(Some(process))
    }

    async fn attached_rids(&self) -> Result<BTreeSet<Rid>> {
        let spec = CommandSpec::new("get_version").arg("-a");
        let output = self.runner.run(&spec).await?.ensure_success(&spec)?;
        let rids = parse_attached_rids(&output.stdout);
        debug!(count = rids.len(), "Attached RIDs");
        Ok(rids)
    }

    async fn attach(&self, rid: Rid, message: &str) -> Result<()> {
        let spec = self
            .control("ibp_attach_rid")
            .arg(rid.to_string())
            .arg(message);
        self.runner.run(&spec).await?.ensure_success(&spec)?;
        info!(%rid, "Attached to storage daemon");
        Ok(())
    }

    async fn detach(&self, rid: Rid, message: &str) -> Result<()> {
        let spec = self
            .control("ibp_detach_rid")
            .arg(rid.to_string())
            .arg("1")
            .arg(message);
        self.runner.run(&spec).await?.ensure_success(&spec)?;
        info!(%rid, "Detached from storage daemon");
        Ok(())
    }
}

fn is_daemon_name(name: &str) -> bool {
    name.strip_prefix(DAEMON_PREFIX)
        .is_some_and(|suffix| !suffix.is_empty())
}

/// Lowest-pid daemon process listed under `proc_dir`
pub fn find_daemon(proc_dir: &Path) -> Result<Option<DaemonProcess>> {
    let mut found: Option<DaemonProcess> = None;
    for entry in fs::read_dir(proc_dir)? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid == std::process::id() {
            continue;
        }
        // processes may exit while we look
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        let name = comm.trim();
        if is_daemon_name(name) && found.as_ref().map_or(true, |f| pid < f.pid) {
            found = Some(DaemonProcess {
                pid,
                name: name.to_string(),
            });
        }
    }
    Ok(found)
}

fn process_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

/// Open files the daemon needs for `config`: three per thread, ten per
/// resource section and a fixed reserve
pub fn required_descriptors(config: &str) -> u64 {
    let mut threads = 0u64;
    let mut resources = BTreeSet::new();
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with("[resource ") {
            resources.insert(line);
        } else if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "threads" {
                threads = value.trim().parse().unwrap_or(threads);
            }
        }
    }
    3 * threads + 10 * resources.len() as u64 + 64
}

fn raise_descriptor_limit(required: u64) -> Result<()> {
    let (soft, hard) =
        getrlimit(Resource::RLIMIT_NOFILE).map_err(|e| Error::Io(io::Error::from(e)))?;
    if soft >= required {
        return Ok(());
    }
    info!(current = soft, required, "Raising open-file limit for the storage daemon");
    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, required, hard.max(required)) {
        warn!("setrlimit failed: {}", e);
        return Err(Error::Configuration(format!(
            "cannot raise the open-file limit from {} to {}; lower the daemon's threads \
             or raise the system-wide limit",
            soft, required
        )));
    }
    Ok(())
}

/// RIDs from `get_version -a`: active `RID: <n> Max: ...` lines and the
/// list following the count on the `Pending RID count:` line
pub fn parse_attached_rids(output: &str) -> BTreeSet<Rid> {
    let mut rids = BTreeSet::new();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("RID: ") {
            if let Some(rid) = rest.split_whitespace().next().and_then(|t| t.parse::<Rid>().ok()) {
                rids.insert(rid);
            }
        } else if let Some((_, rest)) = line.split_once("Pending RID count:") {
            rids.extend(
                rest.split_whitespace()
                    .skip(1)
                    .filter_map(|t| t.parse::<Rid>().ok()),
            );
        }
    }
    rids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    const GET_VERSION: &str = "\
ibp_server version 1.7.0
Interfaces(1): cms-depot1:6714
Total resources: 3  Used: 2.1 TB  Free: 9.6 TB
RID: 1536 Max: 3900000000000 Used: 1000000 Diff: 0 Free: 3899999000000 Allocations: 12 (0 alias)
RID: 1537 Max: 3900000000000 Used: 1000000 Diff: 0 Free: 3899999000000 Allocations: 3 (0 alias)
Pending RID count: 1 1540
";

    #[test]
    fn test_parse_attached_rids() {
        let rids = parse_attached_rids(GET_VERSION);
        assert_eq!(rids, [rid(1536), rid(1537), rid(1540)].into_iter().collect());

        let none_pending = "RID: 1536 Max: 1\nPending RID count: 0\n";
        assert_eq!(parse_attached_rids(none_pending), [rid(1536)].into_iter().collect());
    }

    #[tokio::test]
    async fn test_attach_detach_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let server = IbpServer::new(runner.clone(), "cms-depot1", 6714);

        server.detach(rid(1536), "Repairing").await.unwrap();
        server.attach(rid(1536), "Repaired").await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ibp_detach_rid cms-depot1 6714 1536 1 Repairing".to_string(),
                "ibp_attach_rid cms-depot1 6714 1536 Repaired".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_daemon_down() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_with("get_version -a", 1, "", "connection refused");
        let server = IbpServer::new(runner, "cms-depot1", 6714);
        assert_matches!(
            server.attached_rids().await,
            Err(crate::error::Error::ExternalTool { .. })
        );
    }

    fn fake_proc(processes: &[(u32, &str)]) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        for (pid, comm) in processes {
            let process = dir.path().join(pid.to_string());
            fs::create_dir_all(&process).unwrap();
            fs::write(process.join("comm"), format!("{}\n", comm)).unwrap();
        }
        fs::create_dir_all(dir.path().join("sys")).unwrap();
        fs::write(dir.path().join("uptime"), "1.0 1.0\n").unwrap();
        dir
    }

    #[test]
    fn test_find_daemon() {
        let proc_dir = fake_proc(&[
            (4100, "bash"),
            (5123, "ibp_server.1234"),
            (3999, "ibp_server.exe"),
            (12, "ibp_server"),
        ]);
        assert_eq!(
            find_daemon(proc_dir.path()).unwrap(),
            Some(DaemonProcess {
                pid: 3999,
                name: "ibp_server.exe".to_string(),
            })
        );

        let idle = fake_proc(&[(1, "systemd"), (77, "ibp_server")]);
        assert_eq!(find_daemon(idle.path()).unwrap(), None);
    }

    #[test]
    fn test_required_descriptors() {
        let config = "\
[server]
threads = 32
[resource 1501]
rid = 1501
[resource 1502]
rid = 1502
[resource 1501]
";
        assert_eq!(required_descriptors(config), 3 * 32 + 10 * 2 + 64);
        assert_eq!(required_descriptors(""), 64);
    }

    #[tokio::test]
    async fn test_stop_without_daemon() {
        let proc_dir = fake_proc(&[(1, "systemd")]);
        let server = IbpServer::new(Arc::new(ScriptedRunner::new()), "cms-depot1", 6714)
            .with_daemon_config(ServerConfig {
                proc_dir: proc_dir.path().to_path_buf(),
                ..ServerConfig::default()
            });

        assert_eq!(server.status().await.unwrap(), None);
        assert_eq!(server.stop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_requires_config() {
        let proc_dir = fake_proc(&[]);
        let staging = tempfile::TempDir::new().unwrap();
        let server = IbpServer::new(Arc::new(ScriptedRunner::new()), "cms-depot1", 6714)
            .with_daemon_config(ServerConfig {
                proc_dir: proc_dir.path().to_path_buf(),
                staging_dir: staging.path().to_path_buf(),
                ..ServerConfig::default()
            });

        assert_matches!(
            server.start(&staging.path().join("ibp.conf")).await,
            Err(Error::Configuration(_))
        );
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_purge_staged_keeps_other_files() {
        let staging = tempfile::TempDir::new().unwrap();
        fs::write(staging.path().join("ibp_server.811"), "old").unwrap();
        fs::write(staging.path().join("ibp_server.exe.bak"), "old").unwrap();
        fs::write(staging.path().join("notes.txt"), "keep").unwrap();
        let server = IbpServer::new(Arc::new(ScriptedRunner::new()), "cms-depot1", 6714)
            .with_daemon_config(ServerConfig {
                staging_dir: staging.path().to_path_buf(),
                ..ServerConfig::default()
            });

        server.purge_staged().unwrap();

        let left: Vec<_> = fs::read_dir(staging.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(left, vec!["notes.txt".to_string()]);
    }
}
