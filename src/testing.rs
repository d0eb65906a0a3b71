//! Test doubles
//!
//! [`FakeHost`] simulates a depot node inside a scratch directory: disks and
//! partitions are plain files, every partition's filesystem is a backing
//! directory, and mounting moves the backing directory's entries onto the
//! mount point (unmounting moves them back). [`ScriptedRunner`] answers
//! external commands from a table.
//!
//! The layout matches [`DepotConfig::rooted_at`], so a manager built from
//! [`FakeHost::config`] and [`FakeHost::ports`] runs the real lifecycle code
//! against it.

use crate::config::DepotConfig;
use crate::domain::ports::{
    CommandRunner, DiskPartitioner, FilesystemTools, HostPorts, MountEntry, MountTable,
    OpenFileProbe, ResourceInitializer, ServerControl,
};
use crate::domain::{BlockDevice, DaemonProcess, Rid};
use crate::error::{Error, Result};
use crate::lifecycle::SETTINGS_FILE;
use crate::shell::{CommandOutput, CommandSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Fake Host
// =============================================================================

#[derive(Default)]
struct FakeState {
    /// Whole disk -> partition numbers
    disks: BTreeMap<PathBuf, BTreeSet<u32>>,
    mounts: Vec<MountEntry>,
    /// Open handles: path and holder description
    held: Vec<(PathBuf, String)>,
    failing_mounts: BTreeSet<PathBuf>,
    extents: BTreeMap<PathBuf, u64>,
    checked: Vec<PathBuf>,
    attached: BTreeSet<Rid>,
    daemon: Option<DaemonProcess>,
    starts: u32,
    failing_umounts: BTreeSet<PathBuf>,
    failing_initializer: bool,
    commands: Vec<String>,
}

/// In-process depot node
pub struct FakeHost {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeHost {
    /// Simulated node rooted at `root`
    pub fn new(root: &Path) -> Arc<Self> {
        let _ = fs::create_dir_all(root);
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let _ = fs::create_dir_all(root.join("dev/disk/by-label"));
        let _ = fs::create_dir_all(root.join("backing"));
        Arc::new(Self {
            root,
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Depot configuration matching this node's layout
    pub fn config(&self) -> DepotConfig {
        DepotConfig::rooted_at(&self.root)
    }

    /// Every host port served by this node
    pub fn ports(self: &Arc<Self>) -> HostPorts {
        HostPorts {
            mounts: self.clone(),
            open_files: self.clone(),
            disks: self.clone(),
            filesystems: self.clone(),
            initializer: self.clone(),
        }
    }

    fn label_dir(&self) -> PathBuf {
        self.root.join("dev/disk/by-label")
    }

    /// Plug in an unpartitioned disk named `name` (e.g. `sdb`)
    pub fn add_blank_disk(&self, name: &str) -> BlockDevice {
        let device = BlockDevice::new(self.root.join("dev").join(name));
        let _ = fs::write(device.path(), "");
        self.state
            .lock()
            .disks
            .insert(device.path().to_path_buf(), BTreeSet::new());
        device
    }

    /// Plug in a disk already provisioned as resource `rid`
    pub fn add_resource(&self, name: &str, rid: Rid) -> Result<BlockDevice> {
        let device = self.add_blank_disk(name);
        self.add_partition(&device, 1)?;
        self.add_partition(&device, 2)?;
        self.make_filesystem(&device.md_partition(), &rid.md_label())?;
        self.make_filesystem(&device.data_partition(), &rid.data_label())?;
        fs::write(
            self.backing_dir(&device.md_partition()).join(SETTINGS_FILE),
            settings_for(rid),
        )?;
        Ok(device)
    }

    /// Directory holding a partition's filesystem while it is unmounted
    pub fn backing_dir(&self, partition: &Path) -> PathBuf {
        let name = partition
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join("backing").join(name)
    }

    /// Report `holder` as having a file open under `path`
    pub fn hold_open(&self, path: &Path, holder: &str) {
        self.state
            .lock()
            .held
            .push((path.to_path_buf(), holder.to_string()));
    }

    /// Drop every open handle under `path`
    pub fn release_open(&self, path: &Path) {
        self.state.lock().held.retain(|(p, _)| !p.starts_with(path));
    }

    /// Make the next mount of `partition` fail
    pub fn fail_mount(&self, partition: &Path) {
        self.state
            .lock()
            .failing_mounts
            .insert(partition.to_path_buf());
    }

    /// Make the next unmount of `target` fail
    pub fn fail_umount(&self, target: &Path) {
        self.state
            .lock()
            .failing_umounts
            .insert(target.to_path_buf());
    }

    /// Make the next metadata initialization fail
    pub fn fail_initializer(&self) {
        self.state.lock().failing_initializer = true;
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state.lock().mounts.iter().any(|e| e.target == target)
    }

    pub fn set_extents(&self, file: &Path, extents: u64) {
        self.state.lock().extents.insert(file.to_path_buf(), extents);
    }

    /// Partitions passed to the filesystem checker, in order
    pub fn checked(&self) -> Vec<PathBuf> {
        self.state.lock().checked.clone()
    }

    /// RIDs the simulated storage daemon serves
    pub fn attached(&self) -> BTreeSet<Rid> {
        self.state.lock().attached.clone()
    }

    pub fn set_attached(&self, rids: impl IntoIterator<Item = Rid>) {
        self.state.lock().attached = rids.into_iter().collect();
    }

    /// Mutating host commands issued so far
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    fn record(&self, command: String) {
        self.state.lock().commands.push(command);
    }

    fn add_partition(&self, device: &BlockDevice, number: u32) -> Result<()> {
        let partition = device.partition(number);
        fs::write(&partition, "")?;
        fs::create_dir_all(self.backing_dir(&partition))?;
        self.state
            .lock()
            .disks
            .entry(device.path().to_path_buf())
            .or_default()
            .insert(number);
        Ok(())
    }

    fn make_filesystem(&self, partition: &Path, label: &str) -> Result<()> {
        let backing = self.backing_dir(partition);
        if backing.exists() {
            fs::remove_dir_all(&backing)?;
        }
        fs::create_dir_all(backing.join("lost+found"))?;
        // a new filesystem drops the partition's previous label
        for entry in fs::read_dir(self.label_dir())? {
            let entry = entry?;
            if fs::read_link(entry.path()).is_ok_and(|target| target == partition) {
                fs::remove_file(entry.path())?;
            }
        }
        let link = self.label_dir().join(label);
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        symlink(partition, &link)?;
        Ok(())
    }

    fn partition_known(&self, partition: &Path) -> bool {
        let device = BlockDevice::from_partition(partition);
        let state = self.state.lock();
        state.disks.get(device.path()).is_some_and(|parts| {
            parts
                .iter()
                .any(|n| device.partition(*n).as_path() == partition)
        })
    }
}

/// Settings the fake initializer writes for `rid`
pub fn settings_for(rid: Rid) -> String {
    format!("[resource {rid}]\nrid = {rid}\nmax_duration = 2592000\n")
}

fn move_entries(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

#[async_trait]
impl MountTable for FakeHost {
    async fn mount(&self, device: &Path, target: &Path, options: &str) -> Result<()> {
        let command = format!("mount -o {} {} {}", options, device.display(), target.display());
        self.record(command.clone());
        if self.state.lock().failing_mounts.remove(device) {
            return Err(Error::external(command, "exit status 32: simulated failure"));
        }
        if !self.partition_known(device) {
            return Err(Error::external(command, "special device does not exist"));
        }
        if !target.is_dir() {
            return Err(Error::external(command, "mount point does not exist"));
        }
        if self.state.lock().mounts.iter().any(|e| e.device == device) {
            return Err(Error::external(command, "already mounted"));
        }
        move_entries(&self.backing_dir(device), target)?;
        self.state.lock().mounts.push(MountEntry {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: "ext4".to_string(),
        });
        Ok(())
    }

    async fn umount(&self, target: &Path) -> Result<()> {
        let command = format!("umount {}", target.display());
        self.record(command.clone());
        if self.state.lock().failing_umounts.remove(target) {
            return Err(Error::external(command, "exit status 32: simulated failure"));
        }
        let entry = {
            let state = self.state.lock();
            if state.held.iter().any(|(p, _)| p.starts_with(target)) {
                return Err(Error::external(command, "target is busy"));
            }
            state.mounts.iter().find(|e| e.target == target).cloned()
        };
        let Some(entry) = entry else {
            return Err(Error::external(command, "not mounted"));
        };
        move_entries(target, &self.backing_dir(&entry.device))?;
        self.state.lock().mounts.retain(|e| e.target != target);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<MountEntry>> {
        Ok(self.state.lock().mounts.clone())
    }
}

#[async_trait]
impl OpenFileProbe for FakeHost {
    async fn open_files(&self, path: &Path) -> Result<Vec<String>> {
        let live = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(self
            .state
            .lock()
            .held
            .iter()
            .filter(|(p, _)| p.starts_with(path) || p.starts_with(&live))
            .map(|(_, holder)| holder.clone())
            .collect())
    }
}

#[async_trait]
impl DiskPartitioner for FakeHost {
    async fn is_block_device(&self, device: &BlockDevice) -> Result<bool> {
        Ok(self.state.lock().disks.contains_key(device.path()))
    }

    async fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<u32>> {
        Ok(self
            .state
            .lock()
            .disks
            .get(device.path())
            .map(|parts| parts.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn remove_partition(&self, device: &BlockDevice, number: u32) -> Result<()> {
        self.record(format!("parted -s {} rm {}", device, number));
        let partition = device.partition(number);
        let _ = fs::remove_file(&partition);
        let backing = self.backing_dir(&partition);
        if backing.exists() {
            fs::remove_dir_all(&backing)?;
        }
        if let Some(parts) = self.state.lock().disks.get_mut(device.path()) {
            parts.remove(&number);
        }
        Ok(())
    }

    async fn make_gpt_label(&self, device: &BlockDevice) -> Result<()> {
        self.record(format!("parted -s {} mklabel gpt", device));
        Ok(())
    }

    async fn create_resource_partitions(&self, device: &BlockDevice, md_size_mb: u64) -> Result<()> {
        self.record(format!("parted -s {} mkpart {}MB", device, md_size_mb));
        self.add_partition(device, 1)?;
        self.add_partition(device, 2)
    }

    async fn partition_exists(&self, partition: &Path) -> Result<bool> {
        Ok(self.partition_known(partition))
    }

    async fn format_ext4(&self, partition: &Path, label: &str) -> Result<()> {
        self.record(format!("mkfs.ext4 -L {} {}", label, partition.display()));
        self.make_filesystem(partition, label)
    }

    async fn blank_disks(&self) -> Result<Vec<BlockDevice>> {
        Ok(self
            .state
            .lock()
            .disks
            .iter()
            .filter(|(_, parts)| parts.is_empty())
            .map(|(disk, _)| BlockDevice::new(disk))
            .collect())
    }
}

#[async_trait]
impl FilesystemTools for FakeHost {
    async fn check(&self, partition: &Path) -> Result<()> {
        self.record(format!("fsck -y {}", partition.display()));
        self.state.lock().checked.push(partition.to_path_buf());
        Ok(())
    }

    async fn extents(&self, file: &Path) -> Result<u64> {
        Ok(self.state.lock().extents.get(file).copied().unwrap_or(1))
    }

    async fn defragment(&self, file: &Path) -> Result<u64> {
        self.record(format!("e4defrag -v {}", file.display()));
        self.state.lock().extents.insert(file.to_path_buf(), 1);
        Ok(1)
    }
}

#[async_trait]
impl ResourceInitializer for FakeHost {
    async fn initialize(&self, rid: Rid, data_dir: &Path, md_dir: &Path) -> Result<String> {
        let command = format!(
            "mkfs.resource {} dir {} {}",
            rid,
            data_dir.display(),
            md_dir.display()
        );
        self.record(command.clone());
        if std::mem::take(&mut self.state.lock().failing_initializer) {
            return Err(Error::external(command, "exit status 1: simulated failure"));
        }
        Ok(settings_for(rid))
    }
}

#[async_trait]
impl ServerControl for FakeHost {
    async fn status(&self) -> Result<Option<DaemonProcess>> {
        Ok(self.state.lock().daemon.clone())
    }

    async fn start(&self, config: &Path) -> Result<DaemonProcess> {
        if !config.is_file() {
            return Err(Error::Configuration(format!(
                "daemon configuration {} does not exist",
                config.display()
            )));
        }
        self.stop().await?;
        self.record(format!("ibp_server {}", config.display()));
        let mut state = self.state.lock();
        state.starts += 1;
        let process = DaemonProcess {
            pid: 4000 + state.starts,
            name: "ibp_server.exe".to_string(),
        };
        state.daemon = Some(process.clone());
        Ok(process)
    }

    async fn stop(&self) -> Result<Option<DaemonProcess>> {
        let stopped = self.state.lock().daemon.take();
        if let Some(process) = &stopped {
            self.record(format!("kill -QUIT {}", process.pid));
        }
        Ok(stopped)
    }

    async fn attached_rids(&self) -> Result<BTreeSet<Rid>> {
        Ok(self.state.lock().attached.clone())
    }

    async fn attach(&self, rid: Rid, message: &str) -> Result<()> {
        self.record(format!("attach {} '{}'", rid, message));
        self.state.lock().attached.insert(rid);
        Ok(())
    }

    async fn detach(&self, rid: Rid, message: &str) -> Result<()> {
        self.record(format!("detach {} '{}'", rid, message));
        self.state.lock().attached.remove(&rid);
        Ok(())
    }
}

// =============================================================================
// Scripted Runner
// =============================================================================

/// Command runner answering from a table; unknown commands succeed silently
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<BTreeMap<String, CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `status` and `stdout`
    pub fn respond(&self, command: &str, status: i32, stdout: &str) {
        self.respond_with(command, status, stdout, "");
    }

    pub fn respond_with(&self, command: &str, status: i32, stdout: &str, stderr: &str) {
        self.responses.lock().insert(
            command.to_string(),
            CommandOutput {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Rendered commands in the order they ran
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.render();
        self.calls.lock().push(line.clone());
        Ok(self
            .responses
            .lock()
            .get(&line)
            .cloned()
            .unwrap_or_else(|| CommandOutput {
                status: Some(0),
                ..CommandOutput::default()
            }))
    }

    async fn run_cached(&self, spec: &CommandSpec, _ttl: Duration) -> Result<CommandOutput> {
        self.run(spec).await
    }
}
