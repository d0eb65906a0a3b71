//! Linux host adapter
//!
//! Implements the host ports with the usual system tools: `mount`/`umount`
//! and `/proc/mounts`, `lsof`, `parted`, `mkfs.ext4`, `lsblk`, `fsck`,
//! `filefrag`, `e4defrag` and the metadata initializer.

use crate::device::is_block_device;
use crate::domain::ports::{
    CommandRunnerRef, DiskPartitioner, FilesystemTools, HostPorts, MountEntry, MountTable,
    OpenFileProbe, ResourceInitializer,
};
use crate::domain::{BlockDevice, Rid};
use crate::error::{Error, Result};
use crate::shell::{CommandClass, CommandSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Adapter
// =============================================================================

/// Host ports backed by Linux system tools
pub struct LinuxHost {
    runner: CommandRunnerRef,
    mounts_file: PathBuf,
    initializer_programs: Vec<String>,
    query_ttl: Duration,
}

impl LinuxHost {
    pub fn new(
        runner: CommandRunnerRef,
        mounts_file: PathBuf,
        initializer_programs: Vec<String>,
        query_ttl: Duration,
    ) -> Self {
        Self {
            runner,
            mounts_file,
            initializer_programs,
            query_ttl,
        }
    }

    /// Every host port served by this adapter
    pub fn into_ports(self) -> HostPorts {
        let host = Arc::new(self);
        HostPorts {
            mounts: host.clone(),
            open_files: host.clone(),
            disks: host.clone(),
            filesystems: host.clone(),
            initializer: host,
        }
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<String> {
        let output = self.runner.run(&spec).await?.ensure_success(&spec)?;
        Ok(output.stdout)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// =============================================================================
// Mount Table
// =============================================================================

#[async_trait]
impl MountTable for LinuxHost {
    async fn mount(&self, device: &Path, target: &Path, options: &str) -> Result<()> {
        let mut spec = CommandSpec::new("mount").class(CommandClass::Mount);
        if !options.is_empty() {
            spec = spec.args(["-o", options]);
        }
        self.run_checked(spec.args([path_arg(device), path_arg(target)]))
            .await?;
        Ok(())
    }

    async fn umount(&self, target: &Path) -> Result<()> {
        self.run_checked(
            CommandSpec::new("umount")
                .arg(path_arg(target))
                .class(CommandClass::Mount),
        )
        .await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<MountEntry>> {
        let table = self
            .run_checked(CommandSpec::new("cat").arg(path_arg(&self.mounts_file)))
            .await?;
        Ok(parse_mount_table(&table))
    }

    async fn is_mountpoint(&self, target: &Path) -> Result<bool> {
        let canonical = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        Ok(self
            .entries()
            .await?
            .iter()
            .any(|e| e.target == target || e.target == canonical))
    }
}

/// Parse `/proc/mounts`, decoding octal escapes such as `\040`
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: PathBuf::from(unescape_octal(device)),
                target: PathBuf::from(unescape_octal(target)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Open File Probe
// =============================================================================

#[async_trait]
impl OpenFileProbe for LinuxHost {
    async fn open_files(&self, path: &Path) -> Result<Vec<String>> {
        // On a mount point lsof reports the whole filesystem; elsewhere walk
        // the directory.
        let spec = if self.is_mountpoint(path).await? {
            CommandSpec::new("lsof").args(["-w", "-t"]).arg(path_arg(path))
        } else {
            CommandSpec::new("lsof")
                .args(["-w", "-t", "+D"])
                .arg(path_arg(path))
        };
        let output = self.runner.run(&spec).await?;
        let holders = parse_lsof_pids(&output.stdout);
        // lsof exits 1 when nothing is open
        if holders.is_empty() && !matches!(output.status, Some(0) | Some(1)) {
            output.ensure_success(&spec)?;
        }
        Ok(holders)
    }
}

fn parse_lsof_pids(stdout: &str) -> Vec<String> {
    let mut pids: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| format!("pid {}", l))
        .collect();
    pids.dedup();
    pids
}

// =============================================================================
// Disk Partitioner
// =============================================================================

#[async_trait]
impl DiskPartitioner for LinuxHost {
    async fn is_block_device(&self, device: &BlockDevice) -> Result<bool> {
        Ok(is_block_device(device.path()))
    }

    async fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<u32>> {
        let spec = CommandSpec::new("parted")
            .args(["-s", "-m"])
            .arg(path_arg(device.path()))
            .args(["unit", "s", "print"]);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            let stderr = output.stderr.to_lowercase();
            if stderr.contains("unrecognised disk label") || stderr.contains("unrecognized disk label")
            {
                return Ok(Vec::new());
            }
            output.ensure_success(&spec)?;
            return Ok(Vec::new());
        }
        Ok(parse_parted_partitions(&output.stdout))
    }

    async fn remove_partition(&self, device: &BlockDevice, number: u32) -> Result<()> {
        self.run_checked(
            CommandSpec::new("parted")
                .arg("-s")
                .arg(path_arg(device.path()))
                .args(["rm".to_string(), number.to_string()])
                .class(CommandClass::Format),
        )
        .await?;
        Ok(())
    }

    async fn make_gpt_label(&self, device: &BlockDevice) -> Result<()> {
        self.run_checked(
            CommandSpec::new("parted")
                .arg("-s")
                .arg(path_arg(device.path()))
                .args(["mklabel", "gpt"])
                .class(CommandClass::Format),
        )
        .await?;
        Ok(())
    }

    async fn create_resource_partitions(&self, device: &BlockDevice, md_size_mb: u64) -> Result<()> {
        let boundary = format!("{}MB", md_size_mb);
        for (start, end) in [("0%".to_string(), boundary.clone()), (boundary, "100%".to_string())] {
            self.run_checked(
                CommandSpec::new("parted")
                    .args(["-s", "-a", "optimal"])
                    .arg(path_arg(device.path()))
                    .args(["mkpart", "primary", "ext4"])
                    .args([start, end])
                    .class(CommandClass::Format),
            )
            .await?;
        }
        let settle = CommandSpec::new("udevadm").arg("settle").class(CommandClass::Format);
        if let Err(e) = self.run_checked(settle).await {
            warn!("udevadm settle failed: {}", e);
        }
        Ok(())
    }

    async fn partition_exists(&self, partition: &Path) -> Result<bool> {
        Ok(is_block_device(partition))
    }

    async fn format_ext4(&self, partition: &Path, label: &str) -> Result<()> {
        self.run_checked(
            CommandSpec::new("mkfs.ext4")
                .args(["-E", "lazy_itable_init=0,lazy_journal_init=0", "-F", "-q", "-L", label])
                .arg(path_arg(partition))
                .class(CommandClass::Format),
        )
        .await?;
        Ok(())
    }

    async fn blank_disks(&self) -> Result<Vec<BlockDevice>> {
        let spec = CommandSpec::new("lsblk").args(["-J", "-p", "-o", "NAME,TYPE,MOUNTPOINT"]);
        let output = self
            .runner
            .run_cached(&spec, self.query_ttl)
            .await?
            .ensure_success(&spec)?;
        parse_blank_disks(&output.stdout)
    }
}

/// Partition numbers from `parted -m ... print`
pub fn parse_parted_partitions(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.split(':').next()?.trim().parse::<u32>().ok())
        .collect()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Whole disks from `lsblk -J -p` with no partitions and no mount
pub fn parse_blank_disks(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json)?;
    Ok(parsed
        .blockdevices
        .into_iter()
        .filter(|d| d.kind == "disk" && d.mountpoint.is_none() && d.children.is_empty())
        .map(|d| BlockDevice::new(d.name))
        .collect())
}

// =============================================================================
// Filesystem Tools
// =============================================================================

#[async_trait]
impl FilesystemTools for LinuxHost {
    async fn check(&self, partition: &Path) -> Result<()> {
        let spec = CommandSpec::new("fsck")
            .arg("-y")
            .arg(path_arg(partition))
            .class(CommandClass::Check);
        let output = self.runner.run(&spec).await?;
        // 1 means errors were found and corrected
        match output.status {
            Some(0) | Some(1) => Ok(()),
            _ => output.ensure_success(&spec).map(|_| ()),
        }
    }

    async fn extents(&self, file: &Path) -> Result<u64> {
        let spec = CommandSpec::new("filefrag").arg(path_arg(file));
        let stdout = self.run_checked(spec.clone()).await?;
        parse_filefrag(&stdout)
            .ok_or_else(|| Error::external(spec.render(), format!("unexpected output '{}'", stdout.trim())))
    }

    async fn defragment(&self, file: &Path) -> Result<u64> {
        let spec = CommandSpec::new("e4defrag")
            .arg("-v")
            .arg(path_arg(file))
            .class(CommandClass::Check);
        let stdout = self.run_checked(spec).await?;
        match parse_e4defrag(&stdout) {
            Some(after) => Ok(after),
            None => {
                debug!(file = %file.display(), "e4defrag output without extent count");
                self.extents(file).await
            }
        }
    }
}

/// Extent count from `filefrag` (`<file>: 3 extents found`)
pub fn parse_filefrag(stdout: &str) -> Option<u64> {
    let line = stdout.lines().last()?;
    let (_, counts) = line.rsplit_once(": ")?;
    counts.split_whitespace().next()?.parse().ok()
}

/// Extent count after defragmentation from `e4defrag -v` (`extents: 7 -> 1`)
pub fn parse_e4defrag(stdout: &str) -> Option<u64> {
    stdout.lines().rev().find_map(|line| {
        let (_, after) = line.split_once("->")?;
        after.split_whitespace().next()?.parse().ok()
    })
}

// =============================================================================
// Resource Initializer
// =============================================================================

#[async_trait]
impl ResourceInitializer for LinuxHost {
    async fn initialize(&self, rid: Rid, data_dir: &Path, md_dir: &Path) -> Result<String> {
        let program = self
            .initializer_programs
            .iter()
            .find_map(|name| find_in_path(name))
            .ok_or_else(|| {
                Error::external(
                    self.initializer_programs.join("|"),
                    "metadata initializer not found in PATH",
                )
            })?;
        self.run_checked(
            CommandSpec::new(path_arg(&program))
                .arg(rid.to_string())
                .arg("dir")
                .arg(path_arg(data_dir))
                .arg(path_arg(md_dir))
                .class(CommandClass::Format),
        )
        .await
    }
}

/// First `name` found on `PATH`; absolute names are taken as is
pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use assert_matches::assert_matches;

    fn host(runner: Arc<ScriptedRunner>) -> LinuxHost {
        LinuxHost::new(
            runner,
            PathBuf::from("/proc/mounts"),
            vec!["mkfs.resource".into()],
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_parse_mount_table() {
        let table = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/sdb1 /depot/rid-1501/md ext4 rw,noatime,nodiratime 0 0
/dev/sdc2 /mnt/with\\040space ext4 rw 0 0
";
        let entries = parse_mount_table(table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].device, PathBuf::from("/dev/sdb1"));
        assert_eq!(entries[1].target, PathBuf::from("/depot/rid-1501/md"));
        assert_eq!(entries[2].target, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_parse_parted() {
        let stdout = "\
BYT;
/dev/sdb:7814037168s:scsi:512:4096:gpt:ATA ST4000:;
1:2048s:19531775s:19529728s:ext4:primary:;
2:19531776s:7814035455s:7794503680s:ext4:primary:;
";
        assert_eq!(parse_parted_partitions(stdout), vec![1, 2]);
        assert!(parse_parted_partitions("BYT;\n/dev/sdc:100s:scsi:512:512:gpt::;\n").is_empty());
    }

    #[test]
    fn test_parse_blank_disks() {
        let json = r#"{"blockdevices": [
            {"name": "/dev/sda", "type": "disk", "mountpoint": null, "children": [
                {"name": "/dev/sda1", "type": "part", "mountpoint": "/"}
            ]},
            {"name": "/dev/sdb", "type": "disk", "mountpoint": null},
            {"name": "/dev/sdc", "type": "disk", "mountpoint": "/scratch"},
            {"name": "/dev/loop0", "type": "loop", "mountpoint": null}
        ]}"#;
        assert_eq!(parse_blank_disks(json).unwrap(), vec![BlockDevice::new("/dev/sdb")]);
        assert_matches!(parse_blank_disks("not json"), Err(Error::JsonParse(_)));
    }

    #[test]
    fn test_parse_extents() {
        assert_eq!(parse_filefrag("/depot/rid-1501/data/0/a: 5 extents found\n"), Some(5));
        assert_eq!(parse_filefrag("/data/b: 1 extent found"), Some(1));
        assert_eq!(parse_filefrag("garbage"), None);

        let e4defrag = "\
ext4 defragmentation for /depot/rid-1501/data/0/a
[1/1]/depot/rid-1501/data/0/a:\t100%  extents: 5 -> 1\t[ OK ]
 Success:\t\t\t[1/1]
";
        assert_eq!(parse_e4defrag(e4defrag), Some(1));
    }

    #[tokio::test]
    async fn test_mount_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let host = host(runner.clone());

        host.mount(Path::new("/dev/sdb1"), Path::new("/depot/rid-1501/md"), "noatime,nodiratime")
            .await
            .unwrap();
        host.umount(Path::new("/depot/rid-1501/md")).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "mount -o noatime,nodiratime /dev/sdb1 /depot/rid-1501/md".to_string(),
                "umount /depot/rid-1501/md".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_lsof_gate() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("cat /proc/mounts", 0, "/dev/sdb2 /depot/rid-1501/data ext4 rw 0 0\n");
        runner.respond("lsof -w -t /depot/rid-1501/data", 0, "4242\n4243\n");
        runner.respond("lsof -w -t +D /depot/import/md-1501", 1, "");
        let host = host(runner.clone());

        let busy = host.open_files(Path::new("/depot/rid-1501/data")).await.unwrap();
        assert_eq!(busy, vec!["pid 4242".to_string(), "pid 4243".to_string()]);

        let idle = host.open_files(Path::new("/depot/import/md-1501")).await.unwrap();
        assert!(idle.is_empty());
    }

    #[tokio::test]
    async fn test_fsck_accepts_corrected_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("fsck -y /dev/sdb1", 1, "");
        runner.respond("fsck -y /dev/sdb2", 4, "");
        let host = host(runner);

        assert!(host.check(Path::new("/dev/sdb1")).await.is_ok());
        assert_matches!(
            host.check(Path::new("/dev/sdb2")).await,
            Err(Error::ExternalTool { .. })
        );
    }

    #[tokio::test]
    async fn test_unlabelled_disk_has_no_partitions() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_with(
            "parted -s -m /dev/sdd unit s print",
            1,
            "",
            "Error: /dev/sdd: unrecognised disk label",
        );
        let host = host(runner);
        let parts = host
            .list_partitions(&BlockDevice::new("/dev/sdd"))
            .await
            .unwrap();
        assert!(parts.is_empty());
    }
}
