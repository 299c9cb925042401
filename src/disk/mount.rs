//! Mount-table and filesystem helpers
//!
//! Wraps the host `mount`/`umount`/`blkid`/`blockdev` surface behind the
//! [`CommandRunner`] port and parses `/proc/mounts`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::util::{CommandOutput, CommandRunnerRef};

/// Pseudo-fstype the NFS helper package registers for encrypted mounts.
pub const OCI_FSS_FSTYPE: &str = "oci-fss";

/// Unmount binary the helper package installs for encrypted mounts.
pub const ENCRYPTED_UMOUNT_COMMAND: &str = "umount.oci-fss";

/// Directory of stable by-path device links.
pub const DISK_BY_PATH_FOLDER: &str = "/dev/disk/by-path";

const UMOUNT_COMMAND: &str = "umount";
const MOUNT_COMMAND: &str = "mount";
const NOT_MOUNTED: &str = "not mounted";
const DIRECTORY_DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Mount Table
// =============================================================================

/// One entry of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Octal escapes `/proc/mounts` uses for whitespace in paths.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Parses `/proc/mounts` content; six whitespace-separated fields per line.
pub fn parse_proc_mounts(content: &str) -> Vec<MountPoint> {
    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        out.push(MountPoint {
            device: unescape_mount_field(fields[0]),
            path: unescape_mount_field(fields[1]),
            fs_type: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        });
    }
    out
}

/// Device equality tolerating the ` (deleted)` suffix the kernel appends to
/// stale NFS mount sources.
pub fn device_matches(entry_device: &str, expected: &str) -> bool {
    entry_device == expected || entry_device.trim_end_matches(" (deleted)") == expected
}

// =============================================================================
// Mounter
// =============================================================================

/// Host mount operations.
#[derive(Clone)]
pub struct Mounter {
    runner: CommandRunnerRef,
    proc_mounts_path: PathBuf,
}

impl Mounter {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Mounter {
            runner,
            proc_mounts_path: PathBuf::from("/proc/mounts"),
        }
    }

    /// Test constructor with an alternative mount-table path.
    pub fn with_proc_mounts(runner: CommandRunnerRef, proc_mounts_path: PathBuf) -> Self {
        Mounter {
            runner,
            proc_mounts_path,
        }
    }

    pub fn runner(&self) -> &CommandRunnerRef {
        &self.runner
    }

    pub async fn read_mount_points(&self) -> Result<Vec<MountPoint>> {
        let content = tokio::fs::read_to_string(&self.proc_mounts_path).await?;
        Ok(parse_proc_mounts(&content))
    }

    pub async fn is_mount_point(&self, path: &str) -> Result<bool> {
        let mounts = self.read_mount_points().await?;
        Ok(mounts.iter().any(|m| m.path == path))
    }

    /// Mount entry for a path, if mounted.
    pub async fn mount_point_for_path(&self, path: &str) -> Result<Option<MountPoint>> {
        let mounts = self.read_mount_points().await?;
        Ok(mounts.into_iter().find(|m| m.path == path))
    }

    /// `mount [-t fstype] [-o options] source target`
    pub async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        if !fs_type.is_empty() {
            args.push("-t".into());
            args.push(fs_type.into());
        }
        if !options.is_empty() {
            args.push("-o".into());
            args.push(options.join(","));
        }
        if !source.is_empty() {
            args.push(source.into());
        }
        args.push(target.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run(MOUNT_COMMAND, &arg_refs)
            .await
            .map_err(|err| Error::Mount(format!("mount of {} at {} failed: {}", source, target, err)))?;
        Ok(())
    }

    pub async fn unmount(&self, target: &str) -> Result<()> {
        self.runner.run(UMOUNT_COMMAND, &[target]).await?;
        Ok(())
    }

    /// Forced unmount; an already-unmounted target is success. Used when a
    /// network filesystem would hang a regular unmount.
    pub async fn unmount_with_force(&self, target: &str) -> Result<()> {
        let output = self.runner.output(UMOUNT_COMMAND, &["-f", target]).await?;
        if output.success() || combined(&output).contains(NOT_MOUNTED) {
            Ok(())
        } else {
            Err(Error::Mount(format!(
                "forced unmount of {} failed: {}",
                target,
                combined(&output)
            )))
        }
    }

    /// Unmounts through the in-transit encryption helper.
    pub async fn unmount_with_encrypt(&self, target: &str) -> Result<()> {
        info!(target, "unmounting in-transit encryption mount point");
        self.runner.run(ENCRYPTED_UMOUNT_COMMAND, &[target]).await?;
        Ok(())
    }

    /// Unmounts the path and removes the remaining directory. A missing
    /// path or a non-mount-point directory is cleaned up silently.
    pub async fn unmount_path(&self, mount_path: &str) -> Result<()> {
        if tokio::fs::metadata(mount_path).await.is_err() {
            warn!(mount_path, "unmount skipped, path does not exist");
            return Ok(());
        }
        if !self.is_mount_point(mount_path).await? {
            warn!(mount_path, "path is not a mount point, removing directory");
            tokio::fs::remove_dir(mount_path).await?;
            return Ok(());
        }

        self.unmount(mount_path).await?;
        if !self.is_mount_point(mount_path).await? {
            self.wait_for_directory_deletion(mount_path).await;
            return Ok(());
        }
        Err(Error::Mount(format!("failed to unmount path {}", mount_path)))
    }

    // Try removing the mount path thrice, else suppress the error.
    async fn wait_for_directory_deletion(&self, mount_path: &str) {
        for _ in 0..3 {
            match tokio::fs::remove_dir(mount_path).await {
                Ok(()) => {
                    info!(mount_path, "mount path deleted");
                    return;
                }
                Err(err) => {
                    warn!(mount_path, error = %err, "mount path couldn't be deleted, trying again");
                    sleep(DIRECTORY_DELETE_POLL_INTERVAL).await;
                }
            }
        }
        warn!(mount_path, "mount path couldn't be deleted");
    }

    /// Sources mounted at the target, via `findmnt`.
    pub async fn find_mount_sources(&self, target: &str) -> Result<Vec<String>> {
        let stdout = self
            .runner
            .run("findmnt", &["-n", "-o", "SOURCE", "--target", target])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Filesystem type on the device via `blkid`; None when unformatted.
    pub async fn get_disk_format(&self, device: &str) -> Result<Option<String>> {
        let args = ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device];
        let output = self.runner.output("blkid", &args).await?;

        // blkid exits 2 when no filesystem signature is found
        if output.code == 2 {
            return Ok(None);
        }
        if !output.success() {
            return Err(Error::Command {
                command: format!("blkid {}", args.join(" ")),
                stderr: combined(&output),
            });
        }

        let mut fs_type = None;
        let mut pt_type = None;
        for line in output.stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "TYPE" => fs_type = Some(value.to_string()),
                    "PTTYPE" => pt_type = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        if pt_type.is_some() {
            // A partition table is present; report a sentinel so callers
            // refuse to format over it.
            return Ok(Some("unknown data, probably partitions".to_string()));
        }
        Ok(fs_type)
    }

    /// Formats the device when unformatted, then mounts it.
    pub async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        match self.get_disk_format(source).await? {
            None => {
                info!(source, fs_type, "device is unformatted, formatting");
                let args: Vec<&str> = match fs_type {
                    "xfs" => vec!["-f", source],
                    // mkfs.ext{3,4}
                    _ => vec!["-F", "-m0", source],
                };
                self.runner
                    .run(&format!("mkfs.{}", fs_type), &args)
                    .await?;
            }
            Some(existing) if existing != fs_type => {
                return Err(Error::Mount(format!(
                    "device {} already formatted with {}, requested {}",
                    source, existing, fs_type
                )));
            }
            Some(_) => {}
        }
        self.mount(source, target, fs_type, options).await
    }

    /// Device size via `blockdev --getsize64`.
    pub async fn get_block_size_bytes(&self, device: &str) -> Result<i64> {
        let stdout = self.runner.run("blockdev", &["--getsize64", device]).await?;
        stdout.trim().parse().map_err(|_| {
            Error::Internal(format!(
                "failed to parse blockdev output {} for {}",
                stdout.trim(),
                device
            ))
        })
    }

    /// Triggers a SCSI rescan of the device behind the by-path link.
    pub async fn rescan(&self, device_path: &str) -> Result<()> {
        let resolved = resolve_device(device_path)?;
        let base = device_base_name(&resolved)?;
        let rescan_path = format!("/sys/class/block/{}/device/rescan", base);
        let cmd = format!("echo 1 | tee {}", rescan_path);
        self.runner.run("bash", &["-c", &cmd]).await?;
        debug!(device_path, rescan_path, "rescanned device");
        Ok(())
    }

    /// Grows the filesystem to fill the device. Picks the resizer from the
    /// on-disk format.
    pub async fn resize(&self, device_path: &str, volume_path: &str) -> Result<bool> {
        match self.get_disk_format(device_path).await? {
            Some(fs) if fs == "ext3" || fs == "ext4" => {
                self.runner.run("resize2fs", &[device_path]).await?;
                Ok(true)
            }
            Some(fs) if fs == "xfs" => {
                self.runner.run("xfs_growfs", &[volume_path]).await?;
                Ok(true)
            }
            other => Err(Error::Mount(format!(
                "cannot resize {}: unsupported filesystem {:?}",
                device_path, other
            ))),
        }
    }
}

fn combined(output: &CommandOutput) -> String {
    format!("{}{}", output.stdout, output.stderr)
}

// =============================================================================
// Device Paths
// =============================================================================

/// Waits up to `max_retries` seconds for a path to appear.
pub async fn wait_for_path_to_exist(path: &str, max_retries: u32) -> bool {
    for attempt in 0..=max_retries {
        if Path::new(path).exists() {
            return true;
        }
        if attempt < max_retries {
            sleep(Duration::from_secs(1)).await;
        }
    }
    false
}

/// Resolves a (possibly symlinked, possibly globbed) device path to its
/// target.
pub fn resolve_device(symbolic_link: &str) -> Result<String> {
    let matches: Vec<PathBuf> = glob::glob(symbolic_link)
        .map_err(|err| Error::Internal(format!("bad device pattern {}: {}", symbolic_link, err)))?
        .filter_map(|entry| entry.ok())
        .collect();
    let first = matches.first().ok_or_else(|| Error::DevicePathNotFound {
        path: symbolic_link.to_string(),
    })?;

    match std::fs::read_link(first) {
        Ok(target) => {
            let resolved = if target.is_absolute() {
                target
            } else {
                first.parent().unwrap_or(Path::new("/")).join(target)
            };
            Ok(resolved.to_string_lossy().into_owned())
        }
        // Not a symlink; the path is already the device
        Err(_) => Ok(first.to_string_lossy().into_owned()),
    }
}

fn device_base_name(device: &str) -> Result<String> {
    Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Internal(format!("cannot derive device name from {}", device)))
}

/// Multipath friendly name (`/dev/mapper/...`) behind a consistent device
/// path.
pub fn multipath_friendly_name(consistent_device_path: &str) -> Result<String> {
    let resolved = resolve_device(consistent_device_path)?;
    if !resolved.starts_with("/dev/mapper/") {
        return Err(Error::DevicePathNotFound {
            path: consistent_device_path.to_string(),
        });
    }
    Ok(resolved)
}

/// All by-path links resolving to the given device.
pub fn disk_by_paths_for_device(device: &str) -> Result<Vec<String>> {
    let pattern = format!("{}/*", DISK_BY_PATH_FOLDER);
    let mut out = Vec::new();
    for entry in glob::glob(&pattern)
        .map_err(|err| Error::Internal(format!("bad glob pattern {}: {}", pattern, err)))?
        .flatten()
    {
        if let Ok(target) = std::fs::canonicalize(&entry) {
            if target.to_string_lossy() == device {
                out.push(entry.to_string_lossy().into_owned());
            }
        }
    }
    Ok(out)
}
