//! Shared helpers: size math, handle validation, host probes
//!
//! Leaf utilities used by both controller and node halves. Nothing here
//! talks to the cloud control plane.

pub mod locks;
pub mod params;

use async_trait::async_trait;
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// =============================================================================
// Size Constants
// =============================================================================

/// 1 KiB in bytes
pub const KIB: i64 = 1 << 10;
/// 1 MiB in bytes
pub const MIB: i64 = 1 << 20;
/// 1 GiB in bytes
pub const GIB: i64 = 1 << 30;
/// 1 TiB in bytes
pub const TIB: i64 = 1 << 40;

/// Smallest block volume the service provisions.
pub const MINIMUM_VOLUME_SIZE_BYTES: i64 = 50 * GIB;
/// Largest block volume the service provisions.
pub const MAXIMUM_VOLUME_SIZE_BYTES: i64 = 32 * TIB;
/// Size used when the request carries no capacity range.
pub const DEFAULT_VOLUME_SIZE_BYTES: i64 = MINIMUM_VOLUME_SIZE_BYTES;

/// Upper bound on defined tags attached to a single volume.
pub const MAX_DEFINED_TAGS_PER_VOLUME: usize = 64;

// =============================================================================
// Topology Labels
// =============================================================================

/// Preferred zone label.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
/// Deprecated zone label, still honored.
pub const LABEL_ZONE_FAILURE_DOMAIN: &str = "failure-domain.beta.kubernetes.io/zone";

/// Reduces a full AD label `<tenancy-prefix>:<REGION>-AD-<n>` to the part
/// after the last `:`. Returns None when there is no prefix to strip.
pub fn availability_domain_from_node_label(full: &str) -> Option<String> {
    let (_, short) = full.rsplit_once(':')?;
    if short.is_empty() {
        None
    } else {
        Some(short.to_string())
    }
}

// =============================================================================
// Size Math
// =============================================================================

/// Rounds `size_bytes` up to a whole number of `allocation_unit_bytes`.
pub fn round_up_size(size_bytes: i64, allocation_unit_bytes: i64) -> i64 {
    (size_bytes + allocation_unit_bytes - 1) / allocation_unit_bytes
}

/// Resolves a capacity range into the provisioned size in bytes.
///
/// No range or an empty range selects the default. A limit below the
/// required amount, or any bound outside [minimum, maximum], fails.
pub fn extract_storage(capacity_range: Option<crate::csi::CapacityRange>) -> Result<i64> {
    let Some(range) = capacity_range else {
        return Ok(DEFAULT_VOLUME_SIZE_BYTES);
    };

    let required = range.required_bytes;
    let limit = range.limit_bytes;
    let required_set = required > 0;
    let limit_set = limit > 0;

    if !required_set && !limit_set {
        return Ok(DEFAULT_VOLUME_SIZE_BYTES);
    }
    if required_set && limit_set && limit < required {
        return Err(Error::InvalidArgument(format!(
            "limit ({}) can not be less than required ({}) size",
            format_bytes(limit),
            format_bytes(required)
        )));
    }
    if required_set && !limit_set && required < MINIMUM_VOLUME_SIZE_BYTES {
        return Ok(MINIMUM_VOLUME_SIZE_BYTES);
    }
    if limit_set && limit < MINIMUM_VOLUME_SIZE_BYTES {
        return Err(Error::CapacityOutOfRange {
            requested: limit,
            min: MINIMUM_VOLUME_SIZE_BYTES,
            max: MAXIMUM_VOLUME_SIZE_BYTES,
        });
    }
    if required_set && required > MAXIMUM_VOLUME_SIZE_BYTES {
        return Err(Error::CapacityOutOfRange {
            requested: required,
            min: MINIMUM_VOLUME_SIZE_BYTES,
            max: MAXIMUM_VOLUME_SIZE_BYTES,
        });
    }
    if !required_set && limit_set && limit > MAXIMUM_VOLUME_SIZE_BYTES {
        return Err(Error::CapacityOutOfRange {
            requested: limit,
            min: MINIMUM_VOLUME_SIZE_BYTES,
            max: MAXIMUM_VOLUME_SIZE_BYTES,
        });
    }

    if required_set {
        Ok(required)
    } else {
        Ok(limit)
    }
}

/// Human-readable byte count with binary suffixes.
pub fn format_bytes(input: i64) -> String {
    let mut output = input as f64;
    let mut unit = "";

    if input >= TIB {
        output = output / TIB as f64;
        unit = "Ti";
    } else if input >= GIB {
        output = output / GIB as f64;
        unit = "Gi";
    } else if input >= MIB {
        output = output / MIB as f64;
        unit = "Mi";
    } else if input >= KIB {
        output = output / KIB as f64;
        unit = "Ki";
    }

    if unit.is_empty() {
        format!("{}", input)
    } else {
        let formatted = format!("{:.2}", output);
        let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
        format!("{}{}", trimmed, unit)
    }
}

// =============================================================================
// Filesystem Types
// =============================================================================

/// Filesystems formatted by the block node agent. Anything else falls back
/// to ext4.
pub fn validate_fs_type(fs_type: &str) -> String {
    match fs_type {
        "ext4" | "ext3" | "xfs" => fs_type.to_string(),
        "" => "ext4".to_string(),
        other => {
            warn!(fs_type = other, "unsupported fsType, defaulting to ext4");
            "ext4".to_string()
        }
    }
}

// =============================================================================
// Volume Handles
// =============================================================================

/// Parsed shared-FS volume handle `<fs-ocid>:<mount-target-ip>:<export-path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FssVolumeHandle {
    pub filesystem_ocid: String,
    pub mount_target_ip: String,
    pub export_path: String,
}

impl FssVolumeHandle {
    /// Parses and validates a shared-FS handle. The second part must be an
    /// IPv4 literal and the third must begin with `/`.
    pub fn parse(volume_id: &str) -> Result<Self> {
        let parts: Vec<&str> = volume_id.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidVolumeHandle {
                handle: volume_id.to_string(),
                reason: "expected <filesystem-ocid>:<mount-target-ip>:<export-path>".to_string(),
            });
        }
        if parts[1].parse::<Ipv4Addr>().is_err() {
            return Err(Error::InvalidVolumeHandle {
                handle: volume_id.to_string(),
                reason: format!("mount target address {} is not a valid IPv4 literal", parts[1]),
            });
        }
        if !parts[2].starts_with('/') {
            return Err(Error::InvalidVolumeHandle {
                handle: volume_id.to_string(),
                reason: "export path must begin with /".to_string(),
            });
        }
        Ok(FssVolumeHandle {
            filesystem_ocid: parts[0].to_string(),
            mount_target_ip: parts[1].to_string(),
            export_path: parts[2].to_string(),
        })
    }

    pub fn to_volume_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.filesystem_ocid, self.mount_target_ip, self.export_path
        )
    }
}

/// Validates a Lustre handle `<ipv4>@<label>[:<ipv4>@<label>]:/<fsname>`.
///
/// Returns validity plus the LNet label of the last well-formed NID, which
/// callers use for LNet bring-up even when overall validation fails.
pub fn validate_lustre_volume_id(volume_id: &str) -> (bool, String) {
    let parts: Vec<&str> = volume_id.split(':').collect();
    let mut lnet_label = String::new();

    if parts.len() < 2 {
        return (false, lnet_label);
    }

    for nid in &parts[..parts.len() - 1] {
        let Some((ip, label)) = nid.split_once('@') else {
            return (false, lnet_label);
        };
        if ip.parse::<Ipv4Addr>().is_err() || label.is_empty() {
            return (false, lnet_label);
        }
        lnet_label = label.to_string();
    }

    if !parts[parts.len() - 1].starts_with('/') {
        return (false, lnet_label);
    }

    (true, lnet_label)
}

// =============================================================================
// Device Paths
// =============================================================================

/// iSCSI by-path device for the standard single-LUN attachment.
pub fn iscsi_device_path(ip: &str, port: i32, iqn: &str) -> String {
    format!("/dev/disk/by-path/ip-{}:{}-iscsi-{}-lun-1", ip, port, iqn)
}

fn paravirtualized_device_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/dev/disk/by-path/pci-\w{4}:\w{2}:\w{2}\.\d+-scsi-\d+:\d+:\d+:\d+$")
            .unwrap()
    })
}

fn iscsi_device_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/dev/disk/by-path/ip-[\w\.]+:\d+-iscsi-[\w\.\-:]+-lun-\d+$").unwrap()
    })
}

/// Prefix of multipath friendly names.
pub const DEV_MAPPER_PREFIX: &str = "/dev/mapper";

/// Attachment flavor recovered from a by-path device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePathKind {
    Iscsi,
    Paravirtualized,
    Multipath,
}

/// Classifies a device path into its attachment flavor.
pub fn classify_device_path(path: &str) -> Option<DevicePathKind> {
    if path.starts_with(DEV_MAPPER_PREFIX) {
        Some(DevicePathKind::Multipath)
    } else if iscsi_device_regex().is_match(path) {
        Some(DevicePathKind::Iscsi)
    } else if paravirtualized_device_regex().is_match(path) {
        Some(DevicePathKind::Paravirtualized)
    } else {
        None
    }
}

// =============================================================================
// Host Probes
// =============================================================================

/// Kernel FIPS mode knob.
pub const FIPS_ENABLED_PATH: &str = "/proc/sys/crypto/fips_enabled";

/// In-transit encryption helper package.
pub const IN_TRANSIT_ENCRYPTION_PACKAGE: &str = "oci-fss-utils";

/// True when the kernel reports FIPS mode. Absence of the knob means off.
pub fn is_fips_enabled(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => content.contains('1'),
        Err(_) => false,
    }
}

// =============================================================================
// Host Command Execution
// =============================================================================

/// Captured result of a host command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes host commands (iscsiadm, mount, lnetctl...). Abstracted so node
/// agents are testable without a privileged host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the program and captures its exit status and streams. Errors
    /// only when the program cannot be spawned.
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Runs the program, returning stdout. A non-zero exit is an error
    /// carrying stderr.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Command {
                command: format!("{} {}", program, args.join(" ")),
                stderr: if output.stderr.is_empty() {
                    output.stdout
                } else {
                    output.stderr
                },
            })
        }
    }
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

/// Runs commands on the host via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "exec");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Checks for the in-transit encryption helper via the package manager,
/// rpm first with a dpkg fallback.
pub async fn is_in_transit_encryption_package_installed(
    runner: &dyn CommandRunner,
) -> Result<bool> {
    if runner
        .run("rpm", &["-q", IN_TRANSIT_ENCRYPTION_PACKAGE])
        .await
        .is_ok()
    {
        return Ok(true);
    }
    match runner
        .run("dpkg", &["-l", IN_TRANSIT_ENCRYPTION_PACKAGE])
        .await
    {
        Ok(out) => Ok(out.contains(IN_TRANSIT_ENCRYPTION_PACKAGE)),
        Err(_) => Ok(false),
    }
}
