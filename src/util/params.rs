//! Parameter extraction
//!
//! Storage-class parameters, snapshot parameters, publish context and
//! volume context travel as opaque string maps. This module validates them
//! into typed shapes with enumerated accepted keys.

use std::collections::HashMap;

use crate::cloud::{AttachmentKind, BackupType, DefinedTags, FreeformTags, MultipathDevice};
use crate::error::{Error, Result};

// =============================================================================
// Parameter Keys
// =============================================================================

pub const ATTACHMENT_TYPE: &str = "attachment-type";
pub const KMS_KEY_ID: &str = "kms-key-id";
pub const VPUS_PER_GB: &str = "vpusPerGB";
pub const INITIAL_FREEFORM_TAGS_OVERRIDE: &str =
    "oci.oraclecloud.com/initial-freeform-tags-override";
pub const INITIAL_DEFINED_TAGS_OVERRIDE: &str =
    "oci.oraclecloud.com/initial-defined-tags-override";
pub const BACKUP_TYPE: &str = "backupType";

// Publish-context keys
pub const DEVICE_PATH: &str = "device";
pub const ISCSI_IQN: &str = "iscsi_iqn";
pub const ISCSI_IP: &str = "iscsi_ip";
pub const ISCSI_PORT: &str = "iscsi_port";
pub const NEED_RESIZE: &str = "needResize";
pub const NEW_SIZE: &str = "newSize";
pub const MULTIPATH_ENABLED: &str = "multipathEnabled";
pub const MULTIPATH_DEVICES: &str = "multipathDevices";

// Volume-context keys
pub const ENCRYPT_IN_TRANSIT: &str = "encryptInTransit";
pub const SETUP_LNET: &str = "setupLnet";
pub const LUSTRE_SUBNET_CIDR: &str = "lustreSubnetCidr";
pub const LUSTRE_POST_MOUNT_PARAMETERS: &str = "lustrePostMountParameters";

// Shared-FS storage-class parameter keys
pub const AVAILABILITY_DOMAIN: &str = "availabilityDomain";
pub const COMPARTMENT_OCID: &str = "compartmentOcid";
pub const MOUNT_TARGET_OCID: &str = "mountTargetOcid";
pub const MOUNT_TARGET_SUBNET_OCID: &str = "mountTargetSubnetOcid";
pub const EXPORT_PATH: &str = "exportPath";
pub const EXPORT_OPTIONS: &str = "exportOptions";
pub const KMS_KEY_OCID: &str = "kmsKeyOcid";

/// Balanced performance tier, the default.
pub const VPUS_BALANCED: i64 = 10;
/// Higher performance tier; stage bumps the iSCSI queue depth for it.
pub const VPUS_HIGHER: i64 = 20;
/// Tiers at or above this use UHP multipath attachments.
pub const VPUS_UHP_MIN: i64 = 30;
pub const VPUS_MAX: i64 = 120;

/// True when the tier implies a UHP multipath attachment.
pub fn is_uhp(vpus_per_gb: i64) -> bool {
    (VPUS_UHP_MIN..=VPUS_MAX).contains(&vpus_per_gb)
}

// =============================================================================
// Block Volume Parameters
// =============================================================================

/// Typed view of block-volume storage-class parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeParameters {
    pub attachment_kind: AttachmentKind,
    pub kms_key_id: Option<String>,
    pub vpus_per_gb: i64,
    pub freeform_tags: Option<FreeformTags>,
    pub defined_tags: Option<DefinedTags>,
}

impl Default for VolumeParameters {
    fn default() -> Self {
        VolumeParameters {
            attachment_kind: AttachmentKind::Iscsi,
            kms_key_id: None,
            vpus_per_gb: VPUS_BALANCED,
            freeform_tags: None,
            defined_tags: None,
        }
    }
}

fn parse_attachment_kind(raw: &str) -> Result<AttachmentKind> {
    match raw.to_lowercase().as_str() {
        "iscsi" => Ok(AttachmentKind::Iscsi),
        "paravirtualized" => Ok(AttachmentKind::Paravirtualized),
        other => Err(Error::InvalidArgument(format!(
            "invalid attachment-type {}, supported values are iscsi and paravirtualized",
            other
        ))),
    }
}

fn parse_vpus(raw: &str) -> Result<i64> {
    let vpus: i64 = raw.parse().map_err(|_| {
        Error::InvalidArgument(format!("failed to parse vpusPerGB {} as an integer", raw))
    })?;
    if !(0..=VPUS_MAX).contains(&vpus) {
        return Err(Error::InvalidArgument(format!(
            "vpusPerGB must be in the range 0..={}, got {}",
            VPUS_MAX, vpus
        )));
    }
    Ok(vpus)
}

/// Extracts and validates block-volume parameters.
pub fn extract_volume_parameters(
    parameters: &HashMap<String, String>,
) -> Result<VolumeParameters> {
    let mut out = VolumeParameters::default();

    for (key, value) in parameters {
        match key.as_str() {
            ATTACHMENT_TYPE => out.attachment_kind = parse_attachment_kind(value)?,
            KMS_KEY_ID => out.kms_key_id = Some(value.clone()),
            VPUS_PER_GB => out.vpus_per_gb = parse_vpus(value)?,
            INITIAL_FREEFORM_TAGS_OVERRIDE => {
                out.freeform_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse freeform tags override: {}",
                        err
                    ))
                })?)
            }
            INITIAL_DEFINED_TAGS_OVERRIDE => {
                out.defined_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse defined tags override: {}",
                        err
                    ))
                })?)
            }
            _ => {}
        }
    }

    Ok(out)
}

// =============================================================================
// Snapshot Parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotParameters {
    pub backup_type: BackupType,
    pub freeform_tags: Option<FreeformTags>,
    pub defined_tags: Option<DefinedTags>,
}

impl Default for SnapshotParameters {
    fn default() -> Self {
        SnapshotParameters {
            backup_type: BackupType::Incremental,
            freeform_tags: None,
            defined_tags: None,
        }
    }
}

/// Extracts and validates snapshot parameters.
pub fn extract_snapshot_parameters(
    parameters: &HashMap<String, String>,
) -> Result<SnapshotParameters> {
    let mut out = SnapshotParameters::default();

    for (key, value) in parameters {
        match key.as_str() {
            BACKUP_TYPE => {
                out.backup_type = match value.to_lowercase().as_str() {
                    "incremental" => BackupType::Incremental,
                    "full" => BackupType::Full,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "invalid backupType {}, supported values are incremental and full",
                            other
                        )))
                    }
                }
            }
            INITIAL_FREEFORM_TAGS_OVERRIDE => {
                out.freeform_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse freeform tags override: {}",
                        err
                    ))
                })?)
            }
            INITIAL_DEFINED_TAGS_OVERRIDE => {
                out.defined_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse defined tags override: {}",
                        err
                    ))
                })?)
            }
            _ => {}
        }
    }

    Ok(out)
}

// =============================================================================
// Shared-FS Parameters
// =============================================================================

/// Typed view of shared-FS storage-class parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FssParameters {
    pub availability_domain: String,
    pub compartment_ocid: Option<String>,
    pub mount_target_ocid: Option<String>,
    pub mount_target_subnet_ocid: Option<String>,
    pub export_path: Option<String>,
    pub export_options: Vec<crate::cloud::ExportOption>,
    pub encrypt_in_transit: bool,
    pub kms_key_ocid: Option<String>,
    pub freeform_tags: Option<FreeformTags>,
    pub defined_tags: Option<DefinedTags>,
}

/// Extracts and validates shared-FS parameters. `availabilityDomain` is
/// required; exactly one of `mountTargetOcid` and `mountTargetSubnetOcid`
/// must be supplied.
pub fn extract_fss_parameters(parameters: &HashMap<String, String>) -> Result<FssParameters> {
    let mut out = FssParameters::default();

    for (key, value) in parameters {
        match key.as_str() {
            AVAILABILITY_DOMAIN => out.availability_domain = value.clone(),
            COMPARTMENT_OCID => out.compartment_ocid = Some(value.clone()),
            MOUNT_TARGET_OCID => out.mount_target_ocid = Some(value.clone()),
            MOUNT_TARGET_SUBNET_OCID => out.mount_target_subnet_ocid = Some(value.clone()),
            EXPORT_PATH => out.export_path = Some(value.clone()),
            EXPORT_OPTIONS => {
                out.export_options = serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!("failed to parse exportOptions: {}", err))
                })?
            }
            ENCRYPT_IN_TRANSIT => out.encrypt_in_transit = value == "true",
            KMS_KEY_OCID => out.kms_key_ocid = Some(value.clone()),
            INITIAL_FREEFORM_TAGS_OVERRIDE => {
                out.freeform_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse freeform tags override: {}",
                        err
                    ))
                })?)
            }
            INITIAL_DEFINED_TAGS_OVERRIDE => {
                out.defined_tags = Some(serde_json::from_str(value).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "failed to parse defined tags override: {}",
                        err
                    ))
                })?)
            }
            _ => {}
        }
    }

    if out.availability_domain.is_empty() {
        return Err(Error::InvalidArgument(
            "availabilityDomain is a required storage-class parameter".to_string(),
        ));
    }
    match (&out.mount_target_ocid, &out.mount_target_subnet_ocid) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidArgument(
                "mountTargetOcid and mountTargetSubnetOcid are mutually exclusive".to_string(),
            ))
        }
        (None, None) => {
            return Err(Error::InvalidArgument(
                "one of mountTargetOcid or mountTargetSubnetOcid is required".to_string(),
            ))
        }
        _ => {}
    }

    Ok(out)
}

// =============================================================================
// Publish Context
// =============================================================================

/// Typed view of the controller-to-node publish context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishContext {
    pub attachment_kind: Option<AttachmentKind>,
    pub device: Option<String>,
    pub iscsi_iqn: Option<String>,
    pub iscsi_ip: Option<String>,
    pub iscsi_port: Option<i32>,
    pub vpus_per_gb: Option<i64>,
    pub need_resize: bool,
    pub new_size_bytes: Option<i64>,
    pub multipath_enabled: bool,
    pub multipath_devices: Vec<MultipathDevice>,
}

impl PublishContext {
    /// Parses the node-side view of the publish context.
    pub fn from_map(context: &HashMap<String, String>) -> Result<Self> {
        let mut out = PublishContext::default();

        if let Some(raw) = context.get(ATTACHMENT_TYPE) {
            out.attachment_kind = Some(parse_attachment_kind(raw)?);
        }
        out.device = context.get(DEVICE_PATH).cloned();
        out.iscsi_iqn = context.get(ISCSI_IQN).cloned();
        out.iscsi_ip = context.get(ISCSI_IP).cloned();
        if let Some(raw) = context.get(ISCSI_PORT) {
            out.iscsi_port = Some(raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("failed to parse iscsi_port {}", raw))
            })?);
        }
        if let Some(raw) = context.get(VPUS_PER_GB) {
            out.vpus_per_gb = Some(parse_vpus(raw)?);
        }
        out.need_resize = context.get(NEED_RESIZE).map(String::as_str) == Some("true");
        if let Some(raw) = context.get(NEW_SIZE) {
            out.new_size_bytes = Some(raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("failed to parse newSize {}", raw))
            })?);
        }
        out.multipath_enabled = context.get(MULTIPATH_ENABLED).map(String::as_str) == Some("true");
        if let Some(raw) = context.get(MULTIPATH_DEVICES) {
            out.multipath_devices = serde_json::from_str(raw).map_err(|err| {
                Error::InvalidArgument(format!("failed to parse multipathDevices: {}", err))
            })?;
        }

        Ok(out)
    }

    /// Serializes for the wire. Only populated fields are emitted.
    pub fn to_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        if let Some(kind) = self.attachment_kind {
            map.insert(ATTACHMENT_TYPE.to_string(), kind.to_string());
        }
        if let Some(device) = &self.device {
            map.insert(DEVICE_PATH.to_string(), device.clone());
        }
        if let Some(iqn) = &self.iscsi_iqn {
            map.insert(ISCSI_IQN.to_string(), iqn.clone());
        }
        if let Some(ip) = &self.iscsi_ip {
            map.insert(ISCSI_IP.to_string(), ip.clone());
        }
        if let Some(port) = self.iscsi_port {
            map.insert(ISCSI_PORT.to_string(), port.to_string());
        }
        if let Some(vpus) = self.vpus_per_gb {
            map.insert(VPUS_PER_GB.to_string(), vpus.to_string());
        }
        map.insert(NEED_RESIZE.to_string(), self.need_resize.to_string());
        if let Some(new_size) = self.new_size_bytes {
            map.insert(NEW_SIZE.to_string(), new_size.to_string());
        }
        map.insert(
            MULTIPATH_ENABLED.to_string(),
            self.multipath_enabled.to_string(),
        );
        if !self.multipath_devices.is_empty() {
            map.insert(
                MULTIPATH_DEVICES.to_string(),
                serde_json::to_string(&self.multipath_devices)?,
            );
        }
        Ok(map)
    }
}
