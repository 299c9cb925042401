//! Cloud capability ports
//!
//! Trait definitions for the slices of the cloud control plane the plugin
//! consumes: block storage, compute (attachments), file storage, identity
//! and virtual networking. Adapters over the real SDK implement these;
//! tests use hand-rolled fakes.

pub mod classify;
pub mod poll;

pub use classify::{ErrorClass, ServiceError, RESOURCE_TRACKING_TAG_NAMESPACE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

// =============================================================================
// Tag Maps
// =============================================================================

/// Freeform tags: flat string map.
pub type FreeformTags = HashMap<String, String>;

/// Defined tags: namespace -> key -> value.
pub type DefinedTags = HashMap<String, HashMap<String, serde_json::Value>>;

// =============================================================================
// Block Volume Types
// =============================================================================

/// Block volume lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeLifecycle {
    Provisioning,
    Restoring,
    Available,
    Terminating,
    Terminated,
    Faulty,
}

/// Source a new volume is populated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    Backup { id: String },
    Volume { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub size_in_gbs: i64,
    pub vpus_per_gb: i64,
    pub lifecycle_state: VolumeLifecycle,
    /// Clones report hydration separately from lifecycle.
    pub is_hydrated: bool,
    pub source: Option<VolumeSource>,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

#[derive(Debug, Clone, Default)]
pub struct CreateVolumeDetails {
    pub compartment_id: String,
    pub availability_domain: String,
    pub display_name: String,
    pub size_in_gbs: i64,
    pub vpus_per_gb: i64,
    pub kms_key_id: Option<String>,
    pub source: Option<VolumeSource>,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

// =============================================================================
// Volume Attachment Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentLifecycle {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// Attachment flavor requested at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Iscsi,
    Paravirtualized,
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentKind::Iscsi => write!(f, "iscsi"),
            AttachmentKind::Paravirtualized => write!(f, "paravirtualized"),
        }
    }
}

/// One path of a multipath (UHP) attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    pub ipv4: String,
    pub port: i32,
    pub iqn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub volume_id: String,
    pub instance_id: String,
    pub compartment_id: String,
    pub lifecycle_state: AttachmentLifecycle,
    pub kind: AttachmentKind,
    /// Consistent device path for paravirtualized and UHP attachments.
    pub device: Option<String>,
    pub iscsi_iqn: Option<String>,
    pub iscsi_ip: Option<String>,
    pub iscsi_port: Option<i32>,
    pub is_multipath: bool,
    pub multipath_devices: Vec<MultipathDevice>,
    pub is_shareable: bool,
    pub is_pv_encryption_in_transit_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AttachVolumeDetails {
    pub instance_id: String,
    pub volume_id: String,
    pub kind: AttachmentKind,
    pub is_shareable: bool,
    pub is_read_only: bool,
    pub is_pv_encryption_in_transit_enabled: bool,
}

// =============================================================================
// Backup Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupLifecycle {
    Creating,
    Available,
    Terminating,
    Terminated,
    Faulty,
    RequestReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Incremental,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBackup {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub volume_id: String,
    pub size_in_gbs: i64,
    pub lifecycle_state: BackupLifecycle,
    pub time_created: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateBackupDetails {
    pub volume_id: String,
    pub compartment_id: String,
    pub display_name: String,
    pub backup_type: BackupType,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

// =============================================================================
// File Storage Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FssLifecycle {
    Creating,
    Active,
    Deleting,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystem {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub lifecycle_state: FssLifecycle,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

#[derive(Debug, Clone, Default)]
pub struct CreateFileSystemDetails {
    pub compartment_id: String,
    pub availability_domain: String,
    pub display_name: String,
    pub kms_key_id: Option<String>,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountTarget {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub subnet_id: String,
    pub lifecycle_state: FssLifecycle,
    pub private_ip_ids: Vec<String>,
    pub export_set_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateMountTargetDetails {
    pub compartment_id: String,
    pub availability_domain: String,
    pub display_name: String,
    pub subnet_id: String,
    pub freeform_tags: FreeformTags,
    pub defined_tags: DefinedTags,
}

/// Client access rule on an export; passed through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOption {
    pub source: String,
    #[serde(default)]
    pub require_privileged_source_port: bool,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub identity_squash: Option<String>,
    #[serde(default)]
    pub anonymous_uid: Option<i64>,
    #[serde(default)]
    pub anonymous_gid: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub id: String,
    pub export_set_id: String,
    pub file_system_id: String,
    pub path: String,
    pub lifecycle_state: FssLifecycle,
    pub export_options: Vec<ExportOption>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateExportDetails {
    pub export_set_id: String,
    pub file_system_id: String,
    pub path: String,
    pub export_options: Vec<ExportOption>,
}

// =============================================================================
// Compute / Identity / Networking Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub compartment_id: String,
    pub availability_domain: String,
    /// From the instance launch options; gates in-transit encryption.
    pub is_pv_encryption_in_transit_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityDomain {
    /// Full name, e.g. `zkJl:US-ASHBURN-AD-1`.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateIp {
    pub id: String,
    pub ip_address: String,
}

// =============================================================================
// Capability Ports
// =============================================================================

/// Block storage operations.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    async fn get_volume(&self, id: &str) -> Result<Volume>;
    async fn get_volumes_by_name(&self, name: &str, compartment_id: &str) -> Result<Vec<Volume>>;
    async fn create_volume(&self, details: CreateVolumeDetails) -> Result<Volume>;
    async fn delete_volume(&self, id: &str) -> Result<()>;
    async fn update_volume_size(&self, id: &str, size_in_gbs: i64) -> Result<Volume>;

    async fn get_volume_backup(&self, id: &str) -> Result<VolumeBackup>;
    async fn get_volume_backups_by_name(
        &self,
        name: &str,
        compartment_id: &str,
    ) -> Result<Vec<VolumeBackup>>;
    async fn create_volume_backup(&self, details: CreateBackupDetails) -> Result<VolumeBackup>;
    async fn delete_volume_backup(&self, id: &str) -> Result<()>;
}

/// Compute operations (instances and volume attachments).
#[async_trait]
pub trait Compute: Send + Sync {
    async fn get_instance(&self, id: &str) -> Result<Instance>;
    async fn get_volume_attachment(&self, id: &str) -> Result<VolumeAttachment>;
    /// Finds the newest non-detached attachment for the volume, if any.
    async fn find_volume_attachment(
        &self,
        compartment_id: &str,
        volume_id: &str,
    ) -> Result<Option<VolumeAttachment>>;
    async fn attach_volume(&self, details: AttachVolumeDetails) -> Result<VolumeAttachment>;
    async fn detach_volume(&self, attachment_id: &str) -> Result<()>;
}

/// File storage operations.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn get_file_system(&self, id: &str) -> Result<FileSystem>;
    async fn get_file_systems_by_name(
        &self,
        name: &str,
        compartment_id: &str,
        availability_domain: &str,
    ) -> Result<Vec<FileSystem>>;
    async fn create_file_system(&self, details: CreateFileSystemDetails) -> Result<FileSystem>;
    async fn delete_file_system(&self, id: &str) -> Result<()>;

    async fn get_mount_target(&self, id: &str) -> Result<MountTarget>;
    async fn get_mount_targets_by_name(
        &self,
        name: &str,
        compartment_id: &str,
        availability_domain: &str,
    ) -> Result<Vec<MountTarget>>;
    async fn create_mount_target(&self, details: CreateMountTargetDetails) -> Result<MountTarget>;
    async fn delete_mount_target(&self, id: &str) -> Result<()>;

    async fn get_export(&self, id: &str) -> Result<Export>;
    /// Looks an export up by (file system, path, export set).
    async fn find_export(
        &self,
        file_system_id: &str,
        path: &str,
        export_set_id: &str,
    ) -> Result<Option<Export>>;
    async fn create_export(&self, details: CreateExportDetails) -> Result<Export>;
    async fn delete_export(&self, id: &str) -> Result<()>;
}

/// Identity operations.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Resolves an AD by full or short name within the compartment.
    async fn get_availability_domain_by_name(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> Result<AvailabilityDomain>;
}

/// Virtual networking operations.
#[async_trait]
pub trait VirtualNetwork: Send + Sync {
    async fn get_private_ip(&self, id: &str) -> Result<PrivateIp>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BlockStorageRef = Arc<dyn BlockStorage>;
pub type ComputeRef = Arc<dyn Compute>;
pub type FileStorageRef = Arc<dyn FileStorage>;
pub type IdentityRef = Arc<dyn Identity>;
pub type VirtualNetworkRef = Arc<dyn VirtualNetwork>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_kind_display() {
        assert_eq!(format!("{}", AttachmentKind::Iscsi), "iscsi");
        assert_eq!(
            format!("{}", AttachmentKind::Paravirtualized),
            "paravirtualized"
        );
    }

    #[test]
    fn test_export_option_parse() {
        let raw = r#"[{"source":"10.0.0.0/16","requirePrivilegedSourcePort":true,"access":"READ_WRITE"}]"#;
        let opts: Vec<ExportOption> = serde_json::from_str(raw).unwrap();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].source, "10.0.0.0/16");
        assert!(opts[0].require_privileged_source_port);
        assert_eq!(opts[0].access.as_deref(), Some("READ_WRITE"));
    }
}
