//! CSI v1 surface types
//!
//! Request/response shapes and service traits for the Identity, Controller
//! and Node services. The gRPC transport that carries these is supplied by
//! the process wiring; the services here are plain async traits so they can
//! be exercised directly in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

// =============================================================================
// Status Codes
// =============================================================================

/// Status codes surfaced to the orchestrator, mirroring gRPC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    DeadlineExceeded,
    ResourceExhausted,
    Internal,
    Unimplemented,
}

// =============================================================================
// Capabilities
// =============================================================================

/// Controller service capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ExpandVolume,
    CreateDeleteSnapshot,
    CloneVolume,
}

/// Node service capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

/// Volume access modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Multi-node modes allow the volume to be attached as sharable.
    pub fn is_multi_node(&self) -> bool {
        matches!(
            self,
            AccessMode::MultiNodeReaderOnly
                | AccessMode::MultiNodeSingleWriter
                | AccessMode::MultiNodeMultiWriter
        )
    }
}

/// How the volume is consumed on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// Mounted filesystem with an optional fs type and mount flags
    Mount {
        fs_type: Option<String>,
        mount_flags: Vec<String>,
    },
    /// Raw block device
    Block,
}

/// A requested volume capability: access type plus access mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    pub fn mount(access_mode: AccessMode) -> Self {
        VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: None,
                mount_flags: Vec::new(),
            },
            access_mode,
        }
    }

    pub fn is_block(&self) -> bool {
        self.access_type == AccessType::Block
    }

    pub fn fs_type(&self) -> Option<&str> {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } => fs_type.as_deref(),
            AccessType::Block => None,
        }
    }

    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

// =============================================================================
// Topology
// =============================================================================

/// A topology segment map (label key -> value).
pub type Topology = HashMap<String, String>;

/// Topology requirement carried on CreateVolume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyRequirement {
    pub requisite: Vec<Topology>,
    pub preferred: Vec<Topology>,
}

// =============================================================================
// Controller Requests / Responses
// =============================================================================

/// Capacity bounds for CreateVolume; zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

/// Content source for CreateVolume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
    pub accessibility_requirements: Option<TopologyRequirement>,
    pub volume_content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub accessible_topology: Vec<Topology>,
    pub volume_context: HashMap<String, String>,
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeResponse {
    pub volume: CreatedVolume,
}

#[derive(Debug, Clone)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// Present when the capabilities are supported as requested.
    pub confirmed: Option<Vec<VolumeCapability>>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: i64,
    pub creation_time: chrono::DateTime<chrono::Utc>,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

// =============================================================================
// Node Requests / Responses
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub publish_context: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub target_path: String,
    pub publish_context: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
    pub volume_capability: Option<VolumeCapability>,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
    pub accessible_topology: Topology,
}

#[derive(Debug, Clone)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
}

/// One usage entry of a NodeGetVolumeStats response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: UsageUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone)]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Debug, Clone)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

// =============================================================================
// Service Traits
// =============================================================================

/// CSI Identity service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn get_plugin_info(&self) -> Result<PluginInfo>;
    async fn probe(&self) -> Result<bool>;
}

/// CSI Controller service.
#[async_trait]
pub trait ControllerService: Send + Sync {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse>;
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()>;
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse>;
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<()>;
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse>;
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse>;
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<CreateSnapshotResponse>;
    async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<()>;

    fn capabilities(&self) -> Vec<ControllerCapability>;
}

/// CSI Node service.
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()>;
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<()>;
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<()>;
    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<()>;
    async fn node_get_info(&self) -> Result<NodeGetInfoResponse>;
    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse>;
    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse>;

    fn capabilities(&self) -> Vec<NodeCapability>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_sharable() {
        assert!(AccessMode::MultiNodeMultiWriter.is_multi_node());
        assert!(AccessMode::MultiNodeReaderOnly.is_multi_node());
        assert!(!AccessMode::SingleNodeWriter.is_multi_node());
    }

    #[test]
    fn test_capability_accessors() {
        let cap = VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: Some("ext4".into()),
                mount_flags: vec!["noatime".into()],
            },
            access_mode: AccessMode::SingleNodeWriter,
        };
        assert!(!cap.is_block());
        assert_eq!(cap.fs_type(), Some("ext4"));
        assert_eq!(cap.mount_flags(), &["noatime".to_string()]);

        let block = VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::SingleNodeWriter,
        };
        assert!(block.is_block());
        assert_eq!(block.fs_type(), None);
    }
}
