//! Block volume node agent
//!
//! Stages attachments onto the host (iSCSI session bring-up, device
//! discovery, format, mount), bind-publishes the staged filesystem into the
//! workload's target path, and grows filesystems online after a cloud-side
//! expansion. All operations serialize per volume through the lock
//! registry.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::csi::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodeService, NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
    UsageUnit, VolumeUsage,
};
use crate::disk::iscsi::IscsiDisk;
use crate::disk::mount::{self, Mounter};
use crate::disk::uhp::UhpDeviceMounter;
use crate::disk::{DeviceMounter, IscsiDeviceMounter, ParavirtualizedDeviceMounter};
use crate::error::{Error, Result};
use crate::k8s::NodeInventoryRef;
use crate::node::{node_topology, MAX_VOLUMES_PER_NODE};
use crate::util::locks::VolumeLocks;
use crate::util::params::{PublishContext, VPUS_BALANCED, VPUS_HIGHER};
use crate::util::{
    classify_device_path, extract_storage, round_up_size, validate_fs_type, CommandRunnerRef,
    DevicePathKind, DEV_MAPPER_PREFIX, GIB,
};
use crate::cloud::{AttachmentKind, MultipathDevice};

/// Poll attempts (1 s apart) for the by-path device to surface after login.
const DEVICE_PATH_RETRIES: u32 = 20;

pub struct BlockVolumeNode {
    node_id: String,
    inventory: NodeInventoryRef,
    runner: CommandRunnerRef,
    locks: VolumeLocks,
}

impl BlockVolumeNode {
    pub fn new(node_id: String, inventory: NodeInventoryRef, runner: CommandRunnerRef) -> Self {
        BlockVolumeNode {
            node_id,
            inventory,
            runner,
            locks: VolumeLocks::new(),
        }
    }

    /// Selects the attachment handler and expected device path for stage.
    fn stage_handler(&self, ctx: &PublishContext) -> Result<(Box<dyn DeviceMounter>, String)> {
        match ctx.attachment_kind.unwrap_or(AttachmentKind::Iscsi) {
            AttachmentKind::Iscsi if ctx.multipath_enabled => {
                let consistent = ctx.device.as_deref().ok_or_else(|| {
                    Error::InvalidArgument(
                        "device must be provided for a multipath enabled volume".to_string(),
                    )
                })?;
                let device_path = mount::multipath_friendly_name(consistent)?;
                let devices = self.multipath_devices(ctx)?;
                Ok((
                    Box::new(UhpDeviceMounter::new(self.runner.clone(), devices)),
                    device_path,
                ))
            }
            AttachmentKind::Iscsi => {
                let disk = iscsi_disk_from_context(ctx)?;
                let device_path = disk.device_path();
                Ok((
                    Box::new(IscsiDeviceMounter::new(self.runner.clone(), disk)),
                    device_path,
                ))
            }
            AttachmentKind::Paravirtualized => {
                let device_path = ctx.device.clone().ok_or_else(|| {
                    Error::InvalidArgument(
                        "device must be provided for a paravirtualized volume".to_string(),
                    )
                })?;
                Ok((
                    Box::new(ParavirtualizedDeviceMounter::new(self.runner.clone())),
                    device_path,
                ))
            }
        }
    }

    /// All iSCSI paths of a multipath volume: the secondaries from the
    /// publish context plus the primary session.
    fn multipath_devices(&self, ctx: &PublishContext) -> Result<Vec<MultipathDevice>> {
        let primary = iscsi_disk_from_context(ctx)?;
        let mut devices = ctx.multipath_devices.clone();
        devices.push(MultipathDevice {
            ipv4: primary.ip,
            port: primary.port,
            iqn: primary.iqn,
        });
        Ok(devices)
    }

    /// Handler for operations that recover the attachment flavor from the
    /// device path instead of the publish context.
    fn device_handler(
        &self,
        kind: DevicePathKind,
        device_path: &str,
    ) -> Result<Box<dyn DeviceMounter>> {
        Ok(match kind {
            DevicePathKind::Iscsi => Box::new(IscsiDeviceMounter::new(
                self.runner.clone(),
                IscsiDisk::from_device_path(device_path)?,
            )),
            DevicePathKind::Multipath => {
                Box::new(UhpDeviceMounter::new(self.runner.clone(), Vec::new()))
            }
            DevicePathKind::Paravirtualized => {
                Box::new(ParavirtualizedDeviceMounter::new(self.runner.clone()))
            }
        })
    }

    /// Device paths behind a mount-table device entry, for classification.
    fn disk_paths_for(&self, device: &str) -> Vec<String> {
        if device.starts_with(DEV_MAPPER_PREFIX) {
            return vec![device.to_string()];
        }
        match mount::disk_by_paths_for_device(device) {
            Ok(paths) if !paths.is_empty() => paths,
            _ => vec![device.to_string()],
        }
    }

    /// Rescans and grows the staged filesystem, then verifies the device
    /// reached the requested size.
    async fn expand_staged_device(
        &self,
        volume_id: &str,
        device_mount_path: &str,
        resize_path: &str,
        requested_size_bytes: i64,
    ) -> Result<i64> {
        let requested_gib = round_up_size(requested_size_bytes, GIB);
        let mounter = Mounter::new(self.runner.clone());
        let mount_point = mounter
            .mount_point_for_path(device_mount_path)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("no mount point found at {}", device_mount_path))
            })?;

        let disk_paths = self.disk_paths_for(&mount_point.device);
        let (kind, device_path) = device_path_and_kind(&disk_paths)?;
        let handler = self.device_handler(kind, &device_path)?;

        handler.rescan(&device_path).await.map_err(|err| {
            Error::Internal(format!(
                "failed to rescan volume {} ({}): {}",
                volume_id, device_path, err
            ))
        })?;
        handler.resize(&device_path, resize_path).await.map_err(|err| {
            Error::Internal(format!(
                "failed to resize volume {} ({}): {}",
                volume_id, device_path, err
            ))
        })?;

        let allocated_bytes = handler.get_block_size_bytes(&device_path).await?;
        let allocated_gib = round_up_size(allocated_bytes, GIB);
        if allocated_gib < requested_gib {
            return Err(Error::Internal(format!(
                "expand volume failed, requested size in GB {} but resize allocated only {}",
                requested_gib, allocated_gib
            )));
        }
        info!(volume_id, allocated_gib, "volume successfully expanded");
        Ok(allocated_bytes)
    }
}

fn iscsi_disk_from_context(ctx: &PublishContext) -> Result<IscsiDisk> {
    match (&ctx.iscsi_iqn, &ctx.iscsi_ip, ctx.iscsi_port) {
        (Some(iqn), Some(ip), Some(port)) => Ok(IscsiDisk::new(iqn, ip, port)),
        _ => Err(Error::InvalidArgument(
            "publish context is missing iscsi_iqn, iscsi_ip or iscsi_port".to_string(),
        )),
    }
}

/// Classifies a set of candidate device paths into the attachment flavor,
/// preferring the paravirtualized pattern.
fn device_path_and_kind(paths: &[String]) -> Result<(DevicePathKind, String)> {
    for path in paths {
        if classify_device_path(path) == Some(DevicePathKind::Paravirtualized) {
            return Ok((DevicePathKind::Paravirtualized, path.clone()));
        }
    }
    for path in paths {
        match classify_device_path(path) {
            Some(kind @ (DevicePathKind::Iscsi | DevicePathKind::Multipath)) => {
                return Ok((kind, path.clone()))
            }
            _ => {}
        }
    }
    Err(Error::Internal(
        "unable to determine the attachment type".to_string(),
    ))
}

#[async_trait]
impl NodeService for BlockVolumeNode {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.publish_context.is_empty() {
            return Err(Error::InvalidArgument("publish context must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }
        let capability = req.volume_capability.as_ref().ok_or_else(|| {
            Error::InvalidArgument("volume capability must be provided".to_string())
        })?;

        let ctx = PublishContext::from_map(&req.publish_context)?;
        let (handler, device_path) = self.stage_handler(&ctx)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        if handler.device_opened(&device_path).await? {
            info!(volume_id = %req.volume_id, "volume is already mounted on the staging path");
            return Ok(());
        }

        handler.add_to_db().await?;
        if ctx.vpus_per_gb.unwrap_or(VPUS_BALANCED) == VPUS_HIGHER {
            handler.update_queue_depth().await?;
        }
        handler.set_automatic_login().await?;
        handler.login().await?;
        handler.wait_for_volume_login().await?;
        if !handler
            .wait_for_device_path(&device_path, DEVICE_PATH_RETRIES)
            .await
        {
            return Err(Error::DeadlineExceeded(format!(
                "device path {} to appear",
                device_path
            )));
        }

        let fs_type = validate_fs_type(capability.fs_type().unwrap_or(""));
        let mut options = capability.mount_flags().to_vec();
        // XFS refuses two mounts with the same UUID; required when a volume
        // and its snapshot restore land on the same node.
        if fs_type == "xfs" && !options.iter().any(|o| o == "nouuid") {
            options.push("nouuid".to_string());
        }

        tokio::fs::create_dir_all(&req.staging_target_path)
            .await
            .map_err(|err| {
                Error::Internal(format!("failed to create staging target path directory: {}", err))
            })?;

        match handler.get_disk_format(&device_path).await {
            Ok(Some(existing)) if existing != fs_type => {
                return Err(Error::Mount(format!(
                    "filesystem type mismatch: the volume is formatted {} but {} was requested; change the requested fsType to match",
                    existing, fs_type
                )));
            }
            Ok(_) => {}
            Err(err) => warn!(%device_path, %err, "failed to probe disk format"),
        }

        info!(volume_id = %req.volume_id, %device_path, %fs_type, "mounting the volume to the staging path");
        handler
            .format_and_mount(&device_path, &req.staging_target_path, &fs_type, &options)
            .await?;
        Ok(())
    }

    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let mounter = Mounter::new(self.runner.clone());
        let Some(mount_point) = mounter
            .mount_point_for_path(&req.staging_target_path)
            .await?
        else {
            warn!(volume_id = %req.volume_id, staging_path = %req.staging_target_path,
                "unable to fetch mount point, nothing to unstage");
            return Ok(());
        };

        let disk_paths = self.disk_paths_for(&mount_point.device);
        let (kind, device_path) = device_path_and_kind(&disk_paths)?;
        let handler = self.device_handler(kind, &device_path)?;

        if !handler.device_opened(&device_path).await? {
            info!(volume_id = %req.volume_id, "volume is already unmounted on the staging path");
            return Ok(());
        }

        handler.unmount_path(&req.staging_target_path).await?;
        handler.logout().await?;
        handler.remove_from_db().await?;
        info!(volume_id = %req.volume_id, %device_path, staging_path = %req.staging_target_path,
            "unmounting the volume from the staging path is completed");
        Ok(())
    }

    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.publish_context.is_empty() {
            return Err(Error::InvalidArgument("publish context must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path must be provided".to_string()));
        }
        let capability = req.volume_capability.as_ref().ok_or_else(|| {
            Error::InvalidArgument("volume capability must be provided".to_string())
        })?;

        let ctx = PublishContext::from_map(&req.publish_context)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        // The orchestrator no longer pre-creates the target directory.
        tokio::fs::create_dir_all(&req.target_path).await.map_err(|err| {
            Error::Internal(format!("failed to create target path directory: {}", err))
        })?;

        let fs_type = validate_fs_type(capability.fs_type().unwrap_or(""));
        let mut options = capability.mount_flags().to_vec();
        options.push("bind".to_string());
        if req.readonly {
            options.push("ro".to_string());
        }
        if fs_type == "xfs" && !options.iter().any(|o| o == "nouuid") {
            options.push("nouuid".to_string());
        }

        let mounter = Mounter::new(self.runner.clone());
        mounter
            .mount(&req.staging_target_path, &req.target_path, &fs_type, &options)
            .await?;
        info!(volume_id = %req.volume_id, target_path = %req.target_path,
            "publish volume to the node is completed");

        // Volumes restored from a larger snapshot arrive needing an online
        // grow to their requested size.
        if ctx.need_resize {
            let requested = ctx.new_size_bytes.ok_or_else(|| {
                Error::InvalidArgument("newSize must accompany needResize".to_string())
            })?;
            self.expand_staged_device(
                &req.volume_id,
                &req.staging_target_path,
                &req.target_path,
                requested,
            )
            .await?;
        }
        Ok(())
    }

    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path must be provided".to_string()));
        }

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let mounter = Mounter::new(self.runner.clone());
        mounter.unmount_path(&req.target_path).await?;
        info!(volume_id = %req.volume_id, target_path = %req.target_path,
            "unpublish volume from the node is completed");
        Ok(())
    }

    async fn node_get_info(&self) -> Result<NodeGetInfoResponse> {
        let accessible_topology = node_topology(&self.inventory, &self.node_id).await?;
        Ok(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology,
        })
    }

    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.volume_path.is_empty() {
            return Err(Error::InvalidArgument("volume path must be provided".to_string()));
        }
        if tokio::fs::metadata(&req.volume_path).await.is_err() {
            return Err(Error::ResourceNotFound {
                kind: "path".to_string(),
                id: req.volume_path.clone(),
            });
        }

        let stdout = self
            .runner
            .run("stat", &["-f", "-c", "%S %b %f %a %c %d", &req.volume_path])
            .await?;
        let fields: Vec<i64> = stdout
            .split_whitespace()
            .map(|f| f.parse::<i64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| {
                Error::Internal(format!("failed to parse filesystem stats: {}", stdout.trim()))
            })?;
        let [block_size, blocks, blocks_free, blocks_available, inodes, inodes_free] =
            fields.as_slice()
        else {
            return Err(Error::Internal(format!(
                "unexpected filesystem stats shape: {}",
                stdout.trim()
            )));
        };

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    available: blocks_available * block_size,
                    total: blocks * block_size,
                    used: (blocks - blocks_free) * block_size,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    available: *inodes_free,
                    total: *inodes,
                    used: inodes - inodes_free,
                },
            ],
        })
    }

    async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.volume_path.is_empty() {
            return Err(Error::InvalidArgument("volume path must be provided".to_string()));
        }

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let requested = extract_storage(req.capacity_range)?;

        let mounter = Mounter::new(self.runner.clone());
        if mounter
            .mount_point_for_path(&req.volume_path)
            .await?
            .is_none()
        {
            warn!(volume_id = %req.volume_id, volume_path = %req.volume_path,
                "unable to fetch mount point, nothing to expand");
            return Ok(NodeExpandVolumeResponse { capacity_bytes: 0 });
        }

        let capacity_bytes = self
            .expand_staged_device(&req.volume_id, &req.volume_path, &req.volume_path, requested)
            .await?;
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    fn capabilities(&self) -> Vec<NodeCapability> {
        vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::GetVolumeStats,
            NodeCapability::ExpandVolume,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mount::tests::FakeRunner;
    use crate::node::tests::FakeInventory;
    use crate::util::params::{ATTACHMENT_TYPE, DEVICE_PATH, ISCSI_IP, ISCSI_IQN, ISCSI_PORT};
    use crate::util::{CommandOutput, LABEL_TOPOLOGY_ZONE};
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn node(runner: CommandRunnerRef) -> BlockVolumeNode {
        BlockVolumeNode::new(
            "worker-0".to_string(),
            FakeInventory::with_node(
                "worker-0",
                "ocid1.instance.oc1.iad.inst",
                (LABEL_TOPOLOGY_ZONE, "zkJl:US-ASHBURN-AD-1"),
            ),
            runner,
        )
    }

    fn iscsi_context() -> HashMap<String, String> {
        [
            (ATTACHMENT_TYPE, "iscsi"),
            (ISCSI_IQN, "iqn.2015-12.com.oracleiaas:472a"),
            (ISCSI_IP, "169.254.2.2"),
            (ISCSI_PORT, "3260"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn test_stage_requires_volume_id() {
        let node = node(FakeRunner::new());
        let err = node
            .node_stage_volume(NodeStageVolumeRequest::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_stage_requires_capability() {
        let node = node(FakeRunner::new());
        let err = node
            .node_stage_volume(NodeStageVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".into(),
                staging_target_path: "/mnt/stage".into(),
                publish_context: iscsi_context(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[test]
    fn test_stage_handler_iscsi_device_path() {
        let node = node(FakeRunner::new());
        let ctx = PublishContext::from_map(&iscsi_context()).unwrap();
        let (_, device_path) = node.stage_handler(&ctx).unwrap();
        assert_eq!(
            device_path,
            "/dev/disk/by-path/ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:472a-lun-1"
        );
    }

    #[test]
    fn test_stage_handler_paravirtualized_requires_device() {
        let node = node(FakeRunner::new());
        let mut context = HashMap::new();
        context.insert(ATTACHMENT_TYPE.to_string(), "paravirtualized".to_string());
        let ctx = PublishContext::from_map(&context).unwrap();
        assert_matches!(node.stage_handler(&ctx), Err(Error::InvalidArgument(_)));

        context.insert(DEVICE_PATH.to_string(), "/dev/oracleoci/oraclevdb".to_string());
        let ctx = PublishContext::from_map(&context).unwrap();
        let (_, device_path) = node.stage_handler(&ctx).unwrap();
        assert_eq!(device_path, "/dev/oracleoci/oraclevdb");
    }

    #[tokio::test]
    async fn test_stage_held_lock_aborts() {
        let node = node(FakeRunner::new());
        assert!(node.locks.try_acquire("ocid1.volume.oc1..v"));
        let err = node
            .node_stage_volume(NodeStageVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".into(),
                staging_target_path: "/mnt/stage".into(),
                publish_context: iscsi_context(),
                volume_capability: Some(crate::csi::VolumeCapability::mount(
                    crate::csi::AccessMode::SingleNodeWriter,
                )),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::OperationAlreadyExists(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_paravirtualized_formats_and_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("oraclevdb");
        std::fs::write(&device, b"").unwrap();
        let staging = dir.path().join("stage");

        let runner = FakeRunner::new();
        // blkid exit 2: no filesystem signature
        runner.respond(
            "blkid",
            CommandOutput {
                code: 2,
                ..Default::default()
            },
        );
        let node = node(runner.clone());

        let mut context = HashMap::new();
        context.insert(ATTACHMENT_TYPE.to_string(), "paravirtualized".to_string());
        context.insert(
            DEVICE_PATH.to_string(),
            device.to_string_lossy().into_owned(),
        );

        node.node_stage_volume(NodeStageVolumeRequest {
            volume_id: "ocid1.volume.oc1..v".into(),
            staging_target_path: staging.to_string_lossy().into_owned(),
            publish_context: context,
            volume_capability: Some(crate::csi::VolumeCapability::mount(
                crate::csi::AccessMode::SingleNodeWriter,
            )),
            ..Default::default()
        })
        .await
        .unwrap();

        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.starts_with("mkfs.ext4 -F")));
        assert!(calls.iter().any(|c| c.starts_with("mount -t ext4")));
        assert!(staging.is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_missing_device_deadline() {
        let runner = FakeRunner::new();
        let node = node(runner);
        let mut context = HashMap::new();
        context.insert(ATTACHMENT_TYPE.to_string(), "paravirtualized".to_string());
        context.insert(DEVICE_PATH.to_string(), "/dev/nonexistent-disk-path".to_string());

        let err = node
            .node_stage_volume(NodeStageVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".into(),
                staging_target_path: "/tmp/never-created-stage".into(),
                publish_context: context,
                volume_capability: Some(crate::csi::VolumeCapability::mount(
                    crate::csi::AccessMode::SingleNodeWriter,
                )),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::DeadlineExceeded(_));
    }

    #[test]
    fn test_device_path_and_kind_prefers_paravirtualized() {
        let paths = vec![
            "/dev/disk/by-path/ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:472a-lun-1"
                .to_string(),
            "/dev/disk/by-path/pci-0000:00:04.0-scsi-0:0:0:1".to_string(),
        ];
        let (kind, _) = device_path_and_kind(&paths).unwrap();
        assert_eq!(kind, DevicePathKind::Paravirtualized);
    }

    #[test]
    fn test_device_path_and_kind_multipath() {
        let paths = vec!["/dev/mapper/mpatha".to_string()];
        let (kind, path) = device_path_and_kind(&paths).unwrap();
        assert_eq!(kind, DevicePathKind::Multipath);
        assert_eq!(path, "/dev/mapper/mpatha");

        assert_matches!(
            device_path_and_kind(&["/dev/sda".to_string()]),
            Err(Error::Internal(_))
        );
    }

    #[tokio::test]
    async fn test_node_get_info() {
        let node = node(FakeRunner::new());
        let info = node.node_get_info().await.unwrap();
        assert_eq!(info.node_id, "worker-0");
        assert_eq!(info.max_volumes_per_node, MAX_VOLUMES_PER_NODE);
        assert_eq!(
            info.accessible_topology
                .get(LABEL_TOPOLOGY_ZONE)
                .map(String::as_str),
            Some("US-ASHBURN-AD-1")
        );
    }

    #[tokio::test]
    async fn test_volume_stats() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "stat -f",
            CommandOutput {
                code: 0,
                stdout: "4096 26214400 13107200 13000000 1638400 1600000\n".to_string(),
                stderr: String::new(),
            },
        );
        let node = node(runner);
        let stats = node
            .node_get_volume_stats(NodeGetVolumeStatsRequest {
                volume_id: "ocid1.volume.oc1..v".into(),
                volume_path: dir.path().to_string_lossy().into_owned(),
            })
            .await
            .unwrap();

        assert_eq!(stats.usage.len(), 2);
        assert_eq!(stats.usage[0].unit, UsageUnit::Bytes);
        assert_eq!(stats.usage[0].total, 26214400 * 4096);
        assert_eq!(stats.usage[0].used, (26214400 - 13107200) * 4096);
        assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);
        assert_eq!(stats.usage[1].used, 38400);
    }

    #[tokio::test]
    async fn test_volume_stats_missing_path() {
        let node = node(FakeRunner::new());
        let err = node
            .node_get_volume_stats(NodeGetVolumeStatsRequest {
                volume_id: "ocid1.volume.oc1..v".into(),
                volume_path: "/nonexistent/volume/path".into(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
    }

    #[test]
    fn test_capabilities() {
        let node = node(FakeRunner::new());
        let caps = node.capabilities();
        assert!(caps.contains(&NodeCapability::StageUnstageVolume));
        assert!(caps.contains(&NodeCapability::GetVolumeStats));
        assert!(caps.contains(&NodeCapability::ExpandVolume));
    }
}
