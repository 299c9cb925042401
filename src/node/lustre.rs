//! Lustre node agent
//!
//! Mounts Lustre filesystems addressed by NID-list handles. Staging can
//! bring up LNet on the VNICs inside the Lustre subnet first, and applies
//! client tunables after the mount. Unstaging falls back to a forced
//! unmount when LNet is already down, since a regular unmount would hang
//! waiting on the dead transport.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::csi::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodeService, NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};
use crate::disk::mount::Mounter;
use crate::error::{Error, Result};
use crate::k8s::NodeInventoryRef;
use crate::lnet::{validate_lustre_parameters, LnetService};
use crate::node::{node_topology, publish_bind_mount, unpublish_mount};
use crate::util::locks::VolumeLocks;
use crate::util::params::{LUSTRE_POST_MOUNT_PARAMETERS, LUSTRE_SUBNET_CIDR, SETUP_LNET};
use crate::util::{validate_lustre_volume_id, CommandRunnerRef};

const LUSTRE_FSTYPE: &str = "lustre";

pub struct LustreVolumeNode {
    node_id: String,
    /// Primary address of this node; default LNet subnet when none is given.
    node_ip: String,
    inventory: NodeInventoryRef,
    runner: CommandRunnerRef,
    lnet: LnetService,
    locks: VolumeLocks,
}

impl LustreVolumeNode {
    pub fn new(
        node_id: String,
        node_ip: String,
        inventory: NodeInventoryRef,
        runner: CommandRunnerRef,
    ) -> Self {
        LustreVolumeNode {
            node_id,
            node_ip,
            inventory,
            lnet: LnetService::new(runner.clone()),
            runner,
            locks: VolumeLocks::new(),
        }
    }

    fn validated_label(volume_id: &str) -> Result<String> {
        let (valid, lnet_label) = validate_lustre_volume_id(volume_id);
        if !valid {
            return Err(Error::InvalidVolumeHandle {
                handle: volume_id.to_string(),
                reason: "expected <ip>@<label>[:<ip>@<label>]:/<fsname>".to_string(),
            });
        }
        Ok(lnet_label)
    }
}

#[async_trait]
impl NodeService for LustreVolumeNode {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }
        let lnet_label = Self::validated_label(&req.volume_id)?;

        let fs_type = req
            .volume_capability
            .as_ref()
            .and_then(|c| c.fs_type())
            .unwrap_or(LUSTRE_FSTYPE);
        if fs_type != LUSTRE_FSTYPE {
            return Err(Error::InvalidArgument(format!(
                "fsType {} is not supported, only lustre is",
                fs_type
            )));
        }
        let options: Vec<String> = req
            .volume_capability
            .as_ref()
            .map(|c| c.mount_flags().to_vec())
            .unwrap_or_default();

        if req.volume_context.get(SETUP_LNET).map(String::as_str) == Some("true") {
            let default_cidr = format!("{}/32", self.node_ip);
            let subnet_cidr = req
                .volume_context
                .get(LUSTRE_SUBNET_CIDR)
                .map(String::as_str)
                .unwrap_or(&default_cidr);
            self.lnet.setup(subnet_cidr, &lnet_label).await?;
        }

        let post_mount_params = req
            .volume_context
            .get(LUSTRE_POST_MOUNT_PARAMETERS)
            .cloned()
            .unwrap_or_default();
        validate_lustre_parameters(&post_mount_params)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let mounter = Mounter::new(self.runner.clone());
        if tokio::fs::metadata(&req.staging_target_path).await.is_err() {
            tokio::fs::create_dir_all(&req.staging_target_path)
                .await
                .map_err(|err| {
                    Error::Internal(format!(
                        "failed to create staging target path directory: {}",
                        err
                    ))
                })?;
        } else if mounter.is_mount_point(&req.staging_target_path).await? {
            info!(volume_id = %req.volume_id, "volume is already mounted on the staging path");
            return Ok(());
        }

        mounter
            .mount(
                &req.volume_id,
                &req.staging_target_path,
                LUSTRE_FSTYPE,
                &options,
            )
            .await?;
        info!(volume_id = %req.volume_id, staging_path = %req.staging_target_path,
            "mounting the volume to the staging path is completed");

        self.lnet.apply_lustre_parameters(&post_mount_params).await?;
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
        let lnet_label = Self::validated_label(&req.volume_id)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        if tokio::fs::metadata(&req.staging_target_path).await.is_err() {
            warn!(staging_path = %req.staging_target_path, "mount point does not exist");
            return Ok(());
        }
        let mounter = Mounter::new(self.runner.clone());
        if !mounter.is_mount_point(&req.staging_target_path).await? {
            warn!(staging_path = %req.staging_target_path, "not a mount point, removing path");
            tokio::fs::remove_dir_all(&req.staging_target_path).await?;
            return Ok(());
        }

        if !self.lnet.is_active(&lnet_label).await {
            warn!(volume_id = %req.volume_id, label = %lnet_label,
                "lnet is down, force unmounting");
            mounter
                .unmount_with_force(&req.staging_target_path)
                .await?;
        } else {
            mounter.unmount(&req.staging_target_path).await?;
        }
        info!(volume_id = %req.volume_id, staging_path = %req.staging_target_path,
            "unmounting the volume from the staging path is completed");
        Ok(())
    }

    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path must be provided".to_string()));
        }
        Self::validated_label(&req.volume_id)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let options: Vec<String> = req
            .volume_capability
            .as_ref()
            .map(|c| c.mount_flags().to_vec())
            .unwrap_or_default();

        let mounter = Mounter::new(self.runner.clone());
        publish_bind_mount(
            &mounter,
            &req.staging_target_path,
            &req.target_path,
            LUSTRE_FSTYPE,
            req.readonly,
            &options,
        )
        .await?;
        info!(volume_id = %req.volume_id, target_path = %req.target_path,
            "publish volume to the node is completed");
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
        unpublish_mount(&mounter, &req.target_path).await?;
        info!(volume_id = %req.volume_id, target_path = %req.target_path,
            "unpublish volume from the node is completed");
        Ok(())
    }

    async fn node_get_info(&self) -> Result<NodeGetInfoResponse> {
        let accessible_topology = node_topology(&self.inventory, &self.node_id).await?;
        Ok(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology,
        })
    }

    async fn node_get_volume_stats(
        &self,
        _req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse> {
        Err(Error::Unimplemented(
            "volume stats are not supported for lustre volumes".to_string(),
        ))
    }

    async fn node_expand_volume(
        &self,
        _req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        Err(Error::Unimplemented(
            "node expansion is not supported for lustre volumes".to_string(),
        ))
    }

    fn capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::StageUnstageVolume]
    }
}
