//! Shared filesystem node agent
//!
//! Stages NFS exports from a mount target onto the node, optionally through
//! the in-transit encryption helper, and bind-publishes them to workloads.
//! The volume handle carries everything needed to mount; no publish context
//! is involved.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::csi::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodeService, NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};
use crate::disk::mount::{Mounter, OCI_FSS_FSTYPE};
use crate::error::{Error, Result};
use crate::k8s::NodeInventoryRef;
use crate::node::{node_topology, publish_bind_mount, unpublish_mount};
use crate::util::locks::VolumeLocks;
use crate::util::params::ENCRYPT_IN_TRANSIT;
use crate::util::{
    is_fips_enabled, is_in_transit_encryption_package_installed, CommandRunnerRef,
    FssVolumeHandle, FIPS_ENABLED_PATH, IN_TRANSIT_ENCRYPTION_PACKAGE,
};

pub struct FssVolumeNode {
    node_id: String,
    inventory: NodeInventoryRef,
    runner: CommandRunnerRef,
    locks: VolumeLocks,
    fips_path: PathBuf,
}

impl FssVolumeNode {
    pub fn new(node_id: String, inventory: NodeInventoryRef, runner: CommandRunnerRef) -> Self {
        FssVolumeNode {
            node_id,
            inventory,
            runner,
            locks: VolumeLocks::new(),
            fips_path: PathBuf::from(FIPS_ENABLED_PATH),
        }
    }

    #[cfg(test)]
    fn with_fips_path(mut self, path: PathBuf) -> Self {
        self.fips_path = path;
        self
    }
}

fn parse_encrypt_in_transit(volume_context: &std::collections::HashMap<String, String>) -> Result<bool> {
    match volume_context.get(ENCRYPT_IN_TRANSIT) {
        None => Ok(false),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            Error::InvalidArgument(format!(
                "invalid value {} provided for {}",
                raw, ENCRYPT_IN_TRANSIT
            ))
        }),
    }
}

#[async_trait]
impl NodeService for FssVolumeNode {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.staging_target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "staging target path must be provided".to_string(),
            ));
        }
        let handle = FssVolumeHandle::parse(&req.volume_id)?;

        let mut fs_type = req
            .volume_capability
            .as_ref()
            .and_then(|c| c.fs_type())
            .unwrap_or("")
            .to_string();
        let mut options: Vec<String> = req
            .volume_capability
            .as_ref()
            .map(|c| c.mount_flags().to_vec())
            .unwrap_or_default();

        if parse_encrypt_in_transit(&req.volume_context)? {
            if !is_in_transit_encryption_package_installed(self.runner.as_ref()).await? {
                return Err(Error::FailedPrecondition(format!(
                    "package {} not installed for in-transit encryption",
                    IN_TRANSIT_ENCRYPTION_PACKAGE
                )));
            }
            fs_type = OCI_FSS_FSTYPE.to_string();
            if is_fips_enabled(&self.fips_path) {
                options.push("fips".to_string());
            }
        }

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

        let source = format!("{}:{}", handle.mount_target_ip, handle.export_path);
        mounter
            .mount(&source, &req.staging_target_path, &fs_type, &options)
            .await?;
        info!(volume_id = %req.volume_id, %source, staging_path = %req.staging_target_path,
            "mounting the volume to the staging path is completed");
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
        let handle = FssVolumeHandle::parse(&req.volume_id)?;

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

        // An in-transit encrypted mount shows a loopback source whose address
        // differs from the mount target; it needs the helper's unmounter.
        let sources = mounter
            .find_mount_sources(&req.staging_target_path)
            .await?;
        let in_transit = sources.iter().any(|source| {
            match source.split_once(':') {
                Some((ip, path)) => path == handle.export_path && ip != handle.mount_target_ip,
                None => false,
            }
        });

        if in_transit {
            mounter
                .unmount_with_encrypt(&req.staging_target_path)
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
        FssVolumeHandle::parse(&req.volume_id)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let fs_type = req
            .volume_capability
            .as_ref()
            .and_then(|c| c.fs_type())
            .unwrap_or("");
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
            fs_type,
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
            // Network attachments carry no per-node ceiling.
            max_volumes_per_node: 0,
            accessible_topology,
        })
    }

    async fn node_get_volume_stats(
        &self,
        _req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse> {
        Err(Error::Unimplemented(
            "volume stats are not supported for shared filesystems".to_string(),
        ))
    }

    async fn node_expand_volume(
        &self,
        _req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        Err(Error::Unimplemented(
            "node expansion is not supported for shared filesystems".to_string(),
        ))
    }

    fn capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::StageUnstageVolume]
    }
}
