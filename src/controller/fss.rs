//! Shared filesystem controller
//!
//! Provisions the file system / mount target / export triplet, idempotently
//! by display name, and records the relationships as freeform tags on the
//! file system so deletion can unwind exactly what provisioning created.
//! There is no controller publish for this family; the node mounts straight
//! from the volume handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cloud::poll::{
    await_export_active, await_file_system_active, await_mount_target_active,
};
use crate::cloud::{
    CreateExportDetails, CreateFileSystemDetails, CreateMountTargetDetails, FileStorageRef,
    IdentityRef, MountTarget, VirtualNetworkRef,
};
use crate::config::Config;
use crate::controller::{resolve_availability_domain, validate_capabilities};
use crate::csi::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, ControllerService, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, CreatedVolume,
    DeleteSnapshotRequest, DeleteVolumeRequest, Topology, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::util::locks::VolumeLocks;
use crate::util::params::{extract_fss_parameters, FssParameters, ENCRYPT_IN_TRANSIT};
use crate::util::{
    availability_domain_from_node_label, FssVolumeHandle, LABEL_TOPOLOGY_ZONE,
    LABEL_ZONE_FAILURE_DOMAIN,
};

// Reverse-index freeform tags stamped on the file system at create time.
const TAG_MOUNT_TARGET_OCID: &str = "mountTargetOCID";
const TAG_EXPORT_SET_ID: &str = "exportSetId";
const TAG_IS_DELETE_MOUNT_TARGET: &str = "isDeleteMountTarget";

pub struct FssVolumeController {
    file_storage: FileStorageRef,
    identity: IdentityRef,
    virtual_network: VirtualNetworkRef,
    config: Arc<Config>,
    locks: VolumeLocks,
}

impl FssVolumeController {
    pub fn new(
        file_storage: FileStorageRef,
        identity: IdentityRef,
        virtual_network: VirtualNetworkRef,
        config: Arc<Config>,
    ) -> Self {
        FssVolumeController {
            file_storage,
            identity,
            virtual_network,
            config,
            locks: VolumeLocks::new(),
        }
    }

    /// Resolves or creates the mount target. The second value is true when
    /// this call created it, which marks it for deletion with the volume.
    async fn resolve_mount_target(
        &self,
        name: &str,
        compartment_id: &str,
        availability_domain: &str,
        params: &FssParameters,
    ) -> Result<(MountTarget, bool)> {
        if let Some(id) = &params.mount_target_ocid {
            let mount_target = self.file_storage.get_mount_target(id).await?;
            return Ok((mount_target, false));
        }

        let existing = self
            .file_storage
            .get_mount_targets_by_name(name, compartment_id, availability_domain)
            .await?;
        match existing.as_slice() {
            [] => {
                let subnet_id = params.mount_target_subnet_ocid.clone().ok_or_else(|| {
                    Error::InvalidArgument(
                        "mountTargetSubnetOcid is required to create a mount target".to_string(),
                    )
                })?;
                let initial = self.config.tags.clone().unwrap_or_default();
                let result = self
                    .file_storage
                    .create_mount_target(CreateMountTargetDetails {
                        compartment_id: compartment_id.to_string(),
                        availability_domain: availability_domain.to_string(),
                        display_name: name.to_string(),
                        subnet_id,
                        freeform_tags: initial.freeform,
                        defined_tags: initial.defined,
                    })
                    .await;
                metrics::record_request("create", "mount_target", &result);
                Ok((result?, true))
            }
            [mount_target] => {
                info!(mount_target_id = %mount_target.id, name, "reusing existing mount target");
                Ok((mount_target.clone(), false))
            }
            _ => Err(Error::DuplicateDisplayName {
                kind: "mount target".to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn topology_for(&self, availability_domain: &str) -> Vec<Topology> {
        let zone = availability_domain_from_node_label(availability_domain)
            .unwrap_or_else(|| availability_domain.to_string());
        let mut segments = HashMap::new();
        segments.insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.clone());
        segments.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), zone);
        vec![segments]
    }

    /// IP address of the mount target's first private IP.
    async fn mount_target_ip(&self, mount_target: &MountTarget) -> Result<String> {
        let ip_id = mount_target.private_ip_ids.first().ok_or_else(|| {
            Error::Internal(format!(
                "mount target {} has no private ip",
                mount_target.id
            ))
        })?;
        Ok(self.virtual_network.get_private_ip(ip_id).await?.ip_address)
    }
}

#[async_trait]
impl ControllerService for FssVolumeController {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name must be provided".to_string()));
        }
        validate_capabilities(&req.volume_capabilities, false)?;
        let params = extract_fss_parameters(&req.parameters)?;

        let compartment_id = params
            .compartment_ocid
            .clone()
            .unwrap_or_else(|| self.config.compartment.clone());
        let availability_domain = resolve_availability_domain(
            &self.identity,
            &compartment_id,
            &params.availability_domain,
        )
        .await?;
        let export_path = params
            .export_path
            .clone()
            .unwrap_or_else(|| format!("/{}", req.name));

        let _guard = self
            .locks
            .guard(&req.name)
            .ok_or_else(|| Error::OperationAlreadyExists(req.name.clone()))?;

        let (mount_target, created_mount_target) = self
            .resolve_mount_target(&req.name, &compartment_id, &availability_domain, &params)
            .await?;
        let mount_target =
            await_mount_target_active(self.file_storage.as_ref(), &mount_target.id).await?;
        let mount_target_ip = self.mount_target_ip(&mount_target).await?;
        let export_set_id = mount_target.export_set_id.clone().ok_or_else(|| {
            Error::Internal(format!(
                "mount target {} has no export set",
                mount_target.id
            ))
        })?;

        let existing = self
            .file_storage
            .get_file_systems_by_name(&req.name, &compartment_id, &availability_domain)
            .await?;
        let file_system = match existing.as_slice() {
            [] => {
                let initial = self.config.tags.clone().unwrap_or_default();
                let mut freeform_tags = params
                    .freeform_tags
                    .clone()
                    .unwrap_or(initial.freeform);
                freeform_tags.insert(TAG_MOUNT_TARGET_OCID.to_string(), mount_target.id.clone());
                freeform_tags.insert(TAG_EXPORT_SET_ID.to_string(), export_set_id.clone());
                freeform_tags.insert(
                    TAG_IS_DELETE_MOUNT_TARGET.to_string(),
                    created_mount_target.to_string(),
                );
                let result = self
                    .file_storage
                    .create_file_system(CreateFileSystemDetails {
                        compartment_id: compartment_id.clone(),
                        availability_domain: availability_domain.clone(),
                        display_name: req.name.clone(),
                        kms_key_id: params.kms_key_ocid.clone(),
                        freeform_tags,
                        defined_tags: params.defined_tags.clone().unwrap_or(initial.defined),
                    })
                    .await;
                metrics::record_request("create", "file_system", &result);
                result?
            }
            [file_system] => {
                info!(file_system_id = %file_system.id, name = %req.name,
                    "reusing existing file system");
                file_system.clone()
            }
            _ => {
                return Err(Error::DuplicateDisplayName {
                    kind: "file system".to_string(),
                    name: req.name.clone(),
                })
            }
        };
        let file_system =
            await_file_system_active(self.file_storage.as_ref(), &file_system.id).await?;

        let export = match self
            .file_storage
            .find_export(&file_system.id, &export_path, &export_set_id)
            .await?
        {
            Some(export) => export,
            None => {
                let result = self
                    .file_storage
                    .create_export(CreateExportDetails {
                        export_set_id: export_set_id.clone(),
                        file_system_id: file_system.id.clone(),
                        path: export_path.clone(),
                        export_options: params.export_options.clone(),
                    })
                    .await;
                metrics::record_request("create", "export", &result);
                result?
            }
        };
        await_export_active(self.file_storage.as_ref(), &export.id).await?;

        let handle = FssVolumeHandle {
            filesystem_ocid: file_system.id.clone(),
            mount_target_ip,
            export_path,
        };
        let mut volume_context = HashMap::new();
        volume_context.insert(
            ENCRYPT_IN_TRANSIT.to_string(),
            params.encrypt_in_transit.to_string(),
        );
        info!(volume_id = %handle.to_volume_id(), "file storage volume provisioned");
        Ok(CreateVolumeResponse {
            volume: CreatedVolume {
                volume_id: handle.to_volume_id(),
                // Shared filesystems grow elastically; no fixed capacity.
                capacity_bytes: 0,
                accessible_topology: self.topology_for(&file_system.availability_domain),
                volume_context,
                content_source: None,
            },
        })
    }

    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        let handle = FssVolumeHandle::parse(&req.volume_id)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let file_system = match self
            .file_storage
            .get_file_system(&handle.filesystem_ocid)
            .await
        {
            Ok(file_system) => file_system,
            Err(Error::Cloud(service_err)) if service_err.is_not_found() => {
                info!(volume_id = %req.volume_id, "file system already deleted");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let tags = &file_system.freeform_tags;
        if tags.get(TAG_IS_DELETE_MOUNT_TARGET).map(String::as_str) == Some("true") {
            if let Some(mount_target_id) = tags.get(TAG_MOUNT_TARGET_OCID) {
                let result = self.file_storage.delete_mount_target(mount_target_id).await;
                metrics::record_request("delete", "mount_target", &result);
                tolerate_not_found(result)?;
            }
        }

        if let Some(export_set_id) = tags.get(TAG_EXPORT_SET_ID) {
            if let Some(export) = self
                .file_storage
                .find_export(&file_system.id, &handle.export_path, export_set_id)
                .await?
            {
                let result = self.file_storage.delete_export(&export.id).await;
                metrics::record_request("delete", "export", &result);
                tolerate_not_found(result)?;
            }
        }

        let result = self.file_storage.delete_file_system(&file_system.id).await;
        metrics::record_request("delete", "file_system", &result);
        tolerate_not_found(result)?;
        info!(volume_id = %req.volume_id, "file storage volume deleted");
        Ok(())
    }

    async fn controller_publish_volume(
        &self,
        _req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        Err(Error::Unimplemented(
            "controller publish is not supported for shared filesystems".to_string(),
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _req: ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented(
            "controller unpublish is not supported for shared filesystems".to_string(),
        ))
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        let handle = FssVolumeHandle::parse(&req.volume_id)?;
        let file_system = self
            .file_storage
            .get_file_system(&handle.filesystem_ocid)
            .await?;

        // The handle pins the mount target address; a stale handle whose
        // mount target moved is reported as gone.
        if let Some(mount_target_id) = file_system.freeform_tags.get(TAG_MOUNT_TARGET_OCID) {
            let mount_target = self.file_storage.get_mount_target(mount_target_id).await?;
            let current_ip = self.mount_target_ip(&mount_target).await?;
            if current_ip != handle.mount_target_ip {
                warn!(volume_id = %req.volume_id, %current_ip,
                    "mount target ip does not match the volume handle");
                return Err(Error::ResourceNotFound {
                    kind: "mount target address".to_string(),
                    id: handle.mount_target_ip.clone(),
                });
            }
        }

        match validate_capabilities(&req.volume_capabilities, false) {
            Ok(()) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(req.volume_capabilities),
                message: String::new(),
            }),
            Err(err) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: err.to_string(),
            }),
        }
    }

    async fn controller_expand_volume(
        &self,
        _req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        Err(Error::Unimplemented(
            "expansion is not supported for shared filesystems".to_string(),
        ))
    }

    async fn create_snapshot(
        &self,
        _req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        Err(Error::Unimplemented(
            "snapshots are not supported for shared filesystems".to_string(),
        ))
    }

    async fn delete_snapshot(&self, _req: DeleteSnapshotRequest) -> Result<()> {
        Err(Error::Unimplemented(
            "snapshots are not supported for shared filesystems".to_string(),
        ))
    }

    fn capabilities(&self) -> Vec<ControllerCapability> {
        vec![ControllerCapability::CreateDeleteVolume]
    }
}

fn tolerate_not_found(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::Cloud(service_err)) if service_err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}
