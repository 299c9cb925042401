//! Block volume controller
//!
//! Provisions block volumes in the configured compartment, idempotently by
//! display name, attaches them to instances for publish, and drives
//! expansion and backups. All mutations are awaited to a stable lifecycle
//! state before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cloud::poll::{
    await_attachment_state, await_backup_available, await_clone_available,
    await_volume_available, BACKUP_AVAILABLE_TIMEOUT,
};
use crate::cloud::{
    AttachVolumeDetails, AttachmentKind, AttachmentLifecycle, BlockStorageRef, ComputeRef,
    CreateBackupDetails, CreateVolumeDetails, DefinedTags, FreeformTags, IdentityRef,
    VolumeAttachment, VolumeSource, RESOURCE_TRACKING_TAG_NAMESPACE,
};
use crate::config::{resource_attribution_enabled, Config};
use crate::csi::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, ControllerService, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, CreatedVolume,
    DeleteSnapshotRequest, DeleteVolumeRequest, Snapshot, Topology,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, VolumeContentSource,
};
use crate::controller::{resolve_availability_domain, validate_capabilities, zone_from_topology};
use crate::error::{Error, Result};
use crate::k8s::NodeInventoryRef;
use crate::metrics;
use crate::util::locks::VolumeLocks;
use crate::util::params::{
    extract_snapshot_parameters, extract_volume_parameters, PublishContext, VolumeParameters,
    ATTACHMENT_TYPE, NEED_RESIZE, NEW_SIZE, VPUS_PER_GB,
};
use crate::util::{
    availability_domain_from_node_label, round_up_size, GIB, LABEL_TOPOLOGY_ZONE,
    LABEL_ZONE_FAILURE_DOMAIN, MAX_DEFINED_TAGS_PER_VOLUME,
};

/// Provider-id prefix the orchestrator prepends to instance OCIDs.
const PROVIDER_ID_PREFIX: &str = "oci://";

/// Grace period after a multipath detach; the host agent needs it to tear
/// the paths down before the volume can be attached elsewhere.
const MULTIPATH_DETACH_SETTLE: Duration = Duration::from_secs(90);

pub struct BlockVolumeController {
    block_storage: BlockStorageRef,
    compute: ComputeRef,
    identity: IdentityRef,
    inventory: NodeInventoryRef,
    config: Arc<Config>,
    locks: VolumeLocks,
}

impl BlockVolumeController {
    pub fn new(
        block_storage: BlockStorageRef,
        compute: ComputeRef,
        identity: IdentityRef,
        inventory: NodeInventoryRef,
        config: Arc<Config>,
    ) -> Self {
        BlockVolumeController {
            block_storage,
            compute,
            identity,
            inventory,
            config,
            locks: VolumeLocks::new(),
        }
    }

    /// Tags for a new volume: storage-class overrides win over the
    /// configured initial tags. The reserved attribution namespace is kept
    /// only when attribution is enabled.
    fn assemble_tags(&self, params: &VolumeParameters) -> Result<(FreeformTags, DefinedTags)> {
        let initial = self.config.tags.clone().unwrap_or_default();
        let freeform = params
            .freeform_tags
            .clone()
            .unwrap_or(initial.freeform);
        let mut defined = params.defined_tags.clone().unwrap_or(initial.defined);
        if !resource_attribution_enabled() {
            defined.remove(RESOURCE_TRACKING_TAG_NAMESPACE);
        }

        let defined_count: usize = defined.values().map(|keys| keys.len()).sum();
        if defined_count > MAX_DEFINED_TAGS_PER_VOLUME {
            return Err(Error::InvalidArgument(format!(
                "the number of defined tags {} exceeds the limit of {}",
                defined_count, MAX_DEFINED_TAGS_PER_VOLUME
            )));
        }
        Ok((freeform, defined))
    }

    /// Creates the volume. When the control plane rejects the reserved
    /// attribution tag namespace, retries once without it.
    async fn provision(&self, mut details: CreateVolumeDetails) -> Result<crate::cloud::Volume> {
        let result = self.block_storage.create_volume(details.clone()).await;
        metrics::record_request("create", "volume", &result);
        match result {
            Ok(volume) => Ok(volume),
            Err(Error::Cloud(service_err))
                if service_err.is_system_tag_not_found_or_not_authorised()
                    && details
                        .defined_tags
                        .contains_key(RESOURCE_TRACKING_TAG_NAMESPACE) =>
            {
                warn!(
                    display_name = %details.display_name,
                    "attribution tag namespace rejected, retrying without it"
                );
                details.defined_tags.remove(RESOURCE_TRACKING_TAG_NAMESPACE);
                let retry = self.block_storage.create_volume(details).await;
                metrics::record_request("create", "volume", &retry);
                retry
            }
            Err(err) => Err(err),
        }
    }

    async fn attach(&self, details: AttachVolumeDetails) -> Result<VolumeAttachment> {
        let attachment = self.compute.attach_volume(details).await?;
        await_attachment_state(
            self.compute.as_ref(),
            &attachment.id,
            AttachmentLifecycle::Attached,
        )
        .await
    }

    fn topology_for(&self, availability_domain: &str) -> Vec<Topology> {
        let zone = availability_domain_from_node_label(availability_domain)
            .unwrap_or_else(|| availability_domain.to_string());
        let mut segments = HashMap::new();
        segments.insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.clone());
        segments.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), zone);
        vec![segments]
    }
}

#[async_trait]
impl ControllerService for BlockVolumeController {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name must be provided".to_string()));
        }
        validate_capabilities(&req.volume_capabilities, true)?;
        let params = extract_volume_parameters(&req.parameters)?;
        let size_bytes = crate::util::extract_storage(req.capacity_range)?;
        let size_gib = round_up_size(size_bytes, GIB);

        let _guard = self
            .locks
            .guard(&req.name)
            .ok_or_else(|| Error::OperationAlreadyExists(req.name.clone()))?;

        // Content source, if any, fixes the placement and the minimum size.
        let mut source = None;
        let mut source_availability_domain = None;
        let mut source_size_gib = None;
        match &req.volume_content_source {
            Some(VolumeContentSource::Snapshot { snapshot_id }) => {
                let backup = self.block_storage.get_volume_backup(snapshot_id).await?;
                source_size_gib = Some(backup.size_in_gbs);
                source = Some(VolumeSource::Backup {
                    id: backup.id.clone(),
                });
            }
            Some(VolumeContentSource::Volume { volume_id }) => {
                let src = self.block_storage.get_volume(volume_id).await?;
                source_availability_domain = Some(src.availability_domain.clone());
                source_size_gib = Some(src.size_in_gbs);
                source = Some(VolumeSource::Volume { id: src.id.clone() });
            }
            None => {}
        }

        let availability_domain = match source_availability_domain {
            Some(ad) => ad,
            None => {
                let zone = zone_from_topology(req.accessibility_requirements.as_ref())
                    .ok_or_else(|| {
                        Error::InvalidArgument(
                            "no availability domain in the accessibility requirements".to_string(),
                        )
                    })?;
                resolve_availability_domain(&self.identity, &self.config.compartment, &zone)
                    .await?
            }
        };

        let mut volume_context = HashMap::new();
        volume_context.insert(ATTACHMENT_TYPE.to_string(), params.attachment_kind.to_string());
        volume_context.insert(VPUS_PER_GB.to_string(), params.vpus_per_gb.to_string());
        // A restore into a bigger volume needs a filesystem grow on first
        // publish.
        if matches!(source_size_gib, Some(src) if size_gib > src) {
            volume_context.insert(NEED_RESIZE.to_string(), "true".to_string());
            volume_context.insert(NEW_SIZE.to_string(), size_bytes.to_string());
        }

        let existing = self
            .block_storage
            .get_volumes_by_name(&req.name, &self.config.compartment)
            .await?;
        let volume = match existing.as_slice() {
            [] => {
                let (freeform_tags, defined_tags) = self.assemble_tags(&params)?;
                self.provision(CreateVolumeDetails {
                    compartment_id: self.config.compartment.clone(),
                    availability_domain: availability_domain.clone(),
                    display_name: req.name.clone(),
                    size_in_gbs: size_gib,
                    vpus_per_gb: params.vpus_per_gb,
                    kms_key_id: params.kms_key_id.clone(),
                    source: source.clone(),
                    freeform_tags,
                    defined_tags,
                })
                .await?
            }
            [volume] => {
                info!(volume_id = %volume.id, name = %req.name, "reusing existing volume");
                volume.clone()
            }
            _ => {
                return Err(Error::DuplicateDisplayName {
                    kind: "volume".to_string(),
                    name: req.name.clone(),
                })
            }
        };

        let volume = if matches!(source, Some(VolumeSource::Volume { .. })) {
            await_clone_available(self.block_storage.as_ref(), &volume.id).await?
        } else {
            await_volume_available(self.block_storage.as_ref(), &volume.id).await?
        };

        Ok(CreateVolumeResponse {
            volume: CreatedVolume {
                volume_id: volume.id.clone(),
                capacity_bytes: volume.size_in_gbs * GIB,
                accessible_topology: self.topology_for(&volume.availability_domain),
                volume_context,
                content_source: req.volume_content_source.clone(),
            },
        })
    }

    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let result = self.block_storage.delete_volume(&req.volume_id).await;
        metrics::record_request("delete", "volume", &result);
        match result {
            Ok(()) => Ok(()),
            Err(Error::Cloud(service_err)) if service_err.is_not_found() => {
                info!(volume_id = %req.volume_id, "volume already deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        if req.node_id.is_empty() {
            return Err(Error::InvalidArgument("node id must be provided".to_string()));
        }
        let capability = req.volume_capability.as_ref().ok_or_else(|| {
            Error::InvalidArgument("volume capability must be provided".to_string())
        })?;
        let params = extract_volume_parameters(&req.volume_context)?;

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let node = self
            .inventory
            .get_node(&req.node_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "node".to_string(),
                id: req.node_id.clone(),
            })?;
        let instance_id = node
            .instance_id
            .trim_start_matches(PROVIDER_ID_PREFIX)
            .to_string();
        let instance = self.compute.get_instance(&instance_id).await?;
        let volume = self.block_storage.get_volume(&req.volume_id).await?;

        let in_transit = instance.is_pv_encryption_in_transit_enabled;
        if in_transit && params.attachment_kind != AttachmentKind::Paravirtualized {
            return Err(Error::InvalidArgument(
                "in-transit encryption requires the paravirtualized attachment type".to_string(),
            ));
        }
        let sharable = capability.access_mode.is_multi_node();

        let compartment_id = node
            .compartment_id
            .clone()
            .unwrap_or_else(|| volume.compartment_id.clone());
        let details = AttachVolumeDetails {
            instance_id: instance_id.clone(),
            volume_id: req.volume_id.clone(),
            kind: params.attachment_kind,
            is_shareable: sharable,
            is_read_only: req.readonly,
            is_pv_encryption_in_transit_enabled: in_transit,
        };

        let existing = self
            .compute
            .find_volume_attachment(&compartment_id, &req.volume_id)
            .await?;
        let attachment = match existing {
            Some(att) if att.lifecycle_state == AttachmentLifecycle::Detaching => {
                info!(attachment_id = %att.id, "attachment is detaching, waiting before re-attach");
                await_attachment_state(
                    self.compute.as_ref(),
                    &att.id,
                    AttachmentLifecycle::Detached,
                )
                .await?;
                self.attach(details).await?
            }
            Some(att) if att.instance_id == instance_id => match att.lifecycle_state {
                AttachmentLifecycle::Attached => att,
                AttachmentLifecycle::Attaching => {
                    await_attachment_state(
                        self.compute.as_ref(),
                        &att.id,
                        AttachmentLifecycle::Attached,
                    )
                    .await?
                }
                _ => self.attach(details).await?,
            },
            Some(att) if !sharable => {
                warn!(volume_id = %req.volume_id, attached_to = %att.instance_id,
                    "volume is attached to another node");
                return Err(Error::AttachedToAnotherNode {
                    volume_id: req.volume_id.clone(),
                });
            }
            _ => self.attach(details).await?,
        };

        let ctx = PublishContext {
            attachment_kind: Some(attachment.kind),
            device: attachment.device.clone(),
            iscsi_iqn: attachment.iscsi_iqn.clone(),
            iscsi_ip: attachment.iscsi_ip.clone(),
            iscsi_port: attachment.iscsi_port,
            vpus_per_gb: Some(volume.vpus_per_gb),
            need_resize: req.volume_context.get(NEED_RESIZE).map(String::as_str) == Some("true"),
            new_size_bytes: match req.volume_context.get(NEW_SIZE) {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    Error::InvalidArgument(format!("failed to parse newSize {}", raw))
                })?),
                None => None,
            },
            multipath_enabled: attachment.is_multipath,
            multipath_devices: attachment.multipath_devices.clone(),
        };
        info!(volume_id = %req.volume_id, instance_id = %instance_id,
            attachment_id = %attachment.id, "volume published to node");
        Ok(ControllerPublishVolumeResponse {
            publish_context: ctx.to_map()?,
        })
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        // The node object disappears when the node is deleted; nothing left
        // to detach from.
        let Some(node) = self.inventory.get_node(&req.node_id).await? else {
            warn!(node_id = %req.node_id, "node not found, treating unpublish as complete");
            return Ok(());
        };
        let compartment_id = match node.compartment_id.clone() {
            Some(id) => id,
            None => self.config.compartment.clone(),
        };

        let Some(attachment) = self
            .compute
            .find_volume_attachment(&compartment_id, &req.volume_id)
            .await?
        else {
            info!(volume_id = %req.volume_id, "no attachment found, unpublish is complete");
            return Ok(());
        };

        if attachment.lifecycle_state != AttachmentLifecycle::Detaching {
            let result = self.compute.detach_volume(&attachment.id).await;
            metrics::record_request("detach", "volume", &result);
            result?;
        }
        await_attachment_state(
            self.compute.as_ref(),
            &attachment.id,
            AttachmentLifecycle::Detached,
        )
        .await?;

        if attachment.is_multipath {
            info!(volume_id = %req.volume_id, "waiting for multipath teardown to settle");
            tokio::time::sleep(MULTIPATH_DETACH_SETTLE).await;
        }
        info!(volume_id = %req.volume_id, node_id = %req.node_id, "volume unpublished from node");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        self.block_storage.get_volume(&req.volume_id).await?;

        match validate_capabilities(&req.volume_capabilities, true) {
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
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id must be provided".to_string()));
        }
        let requested_bytes = crate::util::extract_storage(req.capacity_range)?;
        let requested_gib = round_up_size(requested_bytes, GIB);

        let _guard = self
            .locks
            .guard(&req.volume_id)
            .ok_or_else(|| Error::OperationAlreadyExists(req.volume_id.clone()))?;

        let volume = self.block_storage.get_volume(&req.volume_id).await?;
        if requested_gib <= volume.size_in_gbs {
            info!(volume_id = %req.volume_id, current_gib = volume.size_in_gbs, requested_gib,
                "volume is already at or above the requested size");
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: volume.size_in_gbs * GIB,
                node_expansion_required: true,
            });
        }

        let result = self
            .block_storage
            .update_volume_size(&req.volume_id, requested_gib)
            .await;
        metrics::record_request("update", "volume", &result);
        result?;
        let volume = await_volume_available(self.block_storage.as_ref(), &req.volume_id).await?;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: volume.size_in_gbs * GIB,
            node_expansion_required: true,
        })
    }

    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<CreateSnapshotResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name must be provided".to_string()));
        }
        if req.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "source volume id must be provided".to_string(),
            ));
        }
        let params = extract_snapshot_parameters(&req.parameters)?;

        let _guard = self
            .locks
            .guard(&req.name)
            .ok_or_else(|| Error::OperationAlreadyExists(req.name.clone()))?;

        let existing = self
            .block_storage
            .get_volume_backups_by_name(&req.name, &self.config.compartment)
            .await?;
        let backup = match existing.as_slice() {
            [] => {
                let initial = self.config.tags.clone().unwrap_or_default();
                self.block_storage
                    .create_volume_backup(CreateBackupDetails {
                        volume_id: req.source_volume_id.clone(),
                        compartment_id: self.config.compartment.clone(),
                        display_name: req.name.clone(),
                        backup_type: params.backup_type,
                        freeform_tags: params.freeform_tags.unwrap_or(initial.freeform),
                        defined_tags: params.defined_tags.unwrap_or(initial.defined),
                    })
                    .await?
            }
            [backup] => {
                if backup.volume_id != req.source_volume_id {
                    return Err(Error::SnapshotSourceMismatch {
                        name: req.name.clone(),
                    });
                }
                info!(backup_id = %backup.id, name = %req.name, "reusing existing backup");
                backup.clone()
            }
            _ => {
                return Err(Error::DuplicateDisplayName {
                    kind: "volume backup".to_string(),
                    name: req.name.clone(),
                })
            }
        };

        // A backup that misses the short availability window is returned
        // not-ready; the orchestrator re-polls through CreateSnapshot.
        let (backup, ready_to_use) = match await_backup_available(
            self.block_storage.as_ref(),
            &backup.id,
            BACKUP_AVAILABLE_TIMEOUT,
        )
        .await
        {
            Ok(available) => (available, true),
            Err(Error::DeadlineExceeded(_)) => {
                warn!(backup_id = %backup.id, "backup not yet available, reporting not ready");
                (backup, false)
            }
            Err(err) => return Err(err),
        };

        Ok(CreateSnapshotResponse {
            snapshot: Snapshot {
                snapshot_id: backup.id.clone(),
                source_volume_id: backup.volume_id.clone(),
                size_bytes: backup.size_in_gbs * GIB,
                creation_time: backup.time_created,
                ready_to_use,
            },
        })
    }

    async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<()> {
        if req.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument("snapshot id must be provided".to_string()));
        }
        let result = self
            .block_storage
            .delete_volume_backup(&req.snapshot_id)
            .await;
        metrics::record_request("delete", "volume_backup", &result);
        match result {
            Ok(()) => Ok(()),
            Err(Error::Cloud(service_err)) if service_err.is_not_found() => {
                info!(snapshot_id = %req.snapshot_id, "backup already deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn capabilities(&self) -> Vec<ControllerCapability> {
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ExpandVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::CloneVolume,
        ]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cloud::{
        AvailabilityDomain, BlockStorage, Compute, Identity, Instance, ServiceError, Volume,
        VolumeBackup, VolumeLifecycle,
    };
    use crate::csi::{AccessMode, CapacityRange, TopologyRequirement, VolumeCapability};
    use crate::node::tests::FakeInventory;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    // =========================================================================
    // Fakes
    // =========================================================================

    #[derive(Default)]
    pub(crate) struct FakeBlockStorage {
        pub volumes: Mutex<Vec<Volume>>,
        pub backups: Mutex<Vec<VolumeBackup>>,
        pub create_errors: Mutex<Vec<ServiceError>>,
        pub create_calls: Mutex<Vec<CreateVolumeDetails>>,
        pub resize_calls: Mutex<Vec<(String, i64)>>,
    }

    impl FakeBlockStorage {
        pub fn with_volume(volume: Volume) -> Arc<Self> {
            let fake = FakeBlockStorage::default();
            fake.volumes.lock().push(volume);
            Arc::new(fake)
        }
    }

    fn not_found() -> Error {
        Error::Cloud(ServiceError::http(404, "NotAuthorizedOrNotFound", "absent"))
    }

    #[async_trait]
    impl BlockStorage for FakeBlockStorage {
        async fn get_volume(&self, id: &str) -> Result<Volume> {
            self.volumes
                .lock()
                .iter()
                .find(|v| v.id == id)
                .cloned()
                .ok_or_else(not_found)
        }

        async fn get_volumes_by_name(
            &self,
            name: &str,
            compartment_id: &str,
        ) -> Result<Vec<Volume>> {
            Ok(self
                .volumes
                .lock()
                .iter()
                .filter(|v| v.display_name == name && v.compartment_id == compartment_id)
                .cloned()
                .collect())
        }

        async fn create_volume(&self, details: CreateVolumeDetails) -> Result<Volume> {
            self.create_calls.lock().push(details.clone());
            if let Some(err) = self.create_errors.lock().pop() {
                return Err(Error::Cloud(err));
            }
            let volume = Volume {
                id: format!("ocid1.volume.oc1..{}", self.volumes.lock().len()),
                display_name: details.display_name,
                compartment_id: details.compartment_id,
                availability_domain: details.availability_domain,
                size_in_gbs: details.size_in_gbs,
                vpus_per_gb: details.vpus_per_gb,
                lifecycle_state: VolumeLifecycle::Available,
                is_hydrated: true,
                source: details.source,
                freeform_tags: details.freeform_tags,
                defined_tags: details.defined_tags,
            };
            self.volumes.lock().push(volume.clone());
            Ok(volume)
        }

        async fn delete_volume(&self, id: &str) -> Result<()> {
            let mut volumes = self.volumes.lock();
            let before = volumes.len();
            volumes.retain(|v| v.id != id);
            if volumes.len() == before {
                return Err(not_found());
            }
            Ok(())
        }

        async fn update_volume_size(&self, id: &str, size_in_gbs: i64) -> Result<Volume> {
            self.resize_calls.lock().push((id.to_string(), size_in_gbs));
            let mut volumes = self.volumes.lock();
            let volume = volumes
                .iter_mut()
                .find(|v| v.id == id)
                .ok_or_else(not_found)?;
            volume.size_in_gbs = size_in_gbs;
            Ok(volume.clone())
        }

        async fn get_volume_backup(&self, id: &str) -> Result<VolumeBackup> {
            self.backups
                .lock()
                .iter()
                .find(|b| b.id == id)
                .cloned()
                .ok_or_else(not_found)
        }

        async fn get_volume_backups_by_name(
            &self,
            name: &str,
            compartment_id: &str,
        ) -> Result<Vec<VolumeBackup>> {
            Ok(self
                .backups
                .lock()
                .iter()
                .filter(|b| b.display_name == name && b.compartment_id == compartment_id)
                .cloned()
                .collect())
        }

        async fn create_volume_backup(
            &self,
            details: CreateBackupDetails,
        ) -> Result<VolumeBackup> {
            let backup = VolumeBackup {
                id: format!("ocid1.volumebackup.oc1..{}", self.backups.lock().len()),
                display_name: details.display_name,
                compartment_id: details.compartment_id,
                volume_id: details.volume_id,
                size_in_gbs: 50,
                lifecycle_state: crate::cloud::BackupLifecycle::Available,
                time_created: chrono::Utc::now(),
            };
            self.backups.lock().push(backup.clone());
            Ok(backup)
        }

        async fn delete_volume_backup(&self, id: &str) -> Result<()> {
            let mut backups = self.backups.lock();
            let before = backups.len();
            backups.retain(|b| b.id != id);
            if backups.len() == before {
                return Err(not_found());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeCompute {
        pub instances: Mutex<Vec<Instance>>,
        pub attachments: Mutex<Vec<VolumeAttachment>>,
        pub detach_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Compute for FakeCompute {
        async fn get_instance(&self, id: &str) -> Result<Instance> {
            self.instances
                .lock()
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(not_found)
        }

        async fn get_volume_attachment(&self, id: &str) -> Result<VolumeAttachment> {
            self.attachments
                .lock()
                .iter()
                .find(|a| a.id == id)
                .cloned()
                .ok_or_else(not_found)
        }

        async fn find_volume_attachment(
            &self,
            _compartment_id: &str,
            volume_id: &str,
        ) -> Result<Option<VolumeAttachment>> {
            Ok(self
                .attachments
                .lock()
                .iter()
                .find(|a| {
                    a.volume_id == volume_id
                        && a.lifecycle_state != AttachmentLifecycle::Detached
                })
                .cloned())
        }

        async fn attach_volume(&self, details: AttachVolumeDetails) -> Result<VolumeAttachment> {
            let attachment = VolumeAttachment {
                id: format!("ocid1.volumeattachment.oc1..{}", self.attachments.lock().len()),
                volume_id: details.volume_id,
                instance_id: details.instance_id,
                compartment_id: "ocid1.compartment.oc1..c".to_string(),
                lifecycle_state: AttachmentLifecycle::Attached,
                kind: details.kind,
                device: match details.kind {
                    AttachmentKind::Paravirtualized => {
                        Some("/dev/oracleoci/oraclevdb".to_string())
                    }
                    AttachmentKind::Iscsi => None,
                },
                iscsi_iqn: Some("iqn.2015-12.com.oracleiaas:472a".to_string()),
                iscsi_ip: Some("169.254.2.2".to_string()),
                iscsi_port: Some(3260),
                is_multipath: false,
                multipath_devices: Vec::new(),
                is_shareable: details.is_shareable,
                is_pv_encryption_in_transit_enabled: details
                    .is_pv_encryption_in_transit_enabled,
            };
            self.attachments.lock().push(attachment.clone());
            Ok(attachment)
        }

        async fn detach_volume(&self, attachment_id: &str) -> Result<()> {
            self.detach_calls.lock().push(attachment_id.to_string());
            let mut attachments = self.attachments.lock();
            let attachment = attachments
                .iter_mut()
                .find(|a| a.id == attachment_id)
                .ok_or_else(not_found)?;
            attachment.lifecycle_state = AttachmentLifecycle::Detached;
            Ok(())
        }
    }

    pub(crate) struct FakeIdentity;

    #[async_trait]
    impl Identity for FakeIdentity {
        async fn get_availability_domain_by_name(
            &self,
            _compartment_id: &str,
            name: &str,
        ) -> Result<AvailabilityDomain> {
            let name = if name.contains(':') {
                name.to_string()
            } else {
                format!("zkJl:{}", name)
            };
            Ok(AvailabilityDomain { name })
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn config() -> Arc<Config> {
        Arc::new(Config {
            compartment: "ocid1.compartment.oc1..c".to_string(),
            ..Default::default()
        })
    }

    fn controller(
        block_storage: Arc<FakeBlockStorage>,
        compute: Arc<FakeCompute>,
    ) -> BlockVolumeController {
        BlockVolumeController::new(
            block_storage,
            compute,
            Arc::new(FakeIdentity),
            FakeInventory::with_node(
                "worker-0",
                "oci://ocid1.instance.oc1.iad.inst",
                (LABEL_TOPOLOGY_ZONE, "zkJl:US-ASHBURN-AD-1"),
            ),
            config(),
        )
    }

    fn available_volume(id: &str, name: &str, size_gib: i64) -> Volume {
        Volume {
            id: id.to_string(),
            display_name: name.to_string(),
            compartment_id: "ocid1.compartment.oc1..c".to_string(),
            availability_domain: "zkJl:US-ASHBURN-AD-1".to_string(),
            size_in_gbs: size_gib,
            vpus_per_gb: 10,
            lifecycle_state: VolumeLifecycle::Available,
            is_hydrated: true,
            source: None,
            freeform_tags: HashMap::new(),
            defined_tags: HashMap::new(),
        }
    }

    fn create_request(name: &str, required_bytes: i64) -> CreateVolumeRequest {
        let mut preferred = HashMap::new();
        preferred.insert(
            LABEL_TOPOLOGY_ZONE.to_string(),
            "US-ASHBURN-AD-1".to_string(),
        );
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
            accessibility_requirements: Some(TopologyRequirement {
                requisite: Vec::new(),
                preferred: vec![preferred],
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[tokio::test]
    async fn test_create_volume_is_idempotent() {
        let storage = Arc::new(FakeBlockStorage::default());
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        let first = controller
            .create_volume(create_request("pvc-1", 100 * GIB))
            .await
            .unwrap();
        let second = controller
            .create_volume(create_request("pvc-1", 100 * GIB))
            .await
            .unwrap();

        assert_eq!(first.volume.volume_id, second.volume.volume_id);
        assert_eq!(second.volume.capacity_bytes, 107374182400);
        assert_eq!(storage.create_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_create_volume_duplicate_names_rejected() {
        let storage = Arc::new(FakeBlockStorage::default());
        storage
            .volumes
            .lock()
            .push(available_volume("ocid1.volume.oc1..a", "pvc-1", 50));
        storage
            .volumes
            .lock()
            .push(available_volume("ocid1.volume.oc1..b", "pvc-1", 50));
        let controller = controller(storage, Arc::new(FakeCompute::default()));

        let err = controller
            .create_volume(create_request("pvc-1", 100 * GIB))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DuplicateDisplayName { .. });
    }

    #[tokio::test]
    async fn test_create_clone_larger_than_source_flags_resize() {
        let storage = Arc::new(FakeBlockStorage::default());
        storage
            .volumes
            .lock()
            .push(available_volume("ocid1.volume.oc1..src", "source", 50));
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        let mut req = create_request("pvc-clone", 100 * GIB);
        req.volume_content_source = Some(VolumeContentSource::Volume {
            volume_id: "ocid1.volume.oc1..src".to_string(),
        });
        let resp = controller.create_volume(req).await.unwrap();

        assert_eq!(
            resp.volume.volume_context.get(NEED_RESIZE).map(String::as_str),
            Some("true")
        );
        assert_eq!(
            resp.volume.volume_context.get(NEW_SIZE).map(String::as_str),
            Some("107374182400")
        );
        // Placement follows the source, not the topology requirement.
        let created = &storage.create_calls.lock()[0];
        assert_eq!(created.availability_domain, "zkJl:US-ASHBURN-AD-1");
        assert_matches!(created.source, Some(VolumeSource::Volume { .. }));
    }

    #[tokio::test]
    async fn test_create_volume_attribution_tag_stripped_on_rejection() {
        let storage = Arc::new(FakeBlockStorage::default());
        storage.create_errors.lock().push(ServiceError::http(
            400,
            "RelatedResourceNotAuthorizedOrNotFound",
            "tag namespace 'orcl-containerengine' not authorized or not found",
        ));
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        std::env::set_var(crate::config::RESOURCE_ATTRIBUTION_ENV, "true");
        let mut req = create_request("pvc-tagged", 100 * GIB);
        req.parameters.insert(
            crate::util::params::INITIAL_DEFINED_TAGS_OVERRIDE.to_string(),
            format!(
                r#"{{"{}": {{"Cluster": "c1"}}}}"#,
                RESOURCE_TRACKING_TAG_NAMESPACE
            ),
        );
        let resp = controller.create_volume(req).await.unwrap();
        std::env::remove_var(crate::config::RESOURCE_ATTRIBUTION_ENV);

        assert!(!resp.volume.volume_id.is_empty());
        let calls = storage.create_calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[0]
            .defined_tags
            .contains_key(RESOURCE_TRACKING_TAG_NAMESPACE));
        assert!(!calls[1]
            .defined_tags
            .contains_key(RESOURCE_TRACKING_TAG_NAMESPACE));
    }

    #[tokio::test]
    async fn test_publish_attaches_and_builds_context() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let compute = Arc::new(FakeCompute::default());
        compute.instances.lock().push(Instance {
            id: "ocid1.instance.oc1.iad.inst".to_string(),
            compartment_id: "ocid1.compartment.oc1..c".to_string(),
            availability_domain: "zkJl:US-ASHBURN-AD-1".to_string(),
            is_pv_encryption_in_transit_enabled: false,
        });
        let controller = controller(storage, compute.clone());

        let resp = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                node_id: "worker-0".to_string(),
                volume_capability: Some(VolumeCapability::mount(AccessMode::SingleNodeWriter)),
                readonly: false,
                volume_context: HashMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(
            resp.publish_context.get(ATTACHMENT_TYPE).map(String::as_str),
            Some("iscsi")
        );
        assert_eq!(
            resp.publish_context
                .get(crate::util::params::ISCSI_IP)
                .map(String::as_str),
            Some("169.254.2.2")
        );
        assert_eq!(compute.attachments.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_attached_elsewhere() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let compute = Arc::new(FakeCompute::default());
        compute.instances.lock().push(Instance {
            id: "ocid1.instance.oc1.iad.inst".to_string(),
            compartment_id: "ocid1.compartment.oc1..c".to_string(),
            availability_domain: "zkJl:US-ASHBURN-AD-1".to_string(),
            is_pv_encryption_in_transit_enabled: false,
        });
        compute
            .attach_volume(AttachVolumeDetails {
                instance_id: "ocid1.instance.oc1.iad.other".to_string(),
                volume_id: "ocid1.volume.oc1..v".to_string(),
                kind: AttachmentKind::Iscsi,
                is_shareable: false,
                is_read_only: false,
                is_pv_encryption_in_transit_enabled: false,
            })
            .await
            .unwrap();
        let controller = controller(storage, compute);

        let err = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                node_id: "worker-0".to_string(),
                volume_capability: Some(VolumeCapability::mount(AccessMode::SingleNodeWriter)),
                readonly: false,
                volume_context: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::AttachedToAnotherNode { .. });
    }

    #[tokio::test]
    async fn test_publish_in_transit_requires_paravirtualized() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let compute = Arc::new(FakeCompute::default());
        compute.instances.lock().push(Instance {
            id: "ocid1.instance.oc1.iad.inst".to_string(),
            compartment_id: "ocid1.compartment.oc1..c".to_string(),
            availability_domain: "zkJl:US-ASHBURN-AD-1".to_string(),
            is_pv_encryption_in_transit_enabled: true,
        });
        let controller = controller(storage, compute);

        let err = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                node_id: "worker-0".to_string(),
                volume_capability: Some(VolumeCapability::mount(AccessMode::SingleNodeWriter)),
                readonly: false,
                volume_context: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_unpublish_missing_node_is_success() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let compute = Arc::new(FakeCompute::default());
        let controller = BlockVolumeController::new(
            storage,
            compute,
            Arc::new(FakeIdentity),
            FakeInventory::empty(),
            config(),
        );
        controller
            .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                node_id: "gone".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unpublish_detaches() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let compute = Arc::new(FakeCompute::default());
        compute
            .attach_volume(AttachVolumeDetails {
                instance_id: "ocid1.instance.oc1.iad.inst".to_string(),
                volume_id: "ocid1.volume.oc1..v".to_string(),
                kind: AttachmentKind::Iscsi,
                is_shareable: false,
                is_read_only: false,
                is_pv_encryption_in_transit_enabled: false,
            })
            .await
            .unwrap();
        let controller = controller(storage, compute.clone());

        controller
            .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                node_id: "worker-0".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(compute.detach_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_expand_below_current_returns_current() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 100));
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        let resp = controller
            .controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 60 * GIB,
                    limit_bytes: 0,
                }),
                volume_capability: None,
            })
            .await
            .unwrap();

        assert_eq!(resp.capacity_bytes, 100 * GIB);
        assert!(resp.node_expansion_required);
        assert!(storage.resize_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expand_grows_volume() {
        let storage =
            FakeBlockStorage::with_volume(available_volume("ocid1.volume.oc1..v", "pvc-1", 50));
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        let resp = controller
            .controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: "ocid1.volume.oc1..v".to_string(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 200 * GIB,
                    limit_bytes: 0,
                }),
                volume_capability: None,
            })
            .await
            .unwrap();

        assert_eq!(resp.capacity_bytes, 200 * GIB);
        assert_eq!(storage.resize_calls.lock().as_slice(), &[(
            "ocid1.volume.oc1..v".to_string(),
            200
        )]);
    }

    #[tokio::test]
    async fn test_create_snapshot_source_mismatch() {
        let storage = Arc::new(FakeBlockStorage::default());
        storage
            .create_volume_backup(CreateBackupDetails {
                volume_id: "ocid1.volume.oc1..other".to_string(),
                compartment_id: "ocid1.compartment.oc1..c".to_string(),
                display_name: "snap-1".to_string(),
                backup_type: crate::cloud::BackupType::Incremental,
                freeform_tags: HashMap::new(),
                defined_tags: HashMap::new(),
            })
            .await
            .unwrap();
        let controller = controller(storage, Arc::new(FakeCompute::default()));

        let err = controller
            .create_snapshot(CreateSnapshotRequest {
                source_volume_id: "ocid1.volume.oc1..v".to_string(),
                name: "snap-1".to_string(),
                parameters: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::SnapshotSourceMismatch { .. });
    }

    #[tokio::test]
    async fn test_create_and_delete_snapshot() {
        let storage = Arc::new(FakeBlockStorage::default());
        let controller = controller(storage.clone(), Arc::new(FakeCompute::default()));

        let resp = controller
            .create_snapshot(CreateSnapshotRequest {
                source_volume_id: "ocid1.volume.oc1..v".to_string(),
                name: "snap-1".to_string(),
                parameters: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(resp.snapshot.ready_to_use);
        assert_eq!(resp.snapshot.source_volume_id, "ocid1.volume.oc1..v");

        controller
            .delete_snapshot(DeleteSnapshotRequest {
                snapshot_id: resp.snapshot.snapshot_id.clone(),
            })
            .await
            .unwrap();
        // Idempotent second delete.
        controller
            .delete_snapshot(DeleteSnapshotRequest {
                snapshot_id: resp.snapshot.snapshot_id,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_volume_tolerates_absent() {
        let storage = Arc::new(FakeBlockStorage::default());
        let controller = controller(storage, Arc::new(FakeCompute::default()));
        controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "ocid1.volume.oc1..gone".to_string(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_capabilities() {
        let controller = controller(
            Arc::new(FakeBlockStorage::default()),
            Arc::new(FakeCompute::default()),
        );
        let caps = controller.capabilities();
        assert!(caps.contains(&ControllerCapability::CreateDeleteVolume));
        assert!(caps.contains(&ControllerCapability::CloneVolume));
        assert!(caps.contains(&ControllerCapability::CreateDeleteSnapshot));
    }
}
