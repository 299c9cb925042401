//! Node agents
//!
//! Per-flavor node services (block, shared filesystem, Lustre) plus the
//! pieces they share: zone topology lookup through the Kubernetes node
//! object and the bind-mount publish/unpublish flow.

pub mod block;
pub mod fss;
pub mod lustre;

pub use block::BlockVolumeNode;
pub use fss::FssVolumeNode;
pub use lustre::LustreVolumeNode;

use std::collections::HashMap;
use tracing::{info, warn};

use crate::csi::Topology;
use crate::disk::mount::Mounter;
use crate::error::{Error, Result};
use crate::k8s::NodeInventoryRef;
use crate::util::{
    availability_domain_from_node_label, LABEL_TOPOLOGY_ZONE, LABEL_ZONE_FAILURE_DOMAIN,
};

/// Per-node attachment ceiling advertised in NodeGetInfo.
pub const MAX_VOLUMES_PER_NODE: i64 = 32;

/// Zone segments for the node's availability domain, read from the node
/// labels. The driver is pinned to this AD only.
pub(crate) async fn node_topology(
    inventory: &NodeInventoryRef,
    node_id: &str,
) -> Result<Topology> {
    let node = inventory
        .get_node(node_id)
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "node".to_string(),
            id: node_id.to_string(),
        })?;

    let raw = node
        .labels
        .get(LABEL_TOPOLOGY_ZONE)
        .or_else(|| node.labels.get(LABEL_ZONE_FAILURE_DOMAIN))
        .cloned()
        .ok_or_else(|| {
            Error::Internal(format!("node {} carries no zone label", node_id))
        })?;
    let zone = availability_domain_from_node_label(&raw).unwrap_or(raw);
    info!(node_id, %zone, "availability domain of node identified");

    let mut segments = HashMap::new();
    segments.insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.clone());
    segments.insert(LABEL_ZONE_FAILURE_DOMAIN.to_string(), zone);
    Ok(segments)
}

/// Bind-mounts the staged volume at the target path. The orchestrator does
/// not pre-create the target directory, so an absent path is created here;
/// an existing mount point is success.
pub(crate) async fn publish_bind_mount(
    mounter: &Mounter,
    staging_target_path: &str,
    target_path: &str,
    fs_type: &str,
    readonly: bool,
    extra_options: &[String],
) -> Result<()> {
    if tokio::fs::metadata(target_path).await.is_err() {
        tokio::fs::create_dir_all(target_path).await.map_err(|err| {
            Error::Internal(format!("failed to create target path directory: {}", err))
        })?;
    } else if mounter.is_mount_point(target_path).await? {
        info!(target_path, "volume is already mounted to the target path");
        return Ok(());
    }

    let mut options: Vec<String> = extra_options.to_vec();
    options.push("bind".to_string());
    if readonly {
        options.push("ro".to_string());
    }
    mounter
        .mount(staging_target_path, target_path, fs_type, &options)
        .await?;
    info!(staging_target_path, target_path, "bind mounted the volume to the target path");
    Ok(())
}

/// Unmounts a publish target. A missing path is success; a path that is not
/// a mount point is removed.
pub(crate) async fn unpublish_mount(mounter: &Mounter, target_path: &str) -> Result<()> {
    if tokio::fs::metadata(target_path).await.is_err() {
        warn!(target_path, "mount point does not exist");
        return Ok(());
    }
    if !mounter.is_mount_point(target_path).await? {
        warn!(target_path, "not a mount point, removing path");
        tokio::fs::remove_dir_all(target_path).await?;
        return Ok(());
    }
    mounter.unmount(target_path).await?;
    info!(target_path, "unmounting volume completed");
    Ok(())
}
