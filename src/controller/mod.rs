//! Controller services
//!
//! Per-family controller services (block volumes, shared filesystems) plus
//! the capability validation and topology plumbing they share. Controllers
//! drive the cloud control plane through the capability ports and never
//! touch the host.

pub mod block;
pub mod fss;

pub use block::BlockVolumeController;
pub use fss::FssVolumeController;

use crate::cloud::IdentityRef;
use crate::csi::{AccessMode, TopologyRequirement, VolumeCapability};
use crate::error::{Error, Result};
use crate::util::{LABEL_TOPOLOGY_ZONE, LABEL_ZONE_FAILURE_DOMAIN};

/// Access modes the plugin serves.
const SUPPORTED_ACCESS_MODES: &[AccessMode] =
    &[AccessMode::SingleNodeWriter, AccessMode::MultiNodeMultiWriter];

/// Validates the requested capabilities. `allow_block` admits raw-block
/// access for the families that support it.
pub(crate) fn validate_capabilities(
    capabilities: &[VolumeCapability],
    allow_block: bool,
) -> Result<()> {
    if capabilities.is_empty() {
        return Err(Error::InvalidArgument(
            "volume capabilities must be provided".to_string(),
        ));
    }
    for capability in capabilities {
        if capability.is_block() && !allow_block {
            return Err(Error::UnsupportedCapability(
                "block access type is not supported for this volume family".to_string(),
            ));
        }
        if !SUPPORTED_ACCESS_MODES.contains(&capability.access_mode) {
            return Err(Error::UnsupportedCapability(format!(
                "access mode {:?} is not supported",
                capability.access_mode
            )));
        }
    }
    Ok(())
}

/// Zone named by the accessibility requirements, preferred entries first.
pub(crate) fn zone_from_topology(requirement: Option<&TopologyRequirement>) -> Option<String> {
    let requirement = requirement?;
    requirement
        .preferred
        .iter()
        .chain(requirement.requisite.iter())
        .find_map(|segments| {
            segments
                .get(LABEL_TOPOLOGY_ZONE)
                .or_else(|| segments.get(LABEL_ZONE_FAILURE_DOMAIN))
        })
        .cloned()
}

/// Resolves a zone (full or short AD name) to the full availability domain
/// name via the identity service.
pub(crate) async fn resolve_availability_domain(
    identity: &IdentityRef,
    compartment_id: &str,
    zone: &str,
) -> Result<String> {
    let ad = identity
        .get_availability_domain_by_name(compartment_id, zone)
        .await?;
    Ok(ad.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::{AccessType, Topology};
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn mount_cap(mode: AccessMode) -> VolumeCapability {
        VolumeCapability::mount(mode)
    }

    #[test]
    fn test_validate_capabilities() {
        assert_matches!(
            validate_capabilities(&[], false),
            Err(Error::InvalidArgument(_))
        );
        validate_capabilities(&[mount_cap(AccessMode::SingleNodeWriter)], false).unwrap();
        validate_capabilities(&[mount_cap(AccessMode::MultiNodeMultiWriter)], false).unwrap();
        assert_matches!(
            validate_capabilities(&[mount_cap(AccessMode::MultiNodeSingleWriter)], false),
            Err(Error::UnsupportedCapability(_))
        );

        let block = VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::SingleNodeWriter,
        };
        validate_capabilities(std::slice::from_ref(&block), true).unwrap();
        assert_matches!(
            validate_capabilities(std::slice::from_ref(&block), false),
            Err(Error::UnsupportedCapability(_))
        );
    }

    #[test]
    fn test_zone_from_topology_prefers_preferred() {
        let mut preferred: Topology = HashMap::new();
        preferred.insert(LABEL_TOPOLOGY_ZONE.to_string(), "US-ASHBURN-AD-1".to_string());
        let mut requisite: Topology = HashMap::new();
        requisite.insert(
            LABEL_ZONE_FAILURE_DOMAIN.to_string(),
            "US-ASHBURN-AD-2".to_string(),
        );
        let requirement = TopologyRequirement {
            requisite: vec![requisite],
            preferred: vec![preferred],
        };
        assert_eq!(
            zone_from_topology(Some(&requirement)).as_deref(),
            Some("US-ASHBURN-AD-1")
        );
    }

    #[test]
    fn test_zone_from_topology_falls_back_to_requisite() {
        let mut requisite: Topology = HashMap::new();
        requisite.insert(
            LABEL_ZONE_FAILURE_DOMAIN.to_string(),
            "US-ASHBURN-AD-2".to_string(),
        );
        let requirement = TopologyRequirement {
            requisite: vec![requisite],
            preferred: Vec::new(),
        };
        assert_eq!(
            zone_from_topology(Some(&requirement)).as_deref(),
            Some("US-ASHBURN-AD-2")
        );
        assert_eq!(zone_from_topology(None), None);
    }
}
