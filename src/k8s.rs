//! Orchestrator node lookup
//!
//! The controller resolves a CSI node id to a compute instance through the
//! orchestrator's node object: the provider id carries the instance OCID
//! and an annotation carries the compartment. Behind a port so tests run
//! against fakes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Annotation holding the node's compartment OCID.
pub const COMPARTMENT_ID_ANNOTATION: &str = "oci.oraclecloud.com/compartment-id";

/// Provider-id scheme prefix on OCI nodes.
const PROVIDER_ID_PREFIX: &str = "oci://";

/// The slice of a node object the plugin consumes.
#[derive(Debug, Clone, Default)]
pub struct NodeSummary {
    pub name: String,
    /// Instance OCID from the provider id, scheme prefix stripped.
    pub instance_id: String,
    /// Compartment OCID from the node annotation, when present.
    pub compartment_id: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Port for node-object lookups.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Fetches a node by name; None when the node is gone from the
    /// orchestrator's inventory.
    async fn get_node(&self, name: &str) -> Result<Option<NodeSummary>>;
}

pub type NodeInventoryRef = Arc<dyn NodeInventory>;

/// Node inventory backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeInventory {
    nodes: Api<Node>,
}

impl KubeNodeInventory {
    pub fn new(client: Client) -> Self {
        KubeNodeInventory {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeInventory for KubeNodeInventory {
    async fn get_node(&self, name: &str) -> Result<Option<NodeSummary>> {
        let node = match self.nodes.get_opt(name).await? {
            Some(node) => node,
            None => return Ok(None),
        };

        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.clone())
            .unwrap_or_default();
        let instance_id = provider_id
            .strip_prefix(PROVIDER_ID_PREFIX)
            .unwrap_or(&provider_id)
            .to_string();

        let metadata = &node.metadata;
        let compartment_id = metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(COMPARTMENT_ID_ANNOTATION))
            .cloned();
        let labels = metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        Ok(Some(NodeSummary {
            name: name.to_string(),
            instance_id,
            compartment_id,
            labels,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_prefix_strip() {
        let with_prefix = "oci://ocid1.instance.oc1.iad.abcd";
        assert_eq!(
            with_prefix.strip_prefix(PROVIDER_ID_PREFIX).unwrap(),
            "ocid1.instance.oc1.iad.abcd"
        );
        let without = "ocid1.instance.oc1.iad.abcd";
        assert_eq!(without.strip_prefix(PROVIDER_ID_PREFIX), None);
    }
}
