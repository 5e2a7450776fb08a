use parking_lot::RwLock;

use crate::common::Map;
use crate::common::error::CoreError;
use crate::common::resources::Resource;
use crate::messages::{NODE_PARTITION_ATTRIBUTE, NodeDescription};
use crate::{NodeId, PartitionName};

/// Per-node resource record. Detailed node bookkeeping is owned by the
/// partition; this only tracks identity, capacity and the allocated total.
#[derive(Debug)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub partition: PartitionName,
    pub total_resource: Resource,
    pub attributes: Map<String, String>,

    allocated: RwLock<Resource>,
}

impl NodeInfo {
    pub fn from_description(description: &NodeDescription) -> crate::Result<NodeInfo> {
        if description.node_id.is_empty() {
            return Err(CoreError::GenericError(
                "node description without a node id".to_string(),
            ));
        }
        let partition = description
            .attributes
            .get(NODE_PARTITION_ATTRIBUTE)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CoreError::GenericError(format!(
                    "node {} has no partition attribute",
                    description.node_id
                ))
            })?;
        Ok(NodeInfo {
            node_id: description.node_id.clone(),
            partition: partition.clone(),
            total_resource: description.schedulable_resource.clone(),
            attributes: description.attributes.clone(),
            allocated: RwLock::new(Resource::new()),
        })
    }

    pub fn allocated_resource(&self) -> Resource {
        self.allocated.read().clone()
    }

    /// Resource still available on this node.
    pub fn available_resource(&self) -> Resource {
        self.total_resource.clone() - &*self.allocated.read()
    }

    pub fn add_allocation(&self, resource: &Resource) {
        self.allocated.write().add(resource);
    }

    pub fn remove_allocation(&self, resource: &Resource) {
        let mut allocated = self.allocated.write();
        allocated.sub(resource);
        debug_assert!(!allocated.has_negative());
    }

    /// Whether `resource` still fits into the free capacity of this node.
    pub fn fits(&self, resource: &Resource) -> bool {
        !(self.available_resource() - resource).has_negative()
    }
}
