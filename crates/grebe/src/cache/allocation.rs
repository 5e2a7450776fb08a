use crate::common::resources::Resource;
use crate::messages::Allocation;
use crate::{AllocationKey, AllocationUuid, ApplicationId, NodeId, PartitionName, QueueName};

/// One committed unit of resource, bound to exactly one application and one
/// node. Created when a proposal is committed, destroyed on release.
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    pub uuid: AllocationUuid,
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub queue_name: QueueName,
    pub node_id: NodeId,
    pub allocated_resource: Resource,
}

impl AllocationInfo {
    /// The wire-shaped record reported back to the owning RM.
    pub fn to_allocation(&self) -> Allocation {
        Allocation {
            uuid: self.uuid.clone(),
            allocation_key: self.allocation_key.clone(),
            application_id: self.application_id.clone(),
            partition_name: self.partition_name.clone(),
            queue_name: self.queue_name.clone(),
            node_id: self.node_id.clone(),
            resource: self.allocated_resource.clone(),
        }
    }
}
