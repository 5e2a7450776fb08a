use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::common::resources::Resource;
use crate::{AllocationKey, AllocationUuid, ApplicationId, NodeId, PartitionName, QueueName, RmId};

/// Node attribute carrying the (per-RM) partition the node belongs to.
pub const NODE_PARTITION_ATTRIBUTE: &str = "si/node-partition";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRmRequest {
    pub rm_id: RmId,
    pub policy_group: String,
}

/// One batched update from a resource manager.
///
/// Partition names are RM-local when the request enters the proxy and
/// normalized to cluster-global names before the cache sees the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub rm_id: RmId,
    pub new_applications: Vec<NewApplication>,
    pub remove_applications: Vec<RemoveApplicationRequest>,
    pub asks: Vec<AllocationAsk>,
    pub releases: Option<AllocationReleasesRequest>,
    pub new_schedulable_nodes: Vec<NodeDescription>,
    pub updated_nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub queue_name: QueueName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveApplicationRequest {
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationAsk {
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub queue_name: QueueName,
    pub resource_per_ask: Resource,
    pub pending_ask_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationReleasesRequest {
    pub allocations_to_release: Vec<ReleaseAllocation>,
    pub asks_to_release: Vec<ReleaseAllocationAsk>,
}

/// Request to release allocations of one application.
///
/// Without a uuid every allocation of the application is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAllocation {
    pub uuid: Option<AllocationUuid>,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub message: String,
    pub termination_type: TerminationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAllocationAsk {
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub node_id: NodeId,
    pub attributes: Map<String, String>,
    pub schedulable_resource: Resource,
    pub existing_allocations: Vec<Allocation>,
}

/// A committed allocation as reported back to the owning RM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub uuid: AllocationUuid,
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub queue_name: QueueName,
    pub node_id: NodeId,
    pub resource: Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    StoppedByRm,
    TimedOut,
    PreemptedByScheduler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReleaseResponse {
    pub uuid: AllocationUuid,
    pub termination_type: TerminationType,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedApplication {
    pub application_id: ApplicationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedApplication {
    pub application_id: ApplicationId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedNode {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedNode {
    pub node_id: NodeId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedAllocationAsk {
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub reason: String,
}

/// One delivery to an RM callback; only non-empty sections are filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub new_allocations: Vec<Allocation>,
    pub accepted_applications: Vec<AcceptedApplication>,
    pub rejected_applications: Vec<RejectedApplication>,
    pub accepted_nodes: Vec<AcceptedNode>,
    pub rejected_nodes: Vec<RejectedNode>,
    pub released_allocations: Vec<AllocationReleaseResponse>,
    pub rejected_allocation_asks: Vec<RejectedAllocationAsk>,
}
