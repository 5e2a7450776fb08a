use std::sync::Arc;

use tokio::sync::oneshot;

use crate::cache::application::ApplicationInfo;
use crate::cache::partition::PartitionInfo;
use crate::common::eventqueue::QueueSender;
use crate::common::resources::Resource;
use crate::messages::{
    AcceptedApplication, AcceptedNode, Allocation, AllocationAsk, AllocationReleaseResponse,
    AllocationReleasesRequest, RegisterRmRequest, RejectedAllocationAsk, RejectedApplication,
    RejectedNode, ReleaseAllocation, RemoveApplicationRequest, UpdateRequest,
};
use crate::{AllocationKey, ApplicationId, NodeId, PartitionName, QueueName, RmId};

pub type AckResult = Result<(), String>;
pub type AckReceiver = oneshot::Receiver<AckResult>;

/// One-shot completion channel carried inside an event.
///
/// The receiver side experiences a synchronous call; the sender side lives in
/// an event-loop iteration. A dropped receiver is not an error.
#[derive(Debug)]
pub struct Ack(oneshot::Sender<AckResult>);

impl Ack {
    pub fn channel() -> (Ack, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        (Ack(tx), rx)
    }

    pub fn finish(self, result: AckResult) {
        if self.0.send(result).is_err() {
            log::debug!("Completion channel receiver is gone");
        }
    }

    pub fn succeed(self) {
        self.finish(Ok(()));
    }

    pub fn fail(self, reason: String) {
        self.finish(Err(reason));
    }
}

/// A scheduler decision awaiting commit by the cache.
#[derive(Debug, Clone)]
pub struct AllocationProposal {
    pub allocation_key: AllocationKey,
    pub application_id: ApplicationId,
    pub partition_name: PartitionName,
    pub queue_name: QueueName,
    pub node_id: NodeId,
    pub resource: Resource,
}

/// The current commit protocol accepts exactly one allocation proposal and no
/// release proposals per bundle; the cache treats anything else as fatal.
#[derive(Debug, Default)]
pub struct AllocationProposalBundle {
    pub allocation_proposals: Vec<AllocationProposal>,
    pub release_proposals: Vec<ReleaseAllocation>,
}

/// Events consumed by the cache's RM-event loop.
#[derive(Debug)]
pub enum RmEvent {
    Update(UpdateRequest),
    RegisterRm {
        request: RegisterRmRequest,
        result: Ack,
    },
    ConfigUpdate {
        rm_id: RmId,
        result: Ack,
    },
}

/// Events consumed by the cache's scheduler-event loop.
#[derive(Debug)]
pub enum CacheEvent {
    AllocationProposals(AllocationProposalBundle),
    RejectedNewApplication {
        application_id: ApplicationId,
        reason: String,
    },
    ReleaseAllocations(Vec<ReleaseAllocation>),
    RemovedApplication {
        application_id: ApplicationId,
        partition_name: PartitionName,
    },
    RemoveRmPartitions {
        rm_id: RmId,
        result: Ack,
    },
}

/// Events produced for the external scheduling decision-maker.
#[derive(Debug)]
pub enum SchedulerEvent {
    AllocationUpdates {
        new_asks: Vec<AllocationAsk>,
        to_releases: Option<AllocationReleasesRequest>,
        rejected_allocations: Vec<AllocationProposal>,
    },
    ApplicationsUpdate {
        added_applications: Vec<Arc<ApplicationInfo>>,
        removed_applications: Vec<RemoveApplicationRequest>,
    },
    UpdatePartitionsConfig {
        updated_partitions: Vec<Arc<PartitionInfo>>,
        result: Ack,
    },
    DeletePartitionsConfig {
        deleted_partitions: Vec<Arc<PartitionInfo>>,
        result: Ack,
    },
    /// The scheduler cleans up its own partition state, then forwards this
    /// into the cache's scheduler-event queue.
    RemoveRmPartitions {
        rm_id: RmId,
        result: Ack,
    },
}

/// Events consumed by the RM proxy's response loop.
#[derive(Debug)]
pub enum RmProxyEvent {
    NewAllocations {
        rm_id: RmId,
        allocations: Vec<Allocation>,
    },
    ApplicationUpdate {
        rm_id: RmId,
        accepted_applications: Vec<AcceptedApplication>,
        rejected_applications: Vec<RejectedApplication>,
    },
    NodeUpdate {
        rm_id: RmId,
        accepted_nodes: Vec<AcceptedNode>,
        rejected_nodes: Vec<RejectedNode>,
    },
    ReleasedAllocations {
        rm_id: RmId,
        released_allocations: Vec<AllocationReleaseResponse>,
    },
    RejectedAllocationAsks {
        rm_id: RmId,
        rejected_allocation_asks: Vec<RejectedAllocationAsk>,
    },
}

/// Senders towards every event consumer in the system.
#[derive(Clone)]
pub struct EventHandlers {
    /// Into the cache's RM-event loop.
    pub cache_rm: QueueSender<RmEvent>,
    /// Into the cache's scheduler-event loop.
    pub cache_scheduler: QueueSender<CacheEvent>,
    /// Towards the external scheduler.
    pub scheduler: QueueSender<SchedulerEvent>,
    /// Towards the RM proxy response loop.
    pub rm_proxy: QueueSender<RmProxyEvent>,
}
