use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cache::allocation::AllocationInfo;
use crate::cache::application::ApplicationInfo;
use crate::cache::node::NodeInfo;
use crate::cache::queue::QueueInfo;
use crate::common::Map;
use crate::common::error::CoreError;
use crate::common::resources::Resource;
use crate::config::PartitionConfig;
use crate::events::AllocationProposal;
use crate::messages::{Allocation, ReleaseAllocation};
use crate::{ApplicationId, NodeId, PartitionName, QueueName, RmId};

/// How a duplicate application id is treated during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    FailIfExists,
    /// A pre-existing application is a silent success; nothing is changed.
    AllowExisting,
}

/// One named slice of the cluster: its applications, nodes and configured
/// queue tree. Owned by exactly one RM.
///
/// Capacity-changing operations take the inner writer lock for their whole
/// fit-check-and-commit sequence, so node restores on the RM loop and
/// proposal commits on the scheduler loop cannot interleave on the same
/// free capacity.
#[derive(Debug)]
pub struct PartitionInfo {
    pub name: PartitionName,
    pub rm_id: RmId,

    root_queue: Arc<QueueInfo>,
    /// Flat index of the queue tree, keyed by full path.
    queues: Map<QueueName, Arc<QueueInfo>>,

    state: RwLock<PartitionState>,
}

#[derive(Debug, Default)]
struct PartitionState {
    applications: Map<ApplicationId, Arc<ApplicationInfo>>,
    nodes: Map<NodeId, Arc<NodeInfo>>,
    total_resource: Resource,
}

impl PartitionInfo {
    /// Build a partition from its configuration; `name` is the cluster-global
    /// (RM-qualified) partition name.
    pub fn from_config(config: &PartitionConfig, name: &str, rm_id: &str) -> Arc<PartitionInfo> {
        let root_queue = QueueInfo::from_config(&config.queues);
        let mut queues = Map::default();
        root_queue.collect_into(&mut queues);
        Arc::new(PartitionInfo {
            name: name.to_string(),
            rm_id: rm_id.to_string(),
            root_queue,
            queues,
            state: RwLock::new(PartitionState::default()),
        })
    }

    pub fn root_queue(&self) -> &Arc<QueueInfo> {
        &self.root_queue
    }

    pub fn get_queue(&self, full_path: &str) -> Option<Arc<QueueInfo>> {
        self.queues.get(full_path).cloned()
    }

    pub fn get_application(&self, application_id: &str) -> Option<Arc<ApplicationInfo>> {
        self.state.read().applications.get(application_id).cloned()
    }

    pub fn get_applications(&self) -> Vec<Arc<ApplicationInfo>> {
        self.state.read().applications.values().cloned().collect()
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<NodeInfo>> {
        self.state.read().nodes.get(node_id).cloned()
    }

    pub fn total_resource(&self) -> Resource {
        self.state.read().total_resource.clone()
    }

    /// Admit an application: the id must be new (unless `AllowExisting`) and
    /// the target queue must exist and be a leaf. Returns whether the
    /// application was actually added.
    pub fn add_application(
        &self,
        app: Arc<ApplicationInfo>,
        mode: AdmissionMode,
    ) -> crate::Result<bool> {
        let mut state = self.state.write();
        if state.applications.contains_key(&app.application_id) {
            return match mode {
                AdmissionMode::FailIfExists => Err(CoreError::GenericError(format!(
                    "application {} already exists in partition {}",
                    app.application_id, self.name
                ))),
                AdmissionMode::AllowExisting => Ok(false),
            };
        }
        let queue = self.queues.get(&app.queue_name).ok_or_else(|| {
            CoreError::GenericError(format!(
                "cannot submit application {} to partition {}: queue {} does not exist",
                app.application_id, self.name, app.queue_name
            ))
        })?;
        if !queue.is_leaf {
            return Err(CoreError::GenericError(format!(
                "cannot submit application {} to partition {}: queue {} is not a leaf queue",
                app.application_id, self.name, app.queue_name
            )));
        }
        app.set_leaf_queue(Some(queue.clone()));
        state.applications.insert(app.application_id.clone(), app);
        Ok(true)
    }

    /// Remove an application, extracting all of its allocations and releasing
    /// them from node bookkeeping. Returns the application and the released
    /// allocations.
    pub fn remove_application(
        &self,
        application_id: &str,
    ) -> Option<(Arc<ApplicationInfo>, Vec<Arc<AllocationInfo>>)> {
        let mut state = self.state.write();
        let app = state.applications.remove(application_id)?;
        let released = app.cleanup_all_allocations();
        for allocation in &released {
            if let Some(node) = state.nodes.get(&allocation.node_id) {
                node.remove_allocation(&allocation.allocated_resource);
            }
        }
        app.set_leaf_queue(None);
        Some((app, released))
    }

    /// Register a node. The add is tentative when the node carries existing
    /// allocations: a failure while restoring them leaves the node in the
    /// partition and the caller is expected to roll back via `remove_node`.
    pub fn add_node(
        &self,
        node: Arc<NodeInfo>,
        existing_allocations: &[Allocation],
    ) -> crate::Result<()> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&node.node_id) {
            return Err(CoreError::GenericError(format!(
                "node {} already exists in partition {}",
                node.node_id, self.name
            )));
        }
        state.total_resource.add(&node.total_resource);
        state.nodes.insert(node.node_id.clone(), node.clone());
        // Restore allocations reported by the RM for an already-running node.
        // This stays under the state lock so a concurrent proposal commit
        // cannot pass its fit check against capacity a restore is about to
        // consume.
        for existing in existing_allocations {
            self.restore_allocation(&state, &node, existing)?;
        }
        Ok(())
    }

    fn restore_allocation(
        &self,
        state: &PartitionState,
        node: &Arc<NodeInfo>,
        existing: &Allocation,
    ) -> crate::Result<()> {
        let app = state
            .applications
            .get(&existing.application_id)
            .ok_or_else(|| {
                CoreError::GenericError(format!(
                    "existing allocation {} on node {} references unknown application {}",
                    existing.uuid, node.node_id, existing.application_id
                ))
            })?;
        if !node.fits(&existing.resource) {
            return Err(CoreError::GenericError(format!(
                "existing allocation {} does not fit on node {}",
                existing.uuid, node.node_id
            )));
        }
        let info = Arc::new(AllocationInfo {
            uuid: existing.uuid.clone(),
            allocation_key: existing.allocation_key.clone(),
            application_id: existing.application_id.clone(),
            partition_name: self.name.clone(),
            queue_name: existing.queue_name.clone(),
            node_id: node.node_id.clone(),
            allocated_resource: existing.resource.clone(),
        });
        node.add_allocation(&info.allocated_resource);
        app.add_allocation(info);
        Ok(())
    }

    pub fn remove_node(&self, node_id: &str) -> Option<Arc<NodeInfo>> {
        let mut state = self.state.write();
        let node = state.nodes.remove(node_id)?;
        state.total_resource.sub(&node.total_resource);
        Some(node)
    }

    /// Turn a scheduler proposal into a committed allocation. Fails when the
    /// application or node is unknown or the resource no longer fits. Fit
    /// check and commit happen under the state writer lock, serialized
    /// against node adds restoring allocations on both event loops.
    pub fn add_allocation_from_proposal(
        &self,
        proposal: &AllocationProposal,
    ) -> crate::Result<Arc<AllocationInfo>> {
        let state = self.state.write();
        let app = state
            .applications
            .get(&proposal.application_id)
            .ok_or_else(|| {
                CoreError::GenericError(format!(
                    "proposal {} targets unknown application {}",
                    proposal.allocation_key, proposal.application_id
                ))
            })?;
        let node = state.nodes.get(&proposal.node_id).ok_or_else(|| {
            CoreError::GenericError(format!(
                "proposal {} targets unknown node {}",
                proposal.allocation_key, proposal.node_id
            ))
        })?;
        if !node.fits(&proposal.resource) {
            return Err(CoreError::GenericError(format!(
                "proposal {} does not fit on node {}",
                proposal.allocation_key, proposal.node_id
            )));
        }
        let allocation = Arc::new(AllocationInfo {
            uuid: Uuid::new_v4().to_string(),
            allocation_key: proposal.allocation_key.clone(),
            application_id: proposal.application_id.clone(),
            partition_name: self.name.clone(),
            queue_name: proposal.queue_name.clone(),
            node_id: proposal.node_id.clone(),
            allocated_resource: proposal.resource.clone(),
        });
        node.add_allocation(&allocation.allocated_resource);
        app.add_allocation(allocation.clone());
        Ok(allocation)
    }

    /// Release allocations of one application; with a uuid only that
    /// allocation, otherwise all of them. Unknown targets release nothing.
    pub fn release_allocations_for_application(
        &self,
        release: &ReleaseAllocation,
    ) -> Vec<Arc<AllocationInfo>> {
        let state = self.state.write();
        let Some(app) = state.applications.get(&release.application_id) else {
            return Vec::new();
        };
        let released = match &release.uuid {
            Some(uuid) => app.remove_allocation(uuid).into_iter().collect(),
            None => app.cleanup_all_allocations(),
        };
        for allocation in &released {
            if let Some(node) = state.nodes.get(&allocation.node_id) {
                node.remove_allocation(&allocation.allocated_resource);
            }
        }
        released
    }
}
