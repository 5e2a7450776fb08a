use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::cache::allocation::AllocationInfo;
use crate::cache::queue::QueueInfo;
use crate::common::Map;
use crate::common::resources::Resource;
use crate::{AllocationUuid, ApplicationId, PartitionName, QueueName};

/// One tenant application and its allocation bookkeeping.
///
/// Identity fields are immutable; the allocation set and running total live
/// behind the application's own lock so unrelated applications do not contend.
/// Invariant: `allocated_resource` equals the pointwise sum of the resources
/// of all currently held allocations.
#[derive(Debug)]
pub struct ApplicationInfo {
    pub application_id: ApplicationId,
    pub partition: PartitionName,
    pub queue_name: QueueName,
    pub submission_time: SystemTime,

    state: RwLock<AppState>,
}

#[derive(Debug, Default)]
struct AppState {
    allocated_resource: Resource,
    allocations: Map<AllocationUuid, Arc<AllocationInfo>>,
    leaf_queue: Option<Arc<QueueInfo>>,
}

impl ApplicationInfo {
    pub fn new(application_id: &str, partition: &str, queue_name: &str) -> Self {
        ApplicationInfo {
            application_id: application_id.to_string(),
            partition: partition.to_string(),
            queue_name: queue_name.to_string(),
            submission_time: SystemTime::now(),
            state: RwLock::new(AppState::default()),
        }
    }

    pub fn add_allocation(&self, allocation: Arc<AllocationInfo>) {
        let mut state = self.state.write();
        state
            .allocated_resource
            .add(&allocation.allocated_resource);
        state
            .allocations
            .insert(allocation.uuid.clone(), allocation);
    }

    pub fn remove_allocation(&self, uuid: &str) -> Option<Arc<AllocationInfo>> {
        let mut state = self.state.write();
        let allocation = state.allocations.remove(uuid)?;
        state
            .allocated_resource
            .sub(&allocation.allocated_resource);
        debug_assert!(!state.allocated_resource.has_negative());
        Some(allocation)
    }

    /// Empty the allocation set and reset the total to the zero vector,
    /// returning every removed allocation so the caller can release them at
    /// the node/partition level.
    pub fn cleanup_all_allocations(&self) -> Vec<Arc<AllocationInfo>> {
        let mut state = self.state.write();
        state.allocated_resource = Resource::new();
        state.allocations.drain().map(|(_, alloc)| alloc).collect()
    }

    pub fn get_allocation(&self, uuid: &str) -> Option<Arc<AllocationInfo>> {
        self.state.read().allocations.get(uuid).cloned()
    }

    /// Snapshot of the current allocations, in arbitrary order.
    pub fn get_all_allocations(&self) -> Vec<Arc<AllocationInfo>> {
        self.state.read().allocations.values().cloned().collect()
    }

    pub fn allocated_resource(&self) -> Resource {
        self.state.read().allocated_resource.clone()
    }

    pub fn set_leaf_queue(&self, queue: Option<Arc<QueueInfo>>) {
        self.state.write().leaf_queue = queue;
    }

    pub fn leaf_queue(&self) -> Option<Arc<QueueInfo>> {
        self.state.read().leaf_queue.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::resources::MEMORY;

    fn alloc(uuid: &str, memory: i64) -> Arc<AllocationInfo> {
        Arc::new(AllocationInfo {
            uuid: uuid.to_string(),
            allocation_key: format!("key-{uuid}"),
            application_id: "app1".to_string(),
            partition_name: "[rm1]default".to_string(),
            queue_name: "root.default".to_string(),
            node_id: "n1".to_string(),
            allocated_resource: Resource::from_pairs([(MEMORY, memory)]),
        })
    }

    #[test]
    fn total_tracks_allocation_set() {
        let app = ApplicationInfo::new("app1", "[rm1]default", "root.default");
        assert!(app.allocated_resource().is_zero());

        app.add_allocation(alloc("a", 100));
        app.add_allocation(alloc("b", 300));
        assert_eq!(app.allocated_resource().get(MEMORY), 400);

        let removed = app.remove_allocation("a").unwrap();
        assert_eq!(removed.allocated_resource.get(MEMORY), 100);
        assert_eq!(app.allocated_resource().get(MEMORY), 300);

        assert!(app.remove_allocation("a").is_none());
        assert_eq!(app.allocated_resource().get(MEMORY), 300);
    }

    #[test]
    fn cleanup_returns_everything_and_zeroes_total() {
        let app = ApplicationInfo::new("app1", "[rm1]default", "root.default");
        app.add_allocation(alloc("a", 100));
        app.add_allocation(alloc("b", 300));

        let released = app.cleanup_all_allocations();
        assert_eq!(released.len(), 2);
        assert!(app.allocated_resource().is_zero());
        assert!(app.get_all_allocations().is_empty());
        assert!(app.cleanup_all_allocations().is_empty());
    }

    #[test]
    fn allocation_lookup() {
        let app = ApplicationInfo::new("app1", "[rm1]default", "root.default");
        app.add_allocation(alloc("a", 100));
        assert_eq!(app.get_allocation("a").unwrap().uuid, "a");
        assert!(app.get_allocation("b").is_none());
        assert_eq!(app.get_all_allocations().len(), 1);
    }
}
