use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::queue::QueueInfo;
use crate::common::resources::Resource;
use crate::common::{Map, Set};
use crate::config::APPLICATION_SORT_POLICY;
use crate::{ApplicationId, QueueName};

/// How applications within a leaf queue are ordered for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortPolicy {
    Fair,
    #[default]
    Fifo,
}

impl SortPolicy {
    fn from_properties(properties: &Map<String, String>) -> SortPolicy {
        match properties.get(APPLICATION_SORT_POLICY).map(String::as_str) {
            Some("fair") => SortPolicy::Fair,
            _ => SortPolicy::Fifo,
        }
    }
}

/// Index of a queue node in its [`QueueTree`] arena.
///
/// Handles are only meaningful for the tree that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(usize);

#[derive(Debug)]
struct QueueNode {
    full_path: QueueName,
    parent: Option<QueueHandle>,
    children: Vec<QueueHandle>,
    is_leaf: bool,
    application_sort: SortPolicy,
    queue_sort: SortPolicy,
    pending_resource: Resource,
    may_allocated_resource: Resource,
    partition_resource: Resource,
    /// Applications currently tracked on this queue; leaves only.
    applications: Set<ApplicationId>,
}

/// Scheduler-side queue hierarchy of one partition.
///
/// The tree shape mirrors the partition's configured queues and is immutable
/// after construction; only the per-node accounting changes. All nodes live
/// in one arena behind a single lock, parent/child links are arena indices.
#[derive(Debug)]
pub struct QueueTree {
    inner: RwLock<TreeInner>,
}

#[derive(Debug)]
struct TreeInner {
    nodes: Vec<QueueNode>,
    index: Map<QueueName, QueueHandle>,
    root: QueueHandle,
}

impl QueueTree {
    pub fn from_queue_info(root: &Arc<QueueInfo>) -> QueueTree {
        let mut inner = TreeInner {
            nodes: Vec::new(),
            index: Map::default(),
            root: QueueHandle(0),
        };
        let root_handle = Self::build(&mut inner, root, None);
        inner.root = root_handle;
        QueueTree {
            inner: RwLock::new(inner),
        }
    }

    fn build(
        inner: &mut TreeInner,
        queue: &Arc<QueueInfo>,
        parent: Option<QueueHandle>,
    ) -> QueueHandle {
        let handle = QueueHandle(inner.nodes.len());
        inner.nodes.push(QueueNode {
            full_path: queue.full_path.clone(),
            parent,
            children: Vec::new(),
            is_leaf: queue.is_leaf,
            application_sort: SortPolicy::from_properties(&queue.properties),
            queue_sort: SortPolicy::Fair,
            pending_resource: Resource::new(),
            may_allocated_resource: Resource::new(),
            partition_resource: Resource::new(),
            applications: Set::default(),
        });
        inner.index.insert(queue.full_path.clone(), handle);
        for child in queue.children() {
            let child_handle = Self::build(inner, child, Some(handle));
            inner.nodes[handle.0].children.push(child_handle);
        }
        handle
    }

    pub fn root(&self) -> QueueHandle {
        self.inner.read().root
    }

    pub fn find(&self, full_path: &str) -> Option<QueueHandle> {
        self.inner.read().index.get(full_path).copied()
    }

    pub fn is_leaf(&self, queue: QueueHandle) -> bool {
        self.inner.read().nodes[queue.0].is_leaf
    }

    pub fn full_path(&self, queue: QueueHandle) -> QueueName {
        self.inner.read().nodes[queue.0].full_path.clone()
    }

    pub fn children(&self, queue: QueueHandle) -> Vec<QueueHandle> {
        self.inner.read().nodes[queue.0].children.clone()
    }

    pub fn application_sort(&self, queue: QueueHandle) -> SortPolicy {
        self.inner.read().nodes[queue.0].application_sort
    }

    pub fn queue_sort(&self, queue: QueueHandle) -> SortPolicy {
        self.inner.read().nodes[queue.0].queue_sort
    }

    pub fn pending_resource(&self, queue: QueueHandle) -> Resource {
        self.inner.read().nodes[queue.0].pending_resource.clone()
    }

    pub fn may_allocated_resource(&self, queue: QueueHandle) -> Resource {
        self.inner.read().nodes[queue.0]
            .may_allocated_resource
            .clone()
    }

    pub fn partition_resource(&self, queue: QueueHandle) -> Resource {
        self.inner.read().nodes[queue.0].partition_resource.clone()
    }

    pub fn set_partition_resource(&self, queue: QueueHandle, resource: Resource) {
        self.inner.write().nodes[queue.0].partition_resource = resource;
    }

    /// Adjust pending resource of a single node; the caller decides whether
    /// and how far to propagate.
    pub fn inc_pending_resource(&self, queue: QueueHandle, delta: &Resource) {
        self.inner.write().nodes[queue.0].pending_resource.add(delta);
    }

    pub fn dec_pending_resource(&self, queue: QueueHandle, delta: &Resource) {
        let mut inner = self.inner.write();
        let pending = &mut inner.nodes[queue.0].pending_resource;
        pending.sub(delta);
        debug_assert!(!pending.has_negative());
    }

    /// Adjust pending resource of a node and every ancestor up to the root.
    pub fn inc_pending_resource_with_ancestors(&self, queue: QueueHandle, delta: &Resource) {
        let mut inner = self.inner.write();
        let mut current = Some(queue);
        while let Some(handle) = current {
            let node = &mut inner.nodes[handle.0];
            node.pending_resource.add(delta);
            current = node.parent;
        }
    }

    pub fn dec_pending_resource_with_ancestors(&self, queue: QueueHandle, delta: &Resource) {
        let mut inner = self.inner.write();
        let mut current = Some(queue);
        while let Some(handle) = current {
            let node = &mut inner.nodes[handle.0];
            node.pending_resource.sub(delta);
            debug_assert!(!node.pending_resource.has_negative());
            current = node.parent;
        }
    }

    pub fn inc_may_allocated_resource(&self, queue: QueueHandle, delta: &Resource) {
        let mut inner = self.inner.write();
        let mut current = Some(queue);
        while let Some(handle) = current {
            let node = &mut inner.nodes[handle.0];
            node.may_allocated_resource.add(delta);
            current = node.parent;
        }
    }

    pub fn dec_may_allocated_resource(&self, queue: QueueHandle, delta: &Resource) {
        let mut inner = self.inner.write();
        let mut current = Some(queue);
        while let Some(handle) = current {
            let node = &mut inner.nodes[handle.0];
            node.may_allocated_resource.sub(delta);
            debug_assert!(!node.may_allocated_resource.has_negative());
            current = node.parent;
        }
    }

    /// Track an application on a leaf. Calling this on a non-leaf is a caller
    /// bug; the call is ignored.
    pub fn add_application(&self, queue: QueueHandle, application_id: &str) {
        let mut inner = self.inner.write();
        let node = &mut inner.nodes[queue.0];
        debug_assert!(node.is_leaf);
        if node.is_leaf {
            node.applications.insert(application_id.to_string());
        }
    }

    pub fn remove_application(&self, queue: QueueHandle, application_id: &str) {
        let mut inner = self.inner.write();
        let node = &mut inner.nodes[queue.0];
        debug_assert!(node.is_leaf);
        node.applications.remove(application_id);
    }

    pub fn applications(&self, queue: QueueHandle) -> Vec<ApplicationId> {
        self.inner.read().nodes[queue.0]
            .applications
            .iter()
            .cloned()
            .collect()
    }

    /// Depth-first flatten of the subtree under `from`, keyed by full queue
    /// name. A `None` starting point flattens nothing.
    pub fn collect_queues(&self, from: Option<QueueHandle>, queues: &mut Map<QueueName, QueueHandle>) {
        let Some(from) = from else {
            return;
        };
        let inner = self.inner.read();
        let mut stack = vec![from];
        while let Some(handle) = stack.pop() {
            let node = &inner.nodes[handle.0];
            queues.insert(node.full_path.clone(), handle);
            stack.extend(node.children.iter().copied());
        }
    }
}
