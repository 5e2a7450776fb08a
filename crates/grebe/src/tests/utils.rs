use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::ApplicationId;
use crate::cache::cluster::ClusterInfo;
use crate::cache::node::NodeInfo;
use crate::common::Map;
use crate::common::eventqueue::{OverflowPolicy, event_queue};
use crate::common::resources::{MEMORY, Resource, VCORE};
use crate::config::{CONFIG_DIR_ENV, PartitionConfig, QueueConfig, SchedulerConfig};
use crate::events::{
    AllocationProposal, CacheEvent, EventHandlers, SchedulerEvent,
};
use crate::messages::{
    AllocationAsk, NODE_PARTITION_ATTRIBUTE, NewApplication, NodeDescription, UpdateResponse,
};
use crate::proxy::{RmCallback, RmProxy};

/// Shared config directory for all tests; `GREBE_CONFIG_DIR` points here.
/// Tests write their own uniquely-named policy group files into it.
pub fn config_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        unsafe {
            std::env::set_var(CONFIG_DIR_ENV, &path);
        }
        std::mem::forget(dir);
        path
    })
}

pub fn unique_policy_group(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("{prefix}-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn write_policy(policy_group: &str, config: &SchedulerConfig) {
    let path = config_dir().join(format!("{policy_group}.json"));
    std::fs::write(path, serde_json::to_vec(config).unwrap()).unwrap();
}

fn leaf_queue(name: &str) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        properties: Map::default(),
        queues: Vec::new(),
    }
}

/// A partition with a root queue holding the leaves `default` and `batch`.
pub fn partition_config(name: &str) -> PartitionConfig {
    PartitionConfig {
        name: name.to_string(),
        queues: QueueConfig {
            name: "root".to_string(),
            properties: Map::default(),
            queues: vec![leaf_queue("default"), leaf_queue("batch")],
        },
    }
}

pub fn scheduler_config(partitions: Vec<PartitionConfig>) -> SchedulerConfig {
    SchedulerConfig { partitions }
}

pub fn node_description(node_id: &str, partition: &str, memory: i64) -> NodeDescription {
    let mut attributes = Map::default();
    attributes.insert(NODE_PARTITION_ATTRIBUTE.to_string(), partition.to_string());
    NodeDescription {
        node_id: node_id.to_string(),
        attributes,
        schedulable_resource: Resource::from_pairs([(MEMORY, memory), (VCORE, 10)]),
        existing_allocations: Vec::new(),
    }
}

pub fn test_node(node_id: &str, partition: &str, memory: i64) -> NodeInfo {
    NodeInfo::from_description(&node_description(node_id, partition, memory)).unwrap()
}

pub fn new_app(application_id: &str, partition: &str, queue: &str) -> NewApplication {
    NewApplication {
        application_id: application_id.to_string(),
        partition_name: partition.to_string(),
        queue_name: queue.to_string(),
    }
}

pub fn ask(key: &str, application_id: &str, partition: &str, memory: i64) -> AllocationAsk {
    AllocationAsk {
        allocation_key: key.to_string(),
        application_id: application_id.to_string(),
        partition_name: partition.to_string(),
        queue_name: "root.default".to_string(),
        resource_per_ask: Resource::from_pairs([(MEMORY, memory)]),
        pending_ask_count: 1,
    }
}

/// RM callback recording every delivered response.
#[derive(Default)]
pub struct RecordingCallback {
    responses: Mutex<Vec<UpdateResponse>>,
}

impl RmCallback for RecordingCallback {
    fn recv_update_response(&self, response: UpdateResponse) -> crate::Result<()> {
        self.responses.lock().push(response);
        Ok(())
    }
}

impl RecordingCallback {
    pub fn new() -> Arc<RecordingCallback> {
        Arc::new(RecordingCallback::default())
    }

    pub fn responses(&self) -> Vec<UpdateResponse> {
        self.responses.lock().clone()
    }

    /// Wait until a delivered response matches; panics after a few seconds.
    pub async fn wait_for(
        &self,
        what: &str,
        predicate: impl Fn(&UpdateResponse) -> bool,
    ) -> UpdateResponse {
        for _ in 0..400 {
            if let Some(response) = self.responses.lock().iter().find(|r| predicate(r)).cloned() {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for response: {what}");
    }
}

/// What the stub scheduler observed, with completion channels stripped.
#[derive(Debug)]
pub enum RecordedSchedulerEvent {
    AllocationUpdates {
        new_asks: Vec<AllocationAsk>,
        rejected_allocations: Vec<AllocationProposal>,
        release_count: usize,
    },
    ApplicationsUpdate {
        added: Vec<ApplicationId>,
        removed: Vec<ApplicationId>,
    },
}

/// Cache + proxy wired together with a stub external scheduler.
///
/// The stub acknowledges config events, forwards partition removals back
/// into the cache like the real scheduler would, and records everything
/// else for assertions.
pub struct TestSystem {
    pub cluster: Arc<ClusterInfo>,
    pub proxy: Arc<RmProxy>,
    pub scheduler_events: Arc<Mutex<Vec<RecordedSchedulerEvent>>>,
}

impl TestSystem {
    pub fn start() -> TestSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        let cluster = ClusterInfo::new(1024, OverflowPolicy::Block);
        let proxy = RmProxy::new(1024, OverflowPolicy::Block, Duration::from_secs(5));
        let (scheduler_sender, mut scheduler_receiver) =
            event_queue("scheduler", 1024, OverflowPolicy::Block);
        let handlers = EventHandlers {
            cache_rm: cluster.rm_event_sender(),
            cache_scheduler: cluster.scheduler_event_sender(),
            scheduler: scheduler_sender,
            rm_proxy: proxy.event_sender(),
        };
        cluster.start_service(handlers.clone());
        proxy.start_service(handlers.clone());

        let scheduler_events = Arc::new(Mutex::new(Vec::new()));
        let recorded = scheduler_events.clone();
        let cache_scheduler = handlers.cache_scheduler.clone();
        tokio::spawn(async move {
            while let Some(event) = scheduler_receiver.recv().await {
                match event {
                    SchedulerEvent::AllocationUpdates {
                        new_asks,
                        to_releases,
                        rejected_allocations,
                    } => {
                        recorded.lock().push(RecordedSchedulerEvent::AllocationUpdates {
                            new_asks,
                            rejected_allocations,
                            release_count: to_releases
                                .map(|r| r.allocations_to_release.len())
                                .unwrap_or(0),
                        });
                    }
                    SchedulerEvent::ApplicationsUpdate {
                        added_applications,
                        removed_applications,
                    } => {
                        recorded.lock().push(RecordedSchedulerEvent::ApplicationsUpdate {
                            added: added_applications
                                .iter()
                                .map(|app| app.application_id.clone())
                                .collect(),
                            removed: removed_applications
                                .iter()
                                .map(|request| request.application_id.clone())
                                .collect(),
                        });
                    }
                    SchedulerEvent::UpdatePartitionsConfig { result, .. } => result.succeed(),
                    SchedulerEvent::DeletePartitionsConfig { result, .. } => result.succeed(),
                    SchedulerEvent::RemoveRmPartitions { rm_id, result } => {
                        if cache_scheduler
                            .send(CacheEvent::RemoveRmPartitions { rm_id, result })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        TestSystem {
            cluster,
            proxy,
            scheduler_events,
        }
    }

    pub async fn wait_scheduler_event(
        &self,
        what: &str,
        predicate: impl Fn(&RecordedSchedulerEvent) -> bool,
    ) {
        for _ in 0..400 {
            if self.scheduler_events.lock().iter().any(|e| predicate(e)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for scheduler event: {what}");
    }
}
