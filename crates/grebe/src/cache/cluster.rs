use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cache::application::ApplicationInfo;
use crate::cache::node::NodeInfo;
use crate::cache::partition::{AdmissionMode, PartitionInfo};
use crate::common::error::CoreError;
use crate::common::eventqueue::{OverflowPolicy, QueueReceiver, QueueSender, event_queue};
use crate::common::utils::{normalized_partition_name, rm_id_from_partition_name};
use crate::common::{Map, Set};
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, resolve_config_file};
use crate::events::{
    Ack, AckResult, AllocationProposalBundle, CacheEvent, EventHandlers, RmEvent, RmProxyEvent,
    SchedulerEvent,
};
use crate::messages::{
    AcceptedApplication, AcceptedNode, AllocationReleaseResponse, RegisterRmRequest,
    RejectedAllocationAsk, RejectedApplication, RejectedNode, ReleaseAllocation, TerminationType,
    UpdateRequest,
};
use crate::metrics::CoreMetrics;
use crate::{ApplicationId, PartitionName, RmId};

/// How often the config watcher polls for content changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The authoritative cluster-state cache.
///
/// Owns every partition and serializes all state mutation through two
/// event-consumer loops: one for RM-originated events, one for
/// scheduler-originated events. The loops run concurrently; every mutating
/// handler takes the cluster write lock for its critical section, so
/// mutations are mutually exclusive across the loops. Only per-queue FIFO
/// order is guaranteed, never cross-queue order.
pub struct ClusterInfo {
    partitions: RwLock<Map<PartitionName, Arc<PartitionInfo>>>,
    policy_group: Mutex<String>,
    config_checksum: Mutex<Vec<u8>>,
    config_watcher: Mutex<Option<Arc<ConfigWatcher>>>,

    handlers: std::sync::OnceLock<EventHandlers>,
    metrics: Arc<CoreMetrics>,

    rm_sender: QueueSender<RmEvent>,
    scheduler_sender: QueueSender<CacheEvent>,
    receivers: Mutex<Option<(QueueReceiver<RmEvent>, QueueReceiver<CacheEvent>)>>,
}

impl ClusterInfo {
    pub fn new(queue_capacity: usize, overflow_policy: OverflowPolicy) -> Arc<ClusterInfo> {
        let (rm_sender, rm_receiver) = event_queue("cache-rm", queue_capacity, overflow_policy);
        let (scheduler_sender, scheduler_receiver) =
            event_queue("cache-scheduler", queue_capacity, overflow_policy);
        Arc::new(ClusterInfo {
            partitions: RwLock::new(Map::default()),
            policy_group: Mutex::new(String::new()),
            config_checksum: Mutex::new(Vec::new()),
            config_watcher: Mutex::new(None),
            handlers: std::sync::OnceLock::new(),
            metrics: Arc::new(CoreMetrics::new()),
            rm_sender,
            scheduler_sender,
            receivers: Mutex::new(Some((rm_receiver, scheduler_receiver))),
        })
    }

    /// Spawn the two consumer loops. May only be called once.
    pub fn start_service(self: &Arc<Self>, handlers: EventHandlers) {
        if self.handlers.set(handlers).is_err() {
            panic!("Cluster service started twice");
        }
        let (rm_receiver, scheduler_receiver) = self
            .receivers
            .lock()
            .take()
            .expect("Cluster service started twice");
        tokio::spawn(self.clone().rm_event_loop(rm_receiver));
        tokio::spawn(self.clone().scheduler_event_loop(scheduler_receiver));
    }

    /// Sender into the RM-event loop.
    pub fn rm_event_sender(&self) -> QueueSender<RmEvent> {
        self.rm_sender.clone()
    }

    /// Sender into the scheduler-event loop.
    pub fn scheduler_event_sender(&self) -> QueueSender<CacheEvent> {
        self.scheduler_sender.clone()
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    pub fn get_partition(&self, name: &str) -> Option<Arc<PartitionInfo>> {
        self.partitions.read().get(name).cloned()
    }

    pub fn list_partitions(&self) -> Vec<PartitionName> {
        self.partitions.read().keys().cloned().collect()
    }

    pub fn config_checksum(&self) -> Vec<u8> {
        self.config_checksum.lock().clone()
    }

    fn handlers(&self) -> &EventHandlers {
        self.handlers.get().expect("Cluster service not started")
    }

    async fn send_scheduler(&self, event: SchedulerEvent) {
        if let Err(e) = self.handlers().scheduler.send(event).await {
            log::error!("Cannot deliver event to the scheduler: {e}");
        }
    }

    async fn send_rm_proxy(&self, event: RmProxyEvent) {
        if let Err(e) = self.handlers().rm_proxy.send(event).await {
            log::error!("Cannot deliver event to the RM proxy: {e}");
        }
    }

    async fn rm_event_loop(self: Arc<Self>, mut events: QueueReceiver<RmEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RmEvent::Update(request) => self.process_rm_update(request).await,
                RmEvent::RegisterRm { request, result } => {
                    self.process_rm_registration(request, result).await
                }
                RmEvent::ConfigUpdate { rm_id, result } => {
                    self.clone().process_config_update(rm_id, result)
                }
            }
        }
        log::debug!("RM event loop finished");
    }

    async fn scheduler_event_loop(self: Arc<Self>, mut events: QueueReceiver<CacheEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                CacheEvent::AllocationProposals(bundle) => {
                    self.process_allocation_proposals(bundle).await
                }
                CacheEvent::RejectedNewApplication {
                    application_id,
                    reason,
                } => {
                    // Rejected applications were never added to the cache.
                    log::debug!("Application {application_id} rejected by scheduler: {reason}");
                }
                CacheEvent::ReleaseAllocations(releases) => {
                    self.process_allocation_releases(releases).await
                }
                CacheEvent::RemovedApplication {
                    application_id,
                    partition_name,
                } => {
                    self.process_removed_application(application_id, partition_name)
                        .await
                }
                CacheEvent::RemoveRmPartitions { rm_id, result } => {
                    self.process_remove_rm_partitions(rm_id, result)
                }
            }
        }
        log::debug!("Scheduler event loop finished");
    }

    async fn process_rm_update(&self, request: UpdateRequest) {
        // Ordering matters: applications must be admitted before their asks
        // are validated, and nodes may carry allocations of those apps.
        self.process_application_updates(&request).await;
        self.process_ask_and_release_requests(&request).await;
        self.process_node_updates(&request).await;
    }

    /// Admit application to an existing partition and leaf queue, under the
    /// cluster write lock.
    pub(crate) fn add_application_to_partition(
        &self,
        app: Arc<ApplicationInfo>,
        mode: AdmissionMode,
    ) -> crate::Result<bool> {
        let partitions = self.partitions.write();
        let partition = partitions.get(&app.partition).ok_or_else(|| {
            CoreError::GenericError(format!(
                "cannot add application {}: partition {} does not exist",
                app.application_id, app.partition
            ))
        })?;
        partition.add_application(app, mode)
    }

    async fn process_application_updates(&self, request: &UpdateRequest) {
        if request.new_applications.is_empty() && request.remove_applications.is_empty() {
            return;
        }
        let mut added: Vec<Arc<ApplicationInfo>> = Vec::new();
        let mut accepted: Vec<AcceptedApplication> = Vec::new();
        let mut rejected: Vec<RejectedApplication> = Vec::new();

        for new_app in &request.new_applications {
            let app = Arc::new(ApplicationInfo::new(
                &new_app.application_id,
                &new_app.partition_name,
                &new_app.queue_name,
            ));
            match self.add_application_to_partition(app.clone(), AdmissionMode::FailIfExists) {
                Ok(_) => {
                    self.metrics.inc_applications_added();
                    self.metrics.inc_applications_running();
                    accepted.push(AcceptedApplication {
                        application_id: new_app.application_id.clone(),
                    });
                    added.push(app);
                }
                Err(e) => {
                    self.metrics.inc_applications_rejected();
                    rejected.push(RejectedApplication {
                        application_id: new_app.application_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.send_rm_proxy(RmProxyEvent::ApplicationUpdate {
            rm_id: request.rm_id.clone(),
            accepted_applications: accepted,
            rejected_applications: rejected,
        })
        .await;

        if !added.is_empty() || !request.remove_applications.is_empty() {
            // Removals are counted as completed without per-application state
            // tracking; a removal request is trusted as-is.
            self.metrics
                .sub_applications_running(request.remove_applications.len());
            self.metrics
                .add_applications_completed(request.remove_applications.len());

            self.send_scheduler(SchedulerEvent::ApplicationsUpdate {
                added_applications: added,
                removed_applications: request.remove_applications.clone(),
            })
            .await;
        }
    }

    async fn process_ask_and_release_requests(&self, request: &UpdateRequest) {
        if request.asks.is_empty() && request.releases.is_none() {
            return;
        }
        let mut rejected: Vec<RejectedAllocationAsk> = Vec::new();
        let mut new_asks = Vec::new();
        {
            let partitions = self.partitions.read();
            for ask in &request.asks {
                let Some(partition) = partitions.get(&ask.partition_name) else {
                    let reason = format!(
                        "failed to find partition {} for ask {}",
                        ask.partition_name, ask.allocation_key
                    );
                    log::debug!("{reason}");
                    rejected.push(RejectedAllocationAsk {
                        allocation_key: ask.allocation_key.clone(),
                        application_id: ask.application_id.clone(),
                        reason,
                    });
                    continue;
                };
                if partition.get_application(&ask.application_id).is_none() {
                    rejected.push(RejectedAllocationAsk {
                        allocation_key: ask.allocation_key.clone(),
                        application_id: ask.application_id.clone(),
                        reason: format!(
                            "failed to find application {} for ask {}",
                            ask.application_id, ask.allocation_key
                        ),
                    });
                    continue;
                }
                new_asks.push(ask.clone());
            }
        }

        self.send_rm_proxy(RmProxyEvent::RejectedAllocationAsks {
            rm_id: request.rm_id.clone(),
            rejected_allocation_asks: rejected,
        })
        .await;

        // Placement is not decided here; valid asks and releases go to the
        // scheduler as one batch.
        self.send_scheduler(SchedulerEvent::AllocationUpdates {
            new_asks,
            to_releases: request.releases.clone(),
            rejected_allocations: Vec::new(),
        })
        .await;
    }

    async fn process_node_updates(&self, request: &UpdateRequest) {
        if request.new_schedulable_nodes.is_empty() {
            return;
        }
        let mut accepted: Vec<AcceptedNode> = Vec::new();
        let mut rejected: Vec<RejectedNode> = Vec::new();

        for description in &request.new_schedulable_nodes {
            let node = match NodeInfo::from_description(description) {
                Ok(node) => Arc::new(node),
                Err(e) => {
                    let reason = format!(
                        "failed to create node {} from request: {e}",
                        description.node_id
                    );
                    log::warn!("{reason}");
                    rejected.push(RejectedNode {
                        node_id: description.node_id.clone(),
                        reason,
                    });
                    continue;
                }
            };
            let partition = self.partitions.read().get(&node.partition).cloned();
            let Some(partition) = partition else {
                let reason = format!(
                    "failed to find partition {} for new node {}",
                    node.partition, node.node_id
                );
                log::warn!("{reason}");
                rejected.push(RejectedNode {
                    node_id: node.node_id.clone(),
                    reason,
                });
                continue;
            };
            // Counted active while the add is tentative; the rollback below
            // takes it back, keeping the gauge net-zero for a failed node.
            self.metrics.inc_active_nodes();
            match partition.add_node(node.clone(), &description.existing_allocations) {
                Ok(()) => {
                    log::info!(
                        "Added node {} to partition {}",
                        node.node_id,
                        node.partition
                    );
                    accepted.push(AcceptedNode {
                        node_id: node.node_id.clone(),
                    });
                }
                Err(e) => {
                    let reason =
                        format!("failures when adding new node, removing the node: {e}");
                    log::warn!("{reason}");
                    partition.remove_node(&node.node_id);
                    self.metrics.dec_active_nodes();
                    rejected.push(RejectedNode {
                        node_id: node.node_id.clone(),
                        reason,
                    });
                }
            }
        }

        self.metrics.add_failed_nodes(rejected.len());
        self.send_rm_proxy(RmProxyEvent::NodeUpdate {
            rm_id: request.rm_id.clone(),
            accepted_nodes: accepted,
            rejected_nodes: rejected,
        })
        .await;
    }

    async fn process_rm_registration(&self, request: RegisterRmRequest, result: Ack) {
        let path = resolve_config_file(&request.policy_group);
        let (config, checksum) = match load_config(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                result.fail(e.to_string());
                return;
            }
        };

        let updated = {
            let mut partitions = self.partitions.write();
            let mut updated = Vec::new();
            for partition_config in &config.partitions {
                let name = normalized_partition_name(&partition_config.name, &request.rm_id);
                let partition = PartitionInfo::from_config(partition_config, &name, &request.rm_id);
                partitions.insert(name, partition.clone());
                updated.push(partition);
            }
            updated
        };

        // The policy group is fixed for this RM from now on.
        *self.policy_group.lock() = request.policy_group.clone();
        *self.config_checksum.lock() = checksum;

        self.send_scheduler(SchedulerEvent::UpdatePartitionsConfig {
            updated_partitions: updated,
            result,
        })
        .await;
    }

    /// Register a one-shot reload callback with the config watcher. The
    /// actual reload happens once the watcher detects a content change;
    /// queued requests are coalesced by the watcher itself.
    fn process_config_update(self: Arc<Self>, rm_id: RmId, result: Ack) {
        let policy_group = self.policy_group.lock().clone();
        if policy_group.is_empty() {
            result.fail("no resource manager has been registered yet".to_string());
            return;
        }
        let path = resolve_config_file(&policy_group);
        // A re-registration can change the policy group; a watcher on the
        // old config file is replaced, stopping its polling task.
        let watcher = {
            let mut guard = self.config_watcher.lock();
            match guard.as_ref() {
                Some(watcher) if watcher.path() == path => watcher.clone(),
                _ => {
                    let watcher = ConfigWatcher::spawn(
                        path,
                        self.config_checksum.lock().clone(),
                        CONFIG_POLL_INTERVAL,
                    );
                    *guard = Some(watcher.clone());
                    watcher
                }
            }
        };

        let cluster = self.clone();
        let handlers = self.handlers().clone();
        watcher.add_callback(Box::new(move || {
            Box::pin(async move {
                let (updated, deleted) = match cluster.update_partitions_from_config(&rm_id) {
                    Ok(diff) => diff,
                    Err(e) => {
                        result.fail(e.to_string());
                        return;
                    }
                };

                let (update_ack, update_done) = Ack::channel();
                let (delete_ack, delete_done) = Ack::channel();
                let sent = handlers
                    .scheduler
                    .send(SchedulerEvent::UpdatePartitionsConfig {
                        updated_partitions: updated,
                        result: update_ack,
                    })
                    .await
                    .and(
                        handlers
                            .scheduler
                            .send(SchedulerEvent::DeletePartitionsConfig {
                                deleted_partitions: deleted,
                                result: delete_ack,
                            })
                            .await,
                    );
                if let Err(e) = sent {
                    result.fail(format!("cannot notify scheduler about config change: {e}"));
                    return;
                }

                // Report the combined outcome; a reload is only done once the
                // scheduler acknowledged both partition sets.
                let outcome = combine_acks(update_done.await, delete_done.await);
                result.finish(outcome);
            })
        }));
    }

    /// Diff the on-disk configuration against the live cluster state.
    ///
    /// New partitions are created, partitions gone from the config are
    /// removed. A live partition keeps its runtime state; reconfiguring the
    /// queue tree of a running partition is not supported.
    fn update_partitions_from_config(
        &self,
        rm_id: &str,
    ) -> crate::Result<(Vec<Arc<PartitionInfo>>, Vec<Arc<PartitionInfo>>)> {
        let policy_group = self.policy_group.lock().clone();
        let path = resolve_config_file(&policy_group);
        let (config, checksum) = load_config(&path)?;

        let mut partitions = self.partitions.write();
        let mut updated = Vec::new();
        let mut configured: Set<PartitionName> = Set::default();
        for partition_config in &config.partitions {
            let name = normalized_partition_name(&partition_config.name, rm_id);
            configured.insert(name.clone());
            if let Some(existing) = partitions.get(&name) {
                updated.push(existing.clone());
            } else {
                let partition = PartitionInfo::from_config(partition_config, &name, rm_id);
                partitions.insert(name, partition.clone());
                updated.push(partition);
            }
        }
        let deleted_names: Vec<PartitionName> = partitions
            .iter()
            .filter(|(name, partition)| {
                partition.rm_id == rm_id && !configured.contains(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .collect();
        let mut deleted = Vec::new();
        for name in deleted_names {
            if let Some(partition) = partitions.remove(&name) {
                log::info!("Partition {name} removed by config reload");
                deleted.push(partition);
            }
        }
        drop(partitions);

        *self.config_checksum.lock() = checksum;
        Ok((updated, deleted))
    }

    /// The single chokepoint where tentative scheduler decisions become
    /// authoritative cluster state. The whole commit happens under the
    /// cluster write lock; there is no partial visibility of a half
    /// committed allocation.
    async fn process_allocation_proposals(&self, bundle: AllocationProposalBundle) {
        if bundle.allocation_proposals.len() != 1 || !bundle.release_proposals.is_empty() {
            panic!(
                "Received proposal bundle with {} allocation and {} release proposals, \
                 only #allocations=1 and #releases=0 is supported",
                bundle.allocation_proposals.len(),
                bundle.release_proposals.len()
            );
        }
        let proposal = bundle
            .allocation_proposals
            .into_iter()
            .next()
            .expect("checked above");

        let outcome = {
            let partitions = self.partitions.write();
            match partitions.get(&proposal.partition_name) {
                Some(partition) => partition.add_allocation_from_proposal(&proposal),
                None => Err(CoreError::GenericError(format!(
                    "partition {} does not exist",
                    proposal.partition_name
                ))),
            }
        };

        match outcome {
            Ok(allocation) => {
                self.metrics.inc_scheduled_allocations();
                let rm_id = rm_id_from_partition_name(&proposal.partition_name);
                self.send_rm_proxy(RmProxyEvent::NewAllocations {
                    rm_id,
                    allocations: vec![allocation.to_allocation()],
                })
                .await;
            }
            Err(e) => {
                log::debug!(
                    "Allocation proposal {} rejected: {e}",
                    proposal.allocation_key
                );
                self.send_scheduler(SchedulerEvent::AllocationUpdates {
                    new_asks: Vec::new(),
                    to_releases: None,
                    rejected_allocations: vec![proposal],
                })
                .await;
            }
        }
    }

    async fn process_allocation_releases(&self, releases: Vec<ReleaseAllocation>) {
        if releases.is_empty() {
            return;
        }
        let mut notifications = Vec::new();
        {
            let partitions = self.partitions.write();
            for release in &releases {
                if let Some(partition) = partitions.get(&release.partition_name) {
                    let released = partition.release_allocations_for_application(release);
                    notifications.push((
                        rm_id_from_partition_name(&release.partition_name),
                        released,
                        release.termination_type,
                        release.message.clone(),
                    ));
                }
            }
        }
        for (rm_id, released, termination_type, message) in notifications {
            self.notify_rm_allocation_released(rm_id, released, termination_type, message)
                .await;
        }
    }

    async fn process_removed_application(
        &self,
        application_id: ApplicationId,
        partition_name: PartitionName,
    ) {
        let released = {
            let partitions = self.partitions.write();
            partitions
                .get(&partition_name)
                .and_then(|partition| partition.remove_application(&application_id))
                .map(|(_, released)| released)
        };
        if let Some(released) = released {
            self.notify_rm_allocation_released(
                rm_id_from_partition_name(&partition_name),
                released,
                TerminationType::StoppedByRm,
                format!("application {application_id} removed"),
            )
            .await;
        }
    }

    fn process_remove_rm_partitions(&self, rm_id: RmId, result: Ack) {
        let removed = {
            let mut partitions = self.partitions.write();
            let names: Vec<PartitionName> = partitions
                .iter()
                .filter(|(_, partition)| partition.rm_id == rm_id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                partitions.remove(name);
            }
            names
        };
        log::info!("Removed {} partition(s) of RM {rm_id}", removed.len());
        // In-memory removal cannot partially fail; the reported outcome is
        // the real one, not a hard-coded success.
        result.succeed();
    }

    async fn notify_rm_allocation_released(
        &self,
        rm_id: RmId,
        released: Vec<Arc<crate::cache::allocation::AllocationInfo>>,
        termination_type: TerminationType,
        message: String,
    ) {
        if released.is_empty() {
            return;
        }
        let released_allocations = released
            .iter()
            .map(|allocation| AllocationReleaseResponse {
                uuid: allocation.uuid.clone(),
                termination_type,
                message: message.clone(),
            })
            .collect();
        self.send_rm_proxy(RmProxyEvent::ReleasedAllocations {
            rm_id,
            released_allocations,
        })
        .await;
    }
}

fn combine_acks(
    update: Result<AckResult, tokio::sync::oneshot::error::RecvError>,
    delete: Result<AckResult, tokio::sync::oneshot::error::RecvError>,
) -> AckResult {
    for outcome in [update, delete] {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(reason),
            Err(_) => return Err("scheduler dropped the completion channel".to_string()),
        }
    }
    Ok(())
}
