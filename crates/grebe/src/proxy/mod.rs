use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::common::Map;
use crate::common::error::CoreError;
use crate::common::eventqueue::{OverflowPolicy, QueueReceiver, QueueSender, event_queue};
use crate::common::utils::normalized_partition_name;
use crate::events::{Ack, AckReceiver, EventHandlers, RmEvent, RmProxyEvent, SchedulerEvent};
use crate::messages::{
    NODE_PARTITION_ATTRIBUTE, NodeDescription, RegisterRmRequest, UpdateRequest, UpdateResponse,
};
use crate::RmId;

/// Callback interface a resource manager registers with the proxy.
pub trait RmCallback: Send + Sync {
    fn recv_update_response(&self, response: UpdateResponse) -> crate::Result<()>;
}

/// Boundary between external resource managers and the core.
///
/// Inbound, it validates and normalizes RM requests and forwards them into
/// the cache's RM-event queue. Outbound, a response loop turns internal
/// events into `UpdateResponse` deliveries on the registered callbacks. The
/// lock guards only the callback table, never any cluster state.
pub struct RmProxy {
    callbacks: RwLock<Map<RmId, Arc<dyn RmCallback>>>,
    handlers: std::sync::OnceLock<EventHandlers>,
    handshake_timeout: Duration,
    /// Serializes registration handshakes end to end; two racing
    /// registrations of one RM id must not both skip the cleanup phase.
    handshake_guard: tokio::sync::Mutex<()>,

    sender: QueueSender<RmProxyEvent>,
    receiver: Mutex<Option<QueueReceiver<RmProxyEvent>>>,
}

impl RmProxy {
    pub fn new(
        queue_capacity: usize,
        overflow_policy: OverflowPolicy,
        handshake_timeout: Duration,
    ) -> Arc<RmProxy> {
        let (sender, receiver) = event_queue("rm-proxy", queue_capacity, overflow_policy);
        Arc::new(RmProxy {
            callbacks: RwLock::new(Map::default()),
            handlers: std::sync::OnceLock::new(),
            handshake_timeout,
            handshake_guard: tokio::sync::Mutex::new(()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Spawn the response loop. May only be called once.
    pub fn start_service(self: &Arc<Self>, handlers: EventHandlers) {
        if self.handlers.set(handlers).is_err() {
            panic!("RM proxy service started twice");
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .expect("RM proxy service started twice");
        tokio::spawn(self.clone().response_loop(receiver));
    }

    /// Sender into the proxy's response loop.
    pub fn event_sender(&self) -> QueueSender<RmProxyEvent> {
        self.sender.clone()
    }

    pub fn is_registered(&self, rm_id: &str) -> bool {
        self.callbacks.read().contains_key(rm_id)
    }

    fn handlers(&self) -> &EventHandlers {
        self.handlers.get().expect("RM proxy service not started")
    }

    /// Two-phase synchronous registration handshake.
    ///
    /// A re-registering RM first has its previous partitions removed through
    /// the scheduler, then the registration itself is acknowledged by the
    /// cache. Both waits are bounded by the handshake timeout. The callback
    /// is installed only after the cache accepted the registration.
    pub async fn register_resource_manager(
        &self,
        request: RegisterRmRequest,
        callback: Arc<dyn RmCallback>,
    ) -> crate::Result<()> {
        let _handshake = self.handshake_guard.lock().await;
        if self.is_registered(&request.rm_id) {
            log::info!(
                "Resource manager {} is re-registering, cleaning up its partitions",
                request.rm_id
            );
            let (ack, done) = Ack::channel();
            self.handlers()
                .scheduler
                .send(SchedulerEvent::RemoveRmPartitions {
                    rm_id: request.rm_id.clone(),
                    result: ack,
                })
                .await?;
            self.await_ack(done, "partition cleanup").await?;
        }

        let rm_id = request.rm_id.clone();
        let (ack, done) = Ack::channel();
        self.handlers()
            .cache_rm
            .send(RmEvent::RegisterRm {
                request,
                result: ack,
            })
            .await?;
        self.await_ack(done, "registration").await?;

        self.callbacks.write().insert(rm_id.clone(), callback);
        log::info!("Resource manager {rm_id} registered");
        Ok(())
    }

    async fn await_ack(&self, done: AckReceiver, phase: &'static str) -> crate::Result<()> {
        match tokio::time::timeout(self.handshake_timeout, done).await {
            Err(_) => Err(CoreError::Timeout(phase)),
            Ok(Err(_)) => Err(CoreError::GenericError(format!(
                "{phase} completion channel dropped"
            ))),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(CoreError::GenericError(reason)),
        }
    }

    /// Forward one RM update into the cache. Returns once the request is
    /// enqueued; validation outcomes arrive later through the callback.
    pub async fn update(&self, mut request: UpdateRequest) -> crate::Result<()> {
        if !self.is_registered(&request.rm_id) {
            return Err(CoreError::GenericError(format!(
                "resource manager {} is not registered",
                request.rm_id
            )));
        }
        normalize_request(&mut request);
        self.handlers().cache_rm.send(RmEvent::Update(request)).await
    }

    /// Trigger a configuration reload for one RM. Fire-and-forget: the
    /// eventual outcome is only logged.
    pub fn reload_configuration(&self, rm_id: RmId) {
        let (ack, done) = Ack::channel();
        let sender = self.handlers().cache_rm.clone();
        tokio::spawn(async move {
            if let Err(e) = sender
                .send(RmEvent::ConfigUpdate {
                    rm_id: rm_id.clone(),
                    result: ack,
                })
                .await
            {
                log::error!("Cannot request configuration reload for RM {rm_id}: {e}");
                return;
            }
            match done.await {
                Ok(Ok(())) => log::info!("Configuration reload for RM {rm_id} finished"),
                Ok(Err(reason)) => {
                    log::error!("Configuration reload for RM {rm_id} failed: {reason}")
                }
                Err(_) => log::error!(
                    "Configuration reload for RM {rm_id}: completion channel dropped"
                ),
            }
        });
    }

    async fn response_loop(self: Arc<Self>, mut events: QueueReceiver<RmProxyEvent>) {
        while let Some(event) = events.recv().await {
            if let Some((rm_id, response)) = build_response(event) {
                self.deliver(&rm_id, response);
            }
        }
        log::debug!("RM response loop finished");
    }

    fn deliver(&self, rm_id: &str, response: UpdateResponse) {
        let callback = self.callbacks.read().get(rm_id).cloned();
        match callback {
            Some(callback) => {
                if let Err(e) = callback.recv_update_response(response) {
                    log::error!("Failed to deliver response to RM {rm_id}: {e}");
                }
            }
            // Responses are only produced for registered RMs; an unknown id
            // here is a programming error.
            None => panic!("Received response for unknown resource manager {rm_id}"),
        }
    }
}

/// Translate an internal event into a partial response; empty deliveries are
/// suppressed.
fn build_response(event: RmProxyEvent) -> Option<(RmId, UpdateResponse)> {
    match event {
        RmProxyEvent::NewAllocations { rm_id, allocations } => {
            if allocations.is_empty() {
                return None;
            }
            Some((
                rm_id,
                UpdateResponse {
                    new_allocations: allocations,
                    ..Default::default()
                },
            ))
        }
        RmProxyEvent::ApplicationUpdate {
            rm_id,
            accepted_applications,
            rejected_applications,
        } => {
            if accepted_applications.is_empty() && rejected_applications.is_empty() {
                return None;
            }
            Some((
                rm_id,
                UpdateResponse {
                    accepted_applications,
                    rejected_applications,
                    ..Default::default()
                },
            ))
        }
        RmProxyEvent::NodeUpdate {
            rm_id,
            accepted_nodes,
            rejected_nodes,
        } => {
            if accepted_nodes.is_empty() && rejected_nodes.is_empty() {
                return None;
            }
            Some((
                rm_id,
                UpdateResponse {
                    accepted_nodes,
                    rejected_nodes,
                    ..Default::default()
                },
            ))
        }
        RmProxyEvent::ReleasedAllocations {
            rm_id,
            released_allocations,
        } => {
            if released_allocations.is_empty() {
                return None;
            }
            Some((
                rm_id,
                UpdateResponse {
                    released_allocations,
                    ..Default::default()
                },
            ))
        }
        RmProxyEvent::RejectedAllocationAsks {
            rm_id,
            rejected_allocation_asks,
        } => {
            if rejected_allocation_asks.is_empty() {
                return None;
            }
            Some((
                rm_id,
                UpdateResponse {
                    rejected_allocation_asks,
                    ..Default::default()
                },
            ))
        }
    }
}

/// Qualify every RM-local partition name in the request with the RM id.
fn normalize_request(request: &mut UpdateRequest) {
    let rm_id = request.rm_id.clone();
    for app in &mut request.new_applications {
        app.partition_name = normalized_partition_name(&app.partition_name, &rm_id);
    }
    for app in &mut request.remove_applications {
        app.partition_name = normalized_partition_name(&app.partition_name, &rm_id);
    }
    for ask in &mut request.asks {
        ask.partition_name = normalized_partition_name(&ask.partition_name, &rm_id);
    }
    if let Some(releases) = &mut request.releases {
        for release in &mut releases.allocations_to_release {
            release.partition_name = normalized_partition_name(&release.partition_name, &rm_id);
        }
        for release in &mut releases.asks_to_release {
            release.partition_name = normalized_partition_name(&release.partition_name, &rm_id);
        }
    }
    for node in &mut request.new_schedulable_nodes {
        normalize_node(node, &rm_id);
    }
    for node in &mut request.updated_nodes {
        normalize_node(node, &rm_id);
    }
}

fn normalize_node(node: &mut NodeDescription, rm_id: &str) {
    if let Some(partition) = node.attributes.get_mut(NODE_PARTITION_ATTRIBUTE) {
        *partition = normalized_partition_name(partition, rm_id);
    }
    for allocation in &mut node.existing_allocations {
        allocation.partition_name = normalized_partition_name(&allocation.partition_name, rm_id);
    }
}
