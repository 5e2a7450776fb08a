use std::sync::Arc;
use std::time::Duration;

use crate::cache::cluster::ClusterInfo;
use crate::common::error::CoreError;
use crate::common::eventqueue::{OverflowPolicy, event_queue};
use crate::common::resources::{MEMORY, Resource};
use crate::events::EventHandlers;
use crate::proxy::RmProxy;
use crate::config::PartitionConfig;
use crate::events::{AllocationProposal, AllocationProposalBundle, CacheEvent};
use crate::messages::{
    Allocation, RegisterRmRequest, ReleaseAllocation, RemoveApplicationRequest, TerminationType,
    UpdateRequest,
};
use crate::tests::utils::{
    RecordedSchedulerEvent, RecordingCallback, TestSystem, ask, new_app, node_description,
    partition_config, scheduler_config, unique_policy_group, write_policy,
};

async fn register(
    system: &TestSystem,
    rm_id: &str,
    partitions: Vec<PartitionConfig>,
) -> (Arc<RecordingCallback>, String) {
    let policy_group = unique_policy_group("policy");
    write_policy(&policy_group, &scheduler_config(partitions));
    let callback = RecordingCallback::new();
    system
        .proxy
        .register_resource_manager(
            RegisterRmRequest {
                rm_id: rm_id.to_string(),
                policy_group: policy_group.clone(),
            },
            callback.clone(),
        )
        .await
        .unwrap();
    (callback, policy_group)
}

fn proposal(application_id: &str, node_id: &str, memory: i64) -> AllocationProposal {
    AllocationProposal {
        allocation_key: format!("{application_id}-ask"),
        application_id: application_id.to_string(),
        partition_name: "[rm1]default".to_string(),
        queue_name: "root.default".to_string(),
        node_id: node_id.to_string(),
        resource: Resource::from_pairs([(MEMORY, memory)]),
    }
}

#[tokio::test]
async fn registration_loads_partitions_from_config() {
    let system = TestSystem::start();
    register(
        &system,
        "rm1",
        vec![partition_config("default"), partition_config("gpu")],
    )
    .await;

    assert!(system.cluster.get_partition("[rm1]default").is_some());
    assert!(system.cluster.get_partition("[rm1]gpu").is_some());
    assert!(system.cluster.get_partition("[rm1]missing").is_none());

    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(partition.get_queue("root.default").unwrap().is_leaf);
    assert!(!partition.get_queue("root").unwrap().is_leaf);
}

#[tokio::test]
async fn registration_fails_for_missing_config() {
    let system = TestSystem::start();
    let callback = RecordingCallback::new();
    let result = system
        .proxy
        .register_resource_manager(
            RegisterRmRequest {
                rm_id: "rm1".to_string(),
                policy_group: unique_policy_group("nonexistent"),
            },
            callback,
        )
        .await;
    assert!(result.is_err());
    assert!(!system.proxy.is_registered("rm1"));
}

#[tokio::test]
async fn update_requires_registration() {
    let system = TestSystem::start();
    let request = UpdateRequest {
        rm_id: "ghost".to_string(),
        ..Default::default()
    };
    let err = system.proxy.update(request).await.unwrap_err();
    assert!(err.to_string().contains("not registered"));
}

#[tokio::test]
async fn application_admission_outcomes_reach_the_rm() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_applications: vec![
                new_app("app1", "", "root.default"),
                new_app("app2", "", "root.missing"),
                new_app("app3", "", "root"),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

    let response = callback
        .wait_for("application outcomes", |r| !r.accepted_applications.is_empty())
        .await;
    assert_eq!(response.accepted_applications.len(), 1);
    assert_eq!(response.accepted_applications[0].application_id, "app1");
    assert_eq!(response.rejected_applications.len(), 2);

    system
        .wait_scheduler_event("added applications", |event| {
            matches!(event, RecordedSchedulerEvent::ApplicationsUpdate { added, .. }
                if added == &["app1".to_string()])
        })
        .await;

    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(partition.get_application("app1").is_some());
    assert!(partition.get_application("app2").is_none());

    assert_eq!(system.cluster.metrics().applications_added(), 1);
    assert_eq!(system.cluster.metrics().applications_rejected(), 2);
}

#[tokio::test]
async fn asks_are_validated_before_reaching_the_scheduler() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_applications: vec![new_app("app1", "", "root.default")],
            asks: vec![ask("good", "app1", "", 100), ask("bad", "ghost", "", 100)],
            ..Default::default()
        })
        .await
        .unwrap();

    let response = callback
        .wait_for("rejected asks", |r| !r.rejected_allocation_asks.is_empty())
        .await;
    assert_eq!(response.rejected_allocation_asks.len(), 1);
    assert_eq!(response.rejected_allocation_asks[0].allocation_key, "bad");

    system
        .wait_scheduler_event("forwarded asks", |event| {
            matches!(event, RecordedSchedulerEvent::AllocationUpdates { new_asks, .. }
                if new_asks.len() == 1 && new_asks[0].allocation_key == "good")
        })
        .await;
}

#[tokio::test]
async fn committed_proposal_is_reported_as_allocation() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_applications: vec![new_app("app1", "", "root.default")],
            new_schedulable_nodes: vec![node_description("n1", "", 1024)],
            ..Default::default()
        })
        .await
        .unwrap();
    callback
        .wait_for("node accepted", |r| !r.accepted_nodes.is_empty())
        .await;
    assert_eq!(system.cluster.metrics().active_nodes(), 1);
    assert_eq!(system.cluster.metrics().failed_nodes(), 0);

    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::AllocationProposals(AllocationProposalBundle {
            allocation_proposals: vec![proposal("app1", "n1", 512)],
            release_proposals: Vec::new(),
        }))
        .await
        .unwrap();

    let response = callback
        .wait_for("new allocation", |r| !r.new_allocations.is_empty())
        .await;
    let allocation = &response.new_allocations[0];
    assert_eq!(allocation.application_id, "app1");
    assert_eq!(allocation.node_id, "n1");
    assert!(!allocation.uuid.is_empty());

    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert_eq!(
        partition
            .get_application("app1")
            .unwrap()
            .allocated_resource()
            .get(MEMORY),
        512
    );
    assert_eq!(system.cluster.metrics().scheduled_allocations(), 1);
}

#[tokio::test]
async fn failed_proposal_bounces_back_to_the_scheduler() {
    let system = TestSystem::start();
    register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::AllocationProposals(AllocationProposalBundle {
            allocation_proposals: vec![proposal("ghost", "nowhere", 1)],
            release_proposals: Vec::new(),
        }))
        .await
        .unwrap();

    system
        .wait_scheduler_event("rejected proposal", |event| {
            matches!(event, RecordedSchedulerEvent::AllocationUpdates { rejected_allocations, .. }
                if rejected_allocations.len() == 1
                    && rejected_allocations[0].allocation_key == "ghost-ask")
        })
        .await;
    assert_eq!(system.cluster.metrics().scheduled_allocations(), 0);
}

#[tokio::test]
async fn released_allocations_are_reported_to_the_rm() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_applications: vec![new_app("app1", "", "root.default")],
            new_schedulable_nodes: vec![node_description("n1", "", 1024)],
            ..Default::default()
        })
        .await
        .unwrap();
    callback
        .wait_for("node accepted", |r| !r.accepted_nodes.is_empty())
        .await;
    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::AllocationProposals(AllocationProposalBundle {
            allocation_proposals: vec![proposal("app1", "n1", 512)],
            release_proposals: Vec::new(),
        }))
        .await
        .unwrap();
    let response = callback
        .wait_for("new allocation", |r| !r.new_allocations.is_empty())
        .await;
    let uuid = response.new_allocations[0].uuid.clone();

    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::ReleaseAllocations(vec![ReleaseAllocation {
            uuid: Some(uuid.clone()),
            application_id: "app1".to_string(),
            partition_name: "[rm1]default".to_string(),
            message: "preempted".to_string(),
            termination_type: TerminationType::PreemptedByScheduler,
        }]))
        .await
        .unwrap();

    let response = callback
        .wait_for("released allocation", |r| !r.released_allocations.is_empty())
        .await;
    assert_eq!(response.released_allocations[0].uuid, uuid);
    assert_eq!(
        response.released_allocations[0].termination_type,
        TerminationType::PreemptedByScheduler
    );

    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(partition.get_node("n1").unwrap().allocated_resource().is_zero());
}

#[tokio::test]
async fn removed_application_releases_its_allocations() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_applications: vec![new_app("app1", "", "root.default")],
            new_schedulable_nodes: vec![node_description("n1", "", 1024)],
            ..Default::default()
        })
        .await
        .unwrap();
    callback
        .wait_for("node accepted", |r| !r.accepted_nodes.is_empty())
        .await;
    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::AllocationProposals(AllocationProposalBundle {
            allocation_proposals: vec![proposal("app1", "n1", 512)],
            release_proposals: Vec::new(),
        }))
        .await
        .unwrap();
    callback
        .wait_for("new allocation", |r| !r.new_allocations.is_empty())
        .await;

    // The RM asks for removal; the cache forwards it to the scheduler, which
    // cleans up and reports back with a removed-application event.
    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            remove_applications: vec![RemoveApplicationRequest {
                application_id: "app1".to_string(),
                partition_name: String::new(),
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    system
        .wait_scheduler_event("removal forwarded", |event| {
            matches!(event, RecordedSchedulerEvent::ApplicationsUpdate { removed, .. }
                if removed == &["app1".to_string()])
        })
        .await;

    system
        .cluster
        .scheduler_event_sender()
        .send(CacheEvent::RemovedApplication {
            application_id: "app1".to_string(),
            partition_name: "[rm1]default".to_string(),
        })
        .await
        .unwrap();

    let response = callback
        .wait_for("released on removal", |r| !r.released_allocations.is_empty())
        .await;
    assert_eq!(
        response.released_allocations[0].termination_type,
        TerminationType::StoppedByRm
    );
    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(partition.get_application("app1").is_none());
    assert!(partition.get_node("n1").unwrap().allocated_resource().is_zero());
}

#[tokio::test]
async fn node_with_bad_existing_allocations_is_rolled_back() {
    let system = TestSystem::start();
    let (callback, _) = register(&system, "rm1", vec![partition_config("default")]).await;

    let mut description = node_description("n1", "", 1024);
    description.existing_allocations.push(Allocation {
        uuid: "recovered".to_string(),
        allocation_key: "k1".to_string(),
        application_id: "ghost".to_string(),
        partition_name: "default".to_string(),
        queue_name: "root.default".to_string(),
        node_id: "n1".to_string(),
        resource: Resource::from_pairs([(MEMORY, 100)]),
    });
    system
        .proxy
        .update(UpdateRequest {
            rm_id: "rm1".to_string(),
            new_schedulable_nodes: vec![description],
            ..Default::default()
        })
        .await
        .unwrap();

    let response = callback
        .wait_for("node rejected", |r| !r.rejected_nodes.is_empty())
        .await;
    assert_eq!(response.rejected_nodes[0].node_id, "n1");
    assert!(response.accepted_nodes.is_empty());

    let partition = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(partition.get_node("n1").is_none());
    assert!(partition.total_resource().is_zero());
    assert_eq!(system.cluster.metrics().failed_nodes(), 1);
    assert_eq!(system.cluster.metrics().active_nodes(), 0);
}

#[tokio::test]
async fn concurrent_registrations_of_one_rm_are_serialized() {
    let system = TestSystem::start();
    let policy_group = unique_policy_group("policy");
    write_policy(
        &policy_group,
        &scheduler_config(vec![partition_config("default")]),
    );

    let first = RecordingCallback::new();
    let second = RecordingCallback::new();
    let request = |policy_group: String| RegisterRmRequest {
        rm_id: "rm1".to_string(),
        policy_group,
    };
    // Both handshakes run at once; the second must observe the first as
    // registered and go through the cleanup phase instead of racing it.
    let (first_result, second_result) = tokio::join!(
        system
            .proxy
            .register_resource_manager(request(policy_group.clone()), first),
        system
            .proxy
            .register_resource_manager(request(policy_group.clone()), second),
    );
    first_result.unwrap();
    second_result.unwrap();

    assert!(system.proxy.is_registered("rm1"));
    assert!(system.cluster.get_partition("[rm1]default").is_some());
}

#[tokio::test]
async fn registration_times_out_without_a_scheduler() {
    let cluster = ClusterInfo::new(64, OverflowPolicy::Block);
    let proxy = RmProxy::new(64, OverflowPolicy::Block, Duration::from_millis(200));
    // The scheduler queue exists but nothing consumes it, so the
    // registration acknowledgement never arrives.
    let (scheduler_sender, _scheduler_receiver) =
        event_queue("idle-scheduler", 64, OverflowPolicy::Block);
    let handlers = EventHandlers {
        cache_rm: cluster.rm_event_sender(),
        cache_scheduler: cluster.scheduler_event_sender(),
        scheduler: scheduler_sender,
        rm_proxy: proxy.event_sender(),
    };
    cluster.start_service(handlers.clone());
    proxy.start_service(handlers);

    let policy_group = unique_policy_group("timeout");
    write_policy(
        &policy_group,
        &scheduler_config(vec![partition_config("default")]),
    );
    let err = proxy
        .register_resource_manager(
            RegisterRmRequest {
                rm_id: "rm1".to_string(),
                policy_group,
            },
            RecordingCallback::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
    assert!(!proxy.is_registered("rm1"));
}

#[tokio::test]
async fn re_registration_replaces_rm_partitions() {
    let system = TestSystem::start();
    register(&system, "rm1", vec![partition_config("default")]).await;
    let partition_before = system.cluster.get_partition("[rm1]default").unwrap();

    register(
        &system,
        "rm1",
        vec![partition_config("default"), partition_config("gpu")],
    )
    .await;

    let partition_after = system.cluster.get_partition("[rm1]default").unwrap();
    assert!(!Arc::ptr_eq(&partition_before, &partition_after));
    assert!(system.cluster.get_partition("[rm1]gpu").is_some());
}

#[tokio::test]
async fn reload_follows_the_latest_policy_group() {
    let system = TestSystem::start();
    register(&system, "rm1", vec![partition_config("default")]).await;
    // Create a watcher bound to the first policy group's config file.
    system.proxy.reload_configuration("rm1".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Re-register under a different policy group, then change that group's
    // file; the reload must pick up the new file, not the old one.
    let (_, second_group) = register(&system, "rm1", vec![partition_config("default")]).await;
    write_policy(
        &second_group,
        &scheduler_config(vec![partition_config("default"), partition_config("gpu")]),
    );
    system.proxy.reload_configuration("rm1".to_string());

    for _ in 0..600 {
        if system.cluster.get_partition("[rm1]gpu").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(system.cluster.get_partition("[rm1]gpu").is_some());
}

#[tokio::test]
async fn configuration_reload_diffs_partitions() {
    let system = TestSystem::start();
    let (_, policy_group) = register(
        &system,
        "rm1",
        vec![partition_config("default"), partition_config("extra")],
    )
    .await;
    assert!(system.cluster.get_partition("[rm1]extra").is_some());

    write_policy(
        &policy_group,
        &scheduler_config(vec![partition_config("default"), partition_config("gpu")]),
    );
    system.proxy.reload_configuration("rm1".to_string());

    for _ in 0..600 {
        if system.cluster.get_partition("[rm1]gpu").is_some()
            && system.cluster.get_partition("[rm1]extra").is_none()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(system.cluster.get_partition("[rm1]gpu").is_some());
    assert!(system.cluster.get_partition("[rm1]extra").is_none());
    // Live partitions survive a reload untouched.
    assert!(system.cluster.get_partition("[rm1]default").is_some());
}
