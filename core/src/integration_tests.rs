//! End-to-end exercises of façade + executor + store + fan-out together,
//! covering the concrete scenarios in spec.md §8.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ironhold_provider_fake::{Capability, FakeProvider};

use crate::error::CoreError;
use crate::executor::Executor;
use crate::facade::{Facade, WatchFilter};
use crate::fanout::{EventBus, LogBus};
use crate::model::{ClusterRef, MachineId, MachineSpec, OperationPhase, Phase, RequestId};
use crate::plan::PlanRegistry;
use crate::store::Store;

fn harness() -> (Facade, FakeProvider) {
    let store = Store::new();
    let events = EventBus::new();
    let logs = LogBus::new();
    let plans = Arc::new(PlanRegistry::with_builtins());
    let provider = FakeProvider::new();
    let executor = Arc::new(Executor::new(store.clone(), events.clone(), logs.clone(), plans, Arc::new(provider.clone())));
    (Facade::new(store, events, logs, executor), provider)
}

async fn wait_for_terminal(facade: &Facade, op_id: crate::model::OperationId) -> crate::model::Operation {
    for _ in 0..200 {
        let op = facade.get_operation(op_id).await.unwrap();
        if op.phase.is_terminal() {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {op_id} did not reach a terminal phase in time");
}

fn spec_with_cluster() -> MachineSpec {
    MachineSpec {
        provider: "fake".into(),
        mac_addresses: vec!["aa:bb:cc:dd:ee:ff".into()],
        ssh_endpoint: "10.0.0.5:22".into(),
        bmc_endpoint: None,
        target_cluster: Some(ClusterRef { cluster_id: "cluster-a".into() }),
        labels: Default::default(),
    }
}

#[tokio::test]
async fn scenario_reimage_happy_path() {
    let (facade, _provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();

    facade.enter_maintenance(machine_id, RequestId("enter".into())).await.unwrap();
    let view = facade.get_machine(machine_id).await.unwrap();
    assert_eq!(view.machine.status.phase, Phase::Maintenance);

    let op = facade.reimage_machine(machine_id, RequestId("R1".into())).await.unwrap();
    let op = wait_for_terminal(&facade, op.id).await;

    assert_eq!(op.phase, OperationPhase::Succeeded);
    assert_eq!(op.steps.len(), 5);

    let view = facade.get_machine(machine_id).await.unwrap();
    assert_eq!(view.machine.status.phase, Phase::InService);
    assert!(view.machine.status.condition_is(crate::model::ConditionType::Provisioned));
    assert!(view.machine.status.condition_is(crate::model::ConditionType::InCustomerCluster));
    assert!(view.machine.status.active_operation_id.is_none());
    assert_eq!(view.effective_state, crate::model::EffectiveState::Idle);
}

#[tokio::test]
async fn scenario_reimage_phase_guard_rejects_on_ready_machine() {
    let (facade, _provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();
    facade
        .update_machine(machine_id, spec_with_cluster())
        .await
        .unwrap();
    // Force the machine to READY without going through maintenance, as a
    // test fixture would for a pre-provisioned node.
    facade.enter_maintenance(machine_id, RequestId("e1".into())).await.unwrap();
    let op = facade.exit_maintenance(machine_id, RequestId("x1".into())).await.unwrap();
    wait_for_terminal(&facade, op.id).await;

    let result = facade.reimage_machine(machine_id, RequestId("R2".into())).await;
    assert!(matches!(result, Err(CoreError::FailedPrecondition(_))));

    let ops = facade.list_operations(Some(machine_id)).await;
    assert!(!ops.iter().any(|op| op.request_id == RequestId("R2".into())));
}

#[tokio::test]
async fn scenario_idempotent_replay_returns_same_operation_id() {
    let (facade, _provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();
    facade.enter_maintenance(machine_id, RequestId("enter".into())).await.unwrap();

    let rid = RequestId("dup".into());
    let first = facade.reboot_machine(machine_id, rid.clone()).await.unwrap();
    let second = facade.reboot_machine(machine_id, rid).await.unwrap();
    assert_eq!(first.id, second.id);

    wait_for_terminal(&facade, first.id).await;
    let ops = facade.list_operations(Some(machine_id)).await;
    assert_eq!(ops.iter().filter(|op| op.r#type == crate::model::OperationType::Reboot).count(), 1);
}

#[tokio::test]
async fn scenario_cancellation_during_a_running_step() {
    let (facade, provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();
    facade.enter_maintenance(machine_id, RequestId("enter".into())).await.unwrap();

    provider.delay(Capability::RepaveImage, Duration::from_millis(300)).await;
    let op = facade.reimage_machine(machine_id, RequestId("R3".into())).await.unwrap();

    // Give the executor time to reach the repave-image step.
    tokio::time::sleep(Duration::from_millis(120)).await;
    facade.cancel_operation(op.id).await.unwrap();

    let op = wait_for_terminal(&facade, op.id).await;
    assert_eq!(op.phase, OperationPhase::Canceled);

    let view = facade.get_machine(machine_id).await.unwrap();
    assert_eq!(view.machine.status.phase, Phase::Maintenance);
    assert!(view.machine.status.condition_is(crate::model::ConditionType::OperationCanceled));
    assert!(!view.machine.status.condition_is(crate::model::ConditionType::NeedsIntervention));
    assert!(view.machine.status.active_operation_id.is_none());
}

#[tokio::test]
async fn scenario_terminal_failure_exhausts_retries() {
    let (facade, provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();
    facade.enter_maintenance(machine_id, RequestId("enter".into())).await.unwrap();

    provider.fail_next(Capability::JoinNode, u32::MAX, true).await;
    let op = facade.reimage_machine(machine_id, RequestId("R4".into())).await.unwrap();
    let op = wait_for_terminal(&facade, op.id).await;

    assert_eq!(op.phase, OperationPhase::Failed);
    assert_eq!(op.error.as_ref().unwrap().code, "EXECUTION_FAILED");

    let view = facade.get_machine(machine_id).await.unwrap();
    assert_eq!(view.machine.status.phase, Phase::Maintenance);
    assert!(view.machine.status.condition_is(crate::model::ConditionType::NeedsIntervention));
    assert_eq!(view.effective_state, crate::model::EffectiveState::Attention);
}

#[tokio::test]
async fn scenario_watch_fan_out_is_scoped_per_machine() {
    let (facade, provider) = harness();
    let machine_a = MachineId::new();
    let machine_b = MachineId::new();
    facade.register_machine(machine_a, spec_with_cluster()).await.unwrap();
    facade.register_machine(machine_b, spec_with_cluster()).await.unwrap();
    facade.enter_maintenance(machine_a, RequestId("ea".into())).await.unwrap();
    facade.enter_maintenance(machine_b, RequestId("eb".into())).await.unwrap();

    // Slow the step down so both watchers can subscribe before the run's
    // single event has been and gone.
    provider.delay(Capability::Reboot, Duration::from_millis(250)).await;
    let op_a = facade.reboot_machine(machine_a, RequestId("ra".into())).await.unwrap();

    let filter = WatchFilter::parse(&format!("machine_id={machine_a}")).unwrap();
    let mut watcher1 = Box::pin(facade.watch_operations(filter.clone()).await.unwrap());
    let mut watcher2 = Box::pin(facade.watch_operations(filter).await.unwrap());

    let _op_b = facade.reboot_machine(machine_b, RequestId("rb".into())).await.unwrap();

    let e1 = tokio::time::timeout(Duration::from_secs(2), watcher1.next()).await.unwrap().unwrap();
    let e2 = tokio::time::timeout(Duration::from_secs(2), watcher2.next()).await.unwrap().unwrap();
    assert_eq!(e1.snapshot.machine_id, machine_a);
    assert_eq!(e2.snapshot.machine_id, machine_a);
    assert_eq!(e1.snapshot.id, op_a.id);
}

#[tokio::test]
async fn scenario_watch_sees_operations_admitted_after_subscribing() {
    let (facade, _provider) = harness();
    let machine_id = MachineId::new();
    facade.register_machine(machine_id, spec_with_cluster()).await.unwrap();
    facade.enter_maintenance(machine_id, RequestId("enter".into())).await.unwrap();

    let filter = WatchFilter::parse(&format!("machine_id={machine_id}")).unwrap();
    let mut watcher = Box::pin(facade.watch_operations(filter).await.unwrap());

    // The operation does not exist yet when the watch begins; a long-lived
    // watch must still observe it once it is admitted.
    let op = facade.reboot_machine(machine_id, RequestId("later".into())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), watcher.next()).await.unwrap().unwrap();
    assert_eq!(event.snapshot.id, op.id);
}

#[tokio::test]
async fn watch_filter_rejects_unknown_keys() {
    assert!(matches!(WatchFilter::parse("bogus=1"), Err(CoreError::InvalidArgument(_))));
    assert!(matches!(WatchFilter::parse(""), Ok(WatchFilter::Unfiltered)));
}
