//! Inbound operations and admission/idempotency rules (spec.md §4.5).
//!
//! Pure domain logic with no RPC dependency of its own — the `proto` crate
//! binds its `ApiService` struct to the generated `OperationService` trait
//! and delegates every method here, the same way `storage/src/replication.rs`
//! keeps `ShardEngine` free of its `tonic::Status` wrapping and lets
//! `ReplicationServiceImpl` do the glue.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{CoreError, CoreResult};
use crate::executor::Executor;
use crate::fanout::{EventBus, LogBus};
use crate::lifecycle::{compute_effective_state, set_condition};
use crate::model::{
    Condition, ConditionType, EffectiveState, LogChunk, Machine, MachineId, MachineSpec, Operation,
    OperationId, OperationType, Phase, RequestId, RunEvent,
};
use crate::store::Store;

/// A machine snapshot with its effective state computed for this read, since
/// effective state is never stored (spec.md §3).
#[derive(Debug, Clone)]
pub struct MachineView {
    pub machine: Machine,
    pub effective_state: EffectiveState,
}

/// Parsed form of the `machine_id=<id>` watch filter language (spec.md §6).
/// Unknown filter keys fail at parse time rather than silently matching
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WatchFilter {
    #[default]
    Unfiltered,
    MachineId(MachineId),
}

impl WatchFilter {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.trim().is_empty() {
            return Ok(WatchFilter::Unfiltered);
        }
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| CoreError::InvalidArgument(format!("malformed filter expression: {raw}")))?;
        match key.trim() {
            "machine_id" => {
                let id = value
                    .trim()
                    .parse::<uuid::Uuid>()
                    .map_err(|_| CoreError::InvalidArgument(format!("not a valid machine_id: {value}")))?;
                Ok(WatchFilter::MachineId(MachineId(id)))
            }
            other => Err(CoreError::InvalidArgument(format!("unknown filter key: {other}"))),
        }
    }

    fn matches(&self, event: &RunEvent) -> bool {
        match self {
            WatchFilter::Unfiltered => true,
            WatchFilter::MachineId(id) => event.snapshot.machine_id == *id,
        }
    }
}

#[derive(Clone)]
pub struct Facade {
    store: Store,
    events: EventBus,
    logs: LogBus,
    executor: Arc<Executor>,
}

impl Facade {
    pub fn new(store: Store, events: EventBus, logs: LogBus, executor: Arc<Executor>) -> Self {
        Self { store, events, logs, executor }
    }

    /// Upsert semantics: registering an already-known machine id updates its
    /// spec in place and is not an error, matching spec.md's
    /// "idempotent by machine_id" requirement for `RegisterMachine`.
    pub async fn register_machine(&self, machine_id: MachineId, spec: MachineSpec) -> CoreResult<MachineView> {
        match self.store.get_machine(machine_id).await {
            Ok(_) => {
                let machine = self.store.update_machine(machine_id, |m| m.spec = spec).await?;
                self.view(machine).await
            }
            Err(CoreError::MachineNotFound(_)) => {
                let machine = Machine { id: machine_id, spec, status: Default::default() };
                self.store.insert_machine(machine.clone()).await?;
                self.view(machine).await
            }
            Err(other) => Err(other),
        }
    }

    pub async fn get_machine(&self, machine_id: MachineId) -> CoreResult<MachineView> {
        let machine = self.store.get_machine(machine_id).await?;
        self.view(machine).await
    }

    pub async fn list_machines(&self) -> CoreResult<Vec<MachineView>> {
        let mut views = Vec::new();
        for machine in self.store.list_machines().await {
            views.push(self.view(machine).await?);
        }
        Ok(views)
    }

    /// Status is server-owned; only spec and labels are accepted (spec.md
    /// §4.5). Labels live inside `spec`, so this simply replaces the spec.
    pub async fn update_machine(&self, machine_id: MachineId, spec: MachineSpec) -> CoreResult<MachineView> {
        let machine = self.store.update_machine(machine_id, |m| m.spec = spec).await?;
        self.view(machine).await
    }

    pub async fn reboot_machine(&self, machine_id: MachineId, request_id: RequestId) -> CoreResult<Operation> {
        self.create_operation(machine_id, request_id, OperationType::Reboot, &[Phase::Ready, Phase::Maintenance])
            .await
    }

    pub async fn reimage_machine(&self, machine_id: MachineId, request_id: RequestId) -> CoreResult<Operation> {
        self.create_operation(machine_id, request_id, OperationType::Reimage, &[Phase::Maintenance]).await
    }

    /// Already-`MAINTENANCE` is treated as the idempotent case per spec.md:
    /// rather than fail the precondition, route through the same
    /// request-id-keyed creation path so a duplicate call returns the
    /// previously recorded operation instead of erroring.
    pub async fn enter_maintenance(&self, machine_id: MachineId, request_id: RequestId) -> CoreResult<Operation> {
        self.create_operation(
            machine_id,
            request_id,
            OperationType::EnterMaintenance,
            &[Phase::Ready, Phase::Maintenance],
        )
        .await
    }

    pub async fn exit_maintenance(&self, machine_id: MachineId, request_id: RequestId) -> CoreResult<Operation> {
        self.create_operation(machine_id, request_id, OperationType::ExitMaintenance, &[Phase::Maintenance])
            .await
    }

    pub async fn rma_machine(&self, machine_id: MachineId, request_id: RequestId) -> CoreResult<Operation> {
        self.create_operation(
            machine_id,
            request_id,
            OperationType::Rma,
            &[Phase::Ready, Phase::Maintenance, Phase::InService],
        )
        .await
    }

    async fn create_operation(
        &self,
        machine_id: MachineId,
        request_id: RequestId,
        op_type: OperationType,
        allowed_phases: &[Phase],
    ) -> CoreResult<Operation> {
        let machine = self.store.get_machine(machine_id).await?;

        // Idempotency check happens before the phase precondition: a replay
        // must return the recorded operation "regardless of its current
        // phase" (spec.md §4.5 rule 3).
        if let Some(existing) = self.store.find_by_request_id(machine_id, &request_id).await {
            return Ok(existing);
        }

        if !allowed_phases.contains(&machine.status.phase) {
            return Err(CoreError::FailedPrecondition(format!(
                "{op_type:?} requires phase in {allowed_phases:?}, machine is {}",
                machine.status.phase
            )));
        }

        let op = Operation::new(OperationId::new(), machine_id, op_type, request_id);
        let op = self.store.insert_operation(op).await?;

        // A concurrent caller with the identical (machine_id, request_id)
        // can win the insert_operation race and already hold the active-op
        // slot for this exact operation by the time we get here; that is
        // still our operation, not a conflict, so only a *different*
        // existing id is a genuine single-inflight violation.
        match self.store.try_set_active_operation(machine_id, op.id).await {
            Ok(()) => {
                self.executor.start_operation(op.id).await;
                Ok(op)
            }
            Err(CoreError::ResourceExhausted(_, existing)) if existing == op.id => {
                self.executor.start_operation(op.id).await;
                Ok(op)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn cancel_operation(&self, operation_id: OperationId) -> CoreResult<Operation> {
        let op = self.store.get_operation(operation_id).await?;
        if op.phase.is_terminal() {
            return Ok(op);
        }
        self.executor.cancel_operation(operation_id).await;
        self.store.get_operation(operation_id).await
    }

    pub async fn get_operation(&self, operation_id: OperationId) -> CoreResult<Operation> {
        self.store.get_operation(operation_id).await
    }

    pub async fn list_operations(&self, machine_id: Option<MachineId>) -> Vec<Operation> {
        match machine_id {
            Some(id) => self.store.list_operations_for_machine(id).await,
            None => {
                let machines = self.store.list_machines().await;
                let mut all = Vec::new();
                for m in machines {
                    all.extend(self.store.list_operations_for_machine(m.id).await);
                }
                all
            }
        }
    }

    /// Subscribes to operation events process-wide, filtered per
    /// `WatchFilter`. The subscription is long-lived: it is taken out on the
    /// bus's global stream before any replay, so operations admitted after
    /// the call (not just ones already running) are delivered too.
    pub async fn watch_operations(&self, filter: WatchFilter) -> CoreResult<impl futures::Stream<Item = RunEvent>> {
        if let WatchFilter::MachineId(id) = &filter {
            self.store.get_machine(*id).await?;
        }

        let rx = self.events.subscribe_all();
        Ok(filtered_stream(rx, filter))
    }

    pub async fn stream_operation_logs(&self, operation_id: OperationId) -> CoreResult<impl futures::Stream<Item = LogChunk>> {
        self.store.get_operation(operation_id).await?;
        let rx = self.logs.subscribe(operation_id).await;
        Ok(lossy_stream(rx))
    }

    async fn view(&self, machine: Machine) -> CoreResult<MachineView> {
        let active_op = match machine.status.active_operation_id {
            Some(id) => self.store.get_operation(id).await.ok(),
            None => None,
        };
        let effective_state = compute_effective_state(&machine.status, active_op.as_ref());
        Ok(MachineView { machine, effective_state })
    }
}

/// Sets `NeedsIntervention=false` on a machine, used by operator-facing
/// "acknowledge and clear" tooling outside the generated RPC surface.
pub fn clear_needs_intervention(machine: &mut Machine, reason: &str, message: &str) {
    set_condition(&mut machine.status, ConditionType::NeedsIntervention, false, reason, message);
}

pub fn conditions(machine: &Machine) -> &[Condition] {
    &machine.status.conditions
}

fn filtered_stream(rx: broadcast::Receiver<RunEvent>, filter: WatchFilter) -> impl futures::Stream<Item = RunEvent> {
    use futures::StreamExt;

    BroadcastStream::new(rx)
        .filter_map(|r| async move { r.ok() })
        .filter(move |event| {
            let keep = filter.matches(event);
            async move { keep }
        })
}

fn lossy_stream(rx: broadcast::Receiver<LogChunk>) -> impl futures::Stream<Item = LogChunk> {
    use futures::StreamExt;
    BroadcastStream::new(rx).filter_map(|r| async move { r.ok() })
}
