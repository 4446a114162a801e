//! Drives one operation from `PENDING` to a terminal phase (spec.md §4.4).
//!
//! Each operation gets its own long-lived task, spawned and forgotten by the
//! façade — `StartOperation` never awaits executor work, the same
//! fire-and-collect-via-broadcast shape `storage/src/replication.rs` uses for
//! its per-shard replica-sync tasks (`tokio::spawn` + a `JoinHandle` kept only
//! for shutdown, progress observed entirely through channels).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ironhold_common::backoff::{backoff_delay, cancellable_sleep};

use crate::fanout::{EventBus, LogBus};
use crate::model::{
    ConditionType, LogChunk, LogStream, Machine, Operation, OperationError, OperationId,
    OperationPhase, OperationType, Phase, RunEvent, StepState, StepStatus,
};
use crate::plan::{PlanRegistry, PlanStep, StepKind};
use crate::provider::{mint_and_join, LogSink, Provider, ProviderError, ProviderResult};
use crate::store::Store;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);

struct BusLogSink {
    bus: LogBus,
    run_id: OperationId,
}

#[async_trait]
impl LogSink for BusLogSink {
    async fn write_stdout(&self, data: &[u8]) {
        self.bus
            .publish(LogChunk { ts: Utc::now(), run_id: self.run_id, stream: LogStream::Stdout, data: data.to_vec() })
            .await;
    }

    async fn write_stderr(&self, data: &[u8]) {
        self.bus
            .publish(LogChunk { ts: Utc::now(), run_id: self.run_id, stream: LogStream::Stderr, data: data.to_vec() })
            .await;
    }
}

enum StepOutcome {
    Success { attempts: u32 },
    Failed { err: ProviderError, attempts: u32 },
    Cancelled,
}

#[derive(Clone)]
pub struct Executor {
    store: Store,
    events: EventBus,
    logs: LogBus,
    plans: Arc<PlanRegistry>,
    provider: Arc<dyn Provider>,
    cancellations: Arc<Mutex<HashMap<OperationId, CancellationToken>>>,
    root_cancel: CancellationToken,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl Executor {
    pub fn new(store: Store, events: EventBus, logs: LogBus, plans: Arc<PlanRegistry>, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            events,
            logs,
            plans,
            provider,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            root_cancel: CancellationToken::new(),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }

    /// Stops accepting new cancellable waits and trips every in-flight
    /// operation's token, used by the server's graceful-shutdown path.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    /// Admits `operation_id` for execution: verifies it is still `PENDING`,
    /// registers a cancellation handle, and spawns the step loop. Returns
    /// immediately — per spec.md §4.4, `StartOperation` never blocks on
    /// executor work.
    pub async fn start_operation(&self, operation_id: OperationId) {
        let token = self.root_cancel.child_token();
        self.cancellations.lock().await.insert(operation_id, token.clone());

        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(operation_id, token).await;
        });
    }

    /// Trips the cancellation token for an in-flight operation. A no-op if
    /// the operation already finished or was never started.
    pub async fn cancel_operation(&self, operation_id: OperationId) {
        if let Some(token) = self.cancellations.lock().await.get(&operation_id) {
            token.cancel();
        }
    }

    async fn forget(&self, operation_id: OperationId) {
        self.cancellations.lock().await.remove(&operation_id);
    }

    async fn run(&self, operation_id: OperationId, cancel: CancellationToken) {
        let Ok(op) = self.store.get_operation(operation_id).await else {
            warn!(%operation_id, "executor picked up unknown operation");
            return;
        };
        if op.phase != OperationPhase::Pending {
            warn!(%operation_id, phase = ?op.phase, "executor picked up a non-pending operation, ignoring");
            return;
        }

        let Ok(machine) = self.store.get_machine(op.machine_id).await else {
            warn!(%operation_id, machine_id = %op.machine_id, "operation references an unknown machine");
            return;
        };

        let plan = match self.plans.get(op.r#type.plan_id()) {
            Some(plan) => plan,
            None => {
                self.finalize_failed(operation_id, "no plan registered for operation type".into()).await;
                self.forget(operation_id).await;
                return;
            }
        };

        if cancel.is_cancelled() {
            self.finalize_cancelled(operation_id).await;
            self.forget(operation_id).await;
            return;
        }

        let op = self
            .store
            .update_operation(operation_id, |op| {
                op.phase = OperationPhase::Running;
                op.started_at = Some(Utc::now());
            })
            .await
            .expect("operation vanished mid-run");
        self.publish_event(op, "operation started").await;

        let log_sink = BusLogSink { bus: self.logs.clone(), run_id: operation_id };

        for step in &plan.steps {
            if cancel.is_cancelled() {
                self.finalize_cancelled(operation_id).await;
                self.forget(operation_id).await;
                return;
            }

            let op = self
                .store
                .update_operation(operation_id, |op| {
                    op.current_stage = step.name.clone();
                    op.steps.push(StepStatus {
                        name: step.name.clone(),
                        state: StepState::Running,
                        retry_count: 0,
                        started_at: Some(Utc::now()),
                        finished_at: None,
                        message: String::new(),
                    });
                })
                .await
                .expect("operation vanished mid-run");
            self.publish_event(op, &format!("step {} started", step.name)).await;

            match self.run_step(operation_id, &machine, step, &cancel, &log_sink).await {
                StepOutcome::Success { attempts } => {
                    let op = self
                        .store
                        .update_operation(operation_id, |op| {
                            let last = op.steps.last_mut().expect("step just pushed");
                            last.state = StepState::Succeeded;
                            last.retry_count = attempts;
                            last.finished_at = Some(Utc::now());
                        })
                        .await
                        .expect("operation vanished mid-run");
                    self.publish_event(op, &format!("step {} succeeded", step.name)).await;
                }
                StepOutcome::Cancelled => {
                    self.finalize_cancelled(operation_id).await;
                    self.forget(operation_id).await;
                    return;
                }
                StepOutcome::Failed { err, attempts } => {
                    let message = err.message.clone();
                    let op = self
                        .store
                        .update_operation(operation_id, |op| {
                            let last = op.steps.last_mut().expect("step just pushed");
                            last.state = StepState::Failed;
                            last.retry_count = attempts;
                            last.finished_at = Some(Utc::now());
                            last.message = message.clone();
                        })
                        .await
                        .expect("operation vanished mid-run");
                    self.publish_event(op, &format!("step {} failed: {message}", step.name)).await;
                    self.finalize_failed(operation_id, message).await;
                    self.forget(operation_id).await;
                    return;
                }
            }
        }

        self.finalize_succeeded(operation_id).await;
        self.forget(operation_id).await;
    }

    /// Runs one step to completion: up to `effective_max_retries` attempts,
    /// each bounded by `effective_timeout`, separated by cancellable
    /// exponential backoff.
    async fn run_step(
        &self,
        operation_id: OperationId,
        machine: &Machine,
        step: &PlanStep,
        cancel: &CancellationToken,
        logs: &dyn LogSink,
    ) -> StepOutcome {
        let attempts = step.effective_max_retries();
        let mut last_err = ProviderError::permanent("step had zero configured attempts");
        let mut last_attempt = 0;

        for attempt in 0..attempts {
            last_attempt = attempt;
            let call = invoke_capability(self.provider.as_ref(), cancel, operation_id, step, machine, logs);
            let timed = tokio::time::timeout(step.effective_timeout(), call);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return StepOutcome::Cancelled,
                res = timed => res,
            };

            match outcome {
                Ok(Ok(())) => return StepOutcome::Success { attempts: attempt },
                Ok(Err(err)) => last_err = err,
                Err(_elapsed) => last_err = ProviderError::retryable(format!("step {} timed out", step.name)),
            }

            let is_last_attempt = attempt + 1 == attempts;
            if is_last_attempt || !last_err.retryable {
                break;
            }

            info!(step = %step.name, attempt, error = %last_err.message, "capability attempt failed, backing off");
            let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt);
            if cancellable_sleep(cancel, delay).await.is_err() {
                return StepOutcome::Cancelled;
            }
        }

        StepOutcome::Failed { err: last_err, attempts: last_attempt }
    }

    async fn publish_event(&self, snapshot: Operation, message: &str) {
        self.events.publish(RunEvent { ts: Utc::now(), snapshot, message: message.to_string() }).await;
    }

    async fn finalize_succeeded(&self, operation_id: OperationId) {
        let op = self
            .store
            .update_operation(operation_id, |op| {
                op.phase = OperationPhase::Succeeded;
                op.finished_at = Some(Utc::now());
            })
            .await
            .expect("operation vanished before finalize");

        let _ = self
            .store
            .update_machine(op.machine_id, |machine| {
                crate::lifecycle::set_condition(&mut machine.status, ConditionType::NeedsIntervention, false, "Cleared", "run succeeded");
                match op.r#type {
                    OperationType::Reimage => {
                        crate::lifecycle::set_condition(&mut machine.status, ConditionType::Provisioned, true, "Reimaged", "image installed");
                        crate::lifecycle::set_condition(&mut machine.status, ConditionType::InCustomerCluster, true, "Joined", "verified in cluster");
                        machine.status.phase = Phase::InService;
                    }
                    OperationType::EnterMaintenance => machine.status.phase = Phase::Maintenance,
                    OperationType::ExitMaintenance => machine.status.phase = Phase::Ready,
                    OperationType::Rma => {
                        crate::lifecycle::set_condition(&mut machine.status, ConditionType::Rma, true, "RmaComplete", "machine marked for return");
                        machine.status.phase = Phase::Rma;
                    }
                    OperationType::Reboot => {}
                }
                if machine.status.active_operation_id == Some(operation_id) {
                    machine.status.active_operation_id = None;
                }
            })
            .await;

        self.publish_event(op, "operation succeeded").await;
        self.logs
            .publish(LogChunk { ts: Utc::now(), run_id: operation_id, stream: LogStream::Stdout, data: b"Run SUCCEEDED\n".to_vec() })
            .await;
        self.events.retire_if_idle(operation_id).await;
        self.logs.retire_if_idle(operation_id).await;
    }

    async fn finalize_failed(&self, operation_id: OperationId, message: String) {
        let op = self
            .store
            .update_operation(operation_id, |op| {
                op.phase = OperationPhase::Failed;
                op.finished_at = Some(Utc::now());
                op.error = Some(OperationError { code: "EXECUTION_FAILED".into(), message: message.clone(), retryable: true });
            })
            .await
            .expect("operation vanished before finalize");

        let _ = self
            .store
            .update_machine(op.machine_id, |machine| {
                crate::lifecycle::set_condition(&mut machine.status, ConditionType::NeedsIntervention, true, "RunFailed", &message);
                machine.status.phase = Phase::Maintenance;
                if machine.status.active_operation_id == Some(operation_id) {
                    machine.status.active_operation_id = None;
                }
            })
            .await;

        self.publish_event(op, "operation failed").await;
        self.logs
            .publish(LogChunk { ts: Utc::now(), run_id: operation_id, stream: LogStream::Stderr, data: format!("Run FAILED: {message}\n").into_bytes() })
            .await;
        self.events.retire_if_idle(operation_id).await;
        self.logs.retire_if_idle(operation_id).await;
    }

    async fn finalize_cancelled(&self, operation_id: OperationId) {
        let op = self
            .store
            .update_operation(operation_id, |op| {
                op.phase = OperationPhase::Canceled;
                op.finished_at = Some(Utc::now());
            })
            .await
            .expect("operation vanished before finalize");

        let _ = self
            .store
            .update_machine(op.machine_id, |machine| {
                crate::lifecycle::set_condition(&mut machine.status, ConditionType::OperationCanceled, true, "Canceled", "operation canceled by request");
                if machine.status.active_operation_id == Some(operation_id) {
                    machine.status.active_operation_id = None;
                }
            })
            .await;

        self.publish_event(op, "operation canceled").await;
        self.logs
            .publish(LogChunk { ts: Utc::now(), run_id: operation_id, stream: LogStream::Stdout, data: b"Run CANCELED\n".to_vec() })
            .await;
        self.events.retire_if_idle(operation_id).await;
        self.logs.retire_if_idle(operation_id).await;
    }
}

async fn invoke_capability(
    provider: &dyn Provider,
    cancel: &CancellationToken,
    op_id: OperationId,
    step: &PlanStep,
    machine: &Machine,
    logs: &dyn LogSink,
) -> ProviderResult<()> {
    match step.kind {
        StepKind::SetNetboot => provider.set_netboot(cancel, op_id, machine, logs).await,
        StepKind::Reboot => provider.reboot(cancel, op_id, machine, logs).await,
        StepKind::RepaveImage => provider.repave_image(cancel, op_id, machine, logs).await,
        StepKind::MintJoinAndJoin => {
            let cluster = machine
                .spec
                .target_cluster
                .clone()
                .ok_or_else(|| ProviderError::permanent("machine has no target cluster configured"))?;
            mint_and_join(provider, cancel, op_id, machine, &cluster, logs).await
        }
        StepKind::VerifyInCluster => {
            let cluster = machine
                .spec
                .target_cluster
                .clone()
                .ok_or_else(|| ProviderError::permanent("machine has no target cluster configured"))?;
            provider.verify_in_cluster(cancel, op_id, machine, &cluster, logs).await
        }
        StepKind::RemoteExec => provider.remote_exec(cancel, op_id, machine, &step.name, logs).await,
        StepKind::NetReconfig => provider.net_reconfig(cancel, op_id, machine, logs).await,
        StepKind::RmaMark => provider.rma_mark(cancel, op_id, machine, logs).await,
    }
}
