//! Generated message/service types plus the conversions and tonic glue that
//! bind them to `ironhold_core`. The façade itself stays free of any tonic
//! dependency (see `ironhold_core::facade` module docs); this crate is the
//! only place that knows about wire framing, mirroring how
//! `storage/src/api.rs` wraps `ShardEngine`/`ApiService` behind the generated
//! `StorageApiServer` trait.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use ironhold_core::error::CoreError;
use ironhold_core::facade::{Facade, WatchFilter};
use ironhold_core::model as core;

pub mod pb {
    tonic::include_proto!("operations");
}

use pb::operation_service_server::OperationService;

// ---------------------------------------------------------------------
// Domain -> wire conversions
// ---------------------------------------------------------------------

fn ts_to_unix_ms(ts: Option<DateTime<Utc>>) -> i64 {
    ts.map(|t| t.timestamp_millis()).unwrap_or(0)
}

impl From<core::ClusterRef> for pb::ClusterRef {
    fn from(c: core::ClusterRef) -> Self {
        pb::ClusterRef { cluster_id: c.cluster_id }
    }
}

impl From<pb::ClusterRef> for core::ClusterRef {
    fn from(c: pb::ClusterRef) -> Self {
        core::ClusterRef { cluster_id: c.cluster_id }
    }
}

impl From<core::MachineSpec> for pb::MachineSpec {
    fn from(s: core::MachineSpec) -> Self {
        pb::MachineSpec {
            provider: s.provider,
            mac_addresses: s.mac_addresses,
            ssh_endpoint: s.ssh_endpoint,
            bmc_endpoint: s.bmc_endpoint,
            target_cluster: s.target_cluster.map(Into::into),
            labels: s.labels,
        }
    }
}

impl From<pb::MachineSpec> for core::MachineSpec {
    fn from(s: pb::MachineSpec) -> Self {
        core::MachineSpec {
            provider: s.provider,
            mac_addresses: s.mac_addresses,
            ssh_endpoint: s.ssh_endpoint,
            bmc_endpoint: s.bmc_endpoint,
            target_cluster: s.target_cluster.map(Into::into),
            labels: s.labels,
        }
    }
}

impl From<core::Phase> for pb::Phase {
    fn from(p: core::Phase) -> Self {
        match p {
            core::Phase::FactoryReady => pb::Phase::FactoryReady,
            core::Phase::Ready => pb::Phase::Ready,
            core::Phase::Maintenance => pb::Phase::Maintenance,
            core::Phase::InService => pb::Phase::InService,
            core::Phase::Rma => pb::Phase::Rma,
            core::Phase::Retired => pb::Phase::Retired,
        }
    }
}

impl From<core::EffectiveState> for pb::EffectiveState {
    fn from(e: core::EffectiveState) -> Self {
        match e {
            core::EffectiveState::New => pb::EffectiveState::New,
            core::EffectiveState::Idle => pb::EffectiveState::Idle,
            core::EffectiveState::Busy => pb::EffectiveState::Busy,
            core::EffectiveState::MaintenanceIdle => pb::EffectiveState::MaintenanceIdle,
            core::EffectiveState::Attention => pb::EffectiveState::Attention,
            core::EffectiveState::Blocked => pb::EffectiveState::Blocked,
            core::EffectiveState::EffectiveUnspecified => pb::EffectiveState::EffectiveUnspecified,
        }
    }
}

impl From<core::ConditionType> for pb::ConditionType {
    fn from(t: core::ConditionType) -> Self {
        match t {
            core::ConditionType::Reachable => pb::ConditionType::Reachable,
            core::ConditionType::Provisioned => pb::ConditionType::Provisioned,
            core::ConditionType::InCustomerCluster => pb::ConditionType::InCustomerCluster,
            core::ConditionType::NeedsIntervention => pb::ConditionType::NeedsIntervention,
            core::ConditionType::Healthy => pb::ConditionType::Healthy,
            core::ConditionType::OperationCanceled => pb::ConditionType::OperationCanceled,
            core::ConditionType::Rma => pb::ConditionType::RmaCondition,
            core::ConditionType::Retired => pb::ConditionType::RetiredCondition,
        }
    }
}

impl From<core::Condition> for pb::Condition {
    fn from(c: core::Condition) -> Self {
        pb::Condition {
            r#type: pb::ConditionType::from(c.r#type) as i32,
            status: c.status,
            reason: c.reason,
            message: c.message,
            last_transition_time_unix_ms: c.last_transition_time.timestamp_millis(),
        }
    }
}

fn machine_status_to_pb(status: core::MachineStatus, effective_state: core::EffectiveState) -> pb::MachineStatus {
    pb::MachineStatus {
        phase: pb::Phase::from(status.phase) as i32,
        conditions: status.conditions.into_iter().map(Into::into).collect(),
        active_operation_id: status.active_operation_id.map(|id| id.to_string()).unwrap_or_default(),
        effective_state: pb::EffectiveState::from(effective_state) as i32,
        last_seen_unix_ms: ts_to_unix_ms(status.last_seen),
    }
}

pub fn machine_view_to_pb(view: ironhold_core::facade::MachineView) -> pb::Machine {
    pb::Machine {
        machine_id: view.machine.id.to_string(),
        spec: Some(view.machine.spec.into()),
        status: Some(machine_status_to_pb(view.machine.status, view.effective_state)),
    }
}

impl From<core::OperationType> for pb::OperationType {
    fn from(t: core::OperationType) -> Self {
        match t {
            core::OperationType::Reboot => pb::OperationType::Reboot,
            core::OperationType::Reimage => pb::OperationType::Reimage,
            core::OperationType::EnterMaintenance => pb::OperationType::EnterMaintenance,
            core::OperationType::ExitMaintenance => pb::OperationType::ExitMaintenance,
            core::OperationType::Rma => pb::OperationType::RmaOperation,
        }
    }
}

impl From<core::OperationPhase> for pb::OperationPhase {
    fn from(p: core::OperationPhase) -> Self {
        match p {
            core::OperationPhase::Pending => pb::OperationPhase::Pending,
            core::OperationPhase::Running => pb::OperationPhase::Running,
            core::OperationPhase::Succeeded => pb::OperationPhase::Succeeded,
            core::OperationPhase::Failed => pb::OperationPhase::Failed,
            core::OperationPhase::Canceled => pb::OperationPhase::Canceled,
        }
    }
}

impl From<core::StepState> for pb::StepState {
    fn from(s: core::StepState) -> Self {
        match s {
            core::StepState::Waiting => pb::StepState::Waiting,
            core::StepState::Running => pb::StepState::StepRunning,
            core::StepState::Succeeded => pb::StepState::StepSucceeded,
            core::StepState::Failed => pb::StepState::StepFailed,
        }
    }
}

impl From<core::StepStatus> for pb::StepStatus {
    fn from(s: core::StepStatus) -> Self {
        pb::StepStatus {
            name: s.name,
            state: pb::StepState::from(s.state) as i32,
            retry_count: s.retry_count,
            started_at_unix_ms: ts_to_unix_ms(s.started_at),
            finished_at_unix_ms: ts_to_unix_ms(s.finished_at),
            message: s.message,
        }
    }
}

impl From<core::Operation> for pb::Operation {
    fn from(op: core::Operation) -> Self {
        pb::Operation {
            operation_id: op.id.to_string(),
            machine_id: op.machine_id.to_string(),
            r#type: pb::OperationType::from(op.r#type) as i32,
            request_id: op.request_id.0,
            phase: pb::OperationPhase::from(op.phase) as i32,
            steps: op.steps.into_iter().map(Into::into).collect(),
            current_stage: op.current_stage,
            started_at_unix_ms: ts_to_unix_ms(op.started_at),
            finished_at_unix_ms: ts_to_unix_ms(op.finished_at),
            error: op.error.map(|e| pb::OperationError { code: e.code, message: e.message, retryable: e.retryable }),
        }
    }
}

impl From<core::RunEvent> for pb::RunEvent {
    fn from(e: core::RunEvent) -> Self {
        pb::RunEvent { ts_unix_ms: e.ts.timestamp_millis(), snapshot: Some(e.snapshot.into()), message: e.message }
    }
}

impl From<core::LogStream> for pb::LogStream {
    fn from(s: core::LogStream) -> Self {
        match s {
            core::LogStream::Stdout => pb::LogStream::Stdout,
            core::LogStream::Stderr => pb::LogStream::Stderr,
        }
    }
}

impl From<core::LogChunk> for pb::LogChunk {
    fn from(c: core::LogChunk) -> Self {
        pb::LogChunk {
            ts_unix_ms: c.ts.timestamp_millis(),
            run_id: c.run_id.to_string(),
            stream: pb::LogStream::from(c.stream) as i32,
            data: c.data,
        }
    }
}

// ---------------------------------------------------------------------
// Wire ids -> domain ids
// ---------------------------------------------------------------------

fn parse_machine_id(raw: &str) -> Result<core::MachineId, Status> {
    raw.parse::<Uuid>().map(core::MachineId).map_err(|_| Status::invalid_argument(format!("not a valid machine_id: {raw}")))
}

fn parse_operation_id(raw: &str) -> Result<core::OperationId, Status> {
    raw.parse::<Uuid>().map(core::OperationId).map_err(|_| Status::invalid_argument(format!("not a valid operation_id: {raw}")))
}

fn core_error_to_status(err: CoreError) -> Status {
    match err {
        CoreError::MachineNotFound(_) | CoreError::OperationNotFound(_) | CoreError::PlanNotFound(_) => {
            Status::not_found(err.to_string())
        }
        CoreError::FailedPrecondition(_) => Status::failed_precondition(err.to_string()),
        CoreError::AlreadyExists(_) => Status::already_exists(err.to_string()),
        CoreError::ResourceExhausted(_, _) => Status::resource_exhausted(err.to_string()),
        CoreError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        CoreError::ExecutionFailed(_) => Status::internal(err.to_string()),
    }
}

// ---------------------------------------------------------------------
// Service binding
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct OperationServiceImpl {
    facade: Facade,
}

impl OperationServiceImpl {
    pub fn new(facade: Facade) -> Self {
        Self { facade }
    }
}

pub type RunEventStream = Pin<Box<dyn Stream<Item = Result<pb::RunEvent, Status>> + Send>>;
pub type LogChunkStream = Pin<Box<dyn Stream<Item = Result<pb::LogChunk, Status>> + Send>>;

#[tonic::async_trait]
impl OperationService for OperationServiceImpl {
    async fn register_machine(&self, request: Request<pb::RegisterMachineRequest>) -> Result<Response<pb::Machine>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let spec: core::MachineSpec = req.spec.unwrap_or_default().into();
        let view = self.facade.register_machine(machine_id, spec).await.map_err(core_error_to_status)?;
        Ok(Response::new(machine_view_to_pb(view)))
    }

    async fn list_machines(&self, _request: Request<pb::ListMachinesRequest>) -> Result<Response<pb::ListMachinesResponse>, Status> {
        let views = self.facade.list_machines().await.map_err(core_error_to_status)?;
        Ok(Response::new(pb::ListMachinesResponse { machines: views.into_iter().map(machine_view_to_pb).collect() }))
    }

    async fn get_machine(&self, request: Request<pb::GetMachineRequest>) -> Result<Response<pb::Machine>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let view = self.facade.get_machine(machine_id).await.map_err(core_error_to_status)?;
        Ok(Response::new(machine_view_to_pb(view)))
    }

    async fn update_machine(&self, request: Request<pb::UpdateMachineRequest>) -> Result<Response<pb::Machine>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let spec: core::MachineSpec = req.spec.unwrap_or_default().into();
        let view = self.facade.update_machine(machine_id, spec).await.map_err(core_error_to_status)?;
        Ok(Response::new(machine_view_to_pb(view)))
    }

    async fn reboot_machine(&self, request: Request<pb::RebootMachineRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let op = self
            .facade
            .reboot_machine(machine_id, core::RequestId(req.request_id))
            .await
            .map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn reimage_machine(&self, request: Request<pb::ReimageMachineRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let op = self
            .facade
            .reimage_machine(machine_id, core::RequestId(req.request_id))
            .await
            .map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn enter_maintenance(&self, request: Request<pb::EnterMaintenanceRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let op = self
            .facade
            .enter_maintenance(machine_id, core::RequestId(req.request_id))
            .await
            .map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn exit_maintenance(&self, request: Request<pb::ExitMaintenanceRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let machine_id = parse_machine_id(&req.machine_id)?;
        let op = self
            .facade
            .exit_maintenance(machine_id, core::RequestId(req.request_id))
            .await
            .map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn cancel_operation(&self, request: Request<pb::CancelOperationRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let operation_id = parse_operation_id(&req.operation_id)?;
        let op = self.facade.cancel_operation(operation_id).await.map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn get_operation(&self, request: Request<pb::GetOperationRequest>) -> Result<Response<pb::Operation>, Status> {
        let req = request.into_inner();
        let operation_id = parse_operation_id(&req.operation_id)?;
        let op = self.facade.get_operation(operation_id).await.map_err(core_error_to_status)?;
        Ok(Response::new(op.into()))
    }

    async fn list_operations(&self, request: Request<pb::ListOperationsRequest>) -> Result<Response<pb::ListOperationsResponse>, Status> {
        let req = request.into_inner();
        let machine_id = req.machine_id.map(|id| parse_machine_id(&id)).transpose()?;
        let ops = self.facade.list_operations(machine_id).await;
        Ok(Response::new(pb::ListOperationsResponse { operations: ops.into_iter().map(Into::into).collect() }))
    }

    type WatchOperationsStream = RunEventStream;

    async fn watch_operations(&self, request: Request<pb::WatchOperationsRequest>) -> Result<Response<Self::WatchOperationsStream>, Status> {
        let req = request.into_inner();
        let filter = WatchFilter::parse(&req.filter).map_err(core_error_to_status)?;
        let stream = self.facade.watch_operations(filter).await.map_err(core_error_to_status)?;
        let mapped = stream.map(|event| Ok(event.into()));
        Ok(Response::new(Box::pin(mapped)))
    }

    type StreamOperationLogsStream = LogChunkStream;

    async fn stream_operation_logs(&self, request: Request<pb::StreamOperationLogsRequest>) -> Result<Response<Self::StreamOperationLogsStream>, Status> {
        let req = request.into_inner();
        let operation_id = parse_operation_id(&req.operation_id)?;
        let stream = self.facade.stream_operation_logs(operation_id).await.map_err(core_error_to_status)?;
        let mapped = stream.map(|chunk| Ok(chunk.into()));
        Ok(Response::new(Box::pin(mapped)))
    }
}

