//! Data model: machines, operations, steps, and the derived effective state.
//!
//! See spec.md §3. Clients never construct status fields directly; the
//! façade and executor own every mutation to `MachineStatus` and `Operation`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub Uuid);

impl MachineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-supplied idempotency key, opaque and scoped to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub cluster_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSpec {
    pub provider: String,
    pub mac_addresses: Vec<String>,
    pub ssh_endpoint: String,
    pub bmc_endpoint: Option<String>,
    pub target_cluster: Option<ClusterRef>,
    pub labels: HashMap<String, String>,
}

/// Explicit operator intent. Never encodes errors — those are conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    FactoryReady,
    Ready,
    Maintenance,
    InService,
    Rma,
    Retired,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::FactoryReady => "FACTORY_READY",
            Phase::Ready => "READY",
            Phase::Maintenance => "MAINTENANCE",
            Phase::InService => "IN_SERVICE",
            Phase::Rma => "RMA",
            Phase::Retired => "RETIRED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Reachable,
    Provisioned,
    InCustomerCluster,
    NeedsIntervention,
    Healthy,
    OperationCanceled,
    Rma,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatus {
    pub phase: Phase,
    pub conditions: Vec<Condition>,
    pub active_operation_id: Option<OperationId>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for MachineStatus {
    fn default() -> Self {
        Self {
            phase: Phase::FactoryReady,
            conditions: Vec::new(),
            active_operation_id: None,
            last_seen: None,
        }
    }
}

impl MachineStatus {
    pub fn condition(&self, t: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == t)
    }

    pub fn condition_is(&self, t: ConditionType) -> bool {
        self.condition(t).map(|c| c.status).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub spec: MachineSpec,
    pub status: MachineStatus,
}

/// Derived, never stored as a mutation source. Computed by §4.1's precedence
/// table from `MachineStatus` plus (optionally) the active operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveState {
    New,
    Idle,
    Busy,
    MaintenanceIdle,
    Attention,
    Blocked,
    EffectiveUnspecified,
}

impl fmt::Display for EffectiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffectiveState::New => "NEW",
            EffectiveState::Idle => "IDLE",
            EffectiveState::Busy => "BUSY",
            EffectiveState::MaintenanceIdle => "MAINTENANCE_IDLE",
            EffectiveState::Attention => "ATTENTION",
            EffectiveState::Blocked => "BLOCKED",
            EffectiveState::EffectiveUnspecified => "EFFECTIVE_UNSPECIFIED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Reboot,
    Reimage,
    EnterMaintenance,
    ExitMaintenance,
    Rma,
}

impl OperationType {
    pub fn plan_id(self) -> &'static str {
        match self {
            OperationType::Reboot => "reboot",
            OperationType::Reimage => "reimage",
            OperationType::EnterMaintenance => "maintenance-enter",
            OperationType::ExitMaintenance => "maintenance-exit",
            OperationType::Rma => "rma",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationPhase {
    pub fn is_active(self) -> bool {
        matches!(self, OperationPhase::Pending | OperationPhase::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub name: String,
    pub state: StepState,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub machine_id: MachineId,
    pub r#type: OperationType,
    pub request_id: RequestId,
    pub phase: OperationPhase,
    pub steps: Vec<StepStatus>,
    pub current_stage: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn new(id: OperationId, machine_id: MachineId, r#type: OperationType, request_id: RequestId) -> Self {
        Self {
            id,
            machine_id,
            r#type,
            request_id,
            phase: OperationPhase::Pending,
            steps: Vec::new(),
            current_stage: String::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Event delivered to `WatchOperations` subscribers. Carries a deep copy of
/// the operation at the moment of emission (spec.md §4.4 snapshot discipline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    pub snapshot: Operation,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub ts: DateTime<Utc>,
    pub run_id: OperationId,
    pub stream: LogStream,
    pub data: Vec<u8>,
}
