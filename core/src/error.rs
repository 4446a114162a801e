//! Façade-level error taxonomy (spec.md §4.5). Maps 1:1 onto the gRPC status
//! codes the `proto` crate's service binding assigns, the same way
//! `storage-operator`'s `ReconcileError` maps onto controller-runtime result
//! kinds.

use thiserror::Error;

use crate::model::{MachineId, OperationId};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),

    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("machine {0} already registered")]
    AlreadyExists(MachineId),

    #[error("machine {0} already has an active operation {1}")]
    ResourceExhausted(MachineId, OperationId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
