//! The capability surface a baremetal backend must implement (spec.md §4.3).
//!
//! Mirrors the async-trait-object shape `storage-operator` uses for its
//! `ObjectBackend` abstraction: one trait, one method per capability, a
//! `dyn Provider` held behind an `Arc` so the executor is backend-agnostic.

use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::model::{ClusterRef, Machine, OperationId};

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Opaque material minted by `mint_join_material` and handed to `join_node`.
/// Backends are free to interpret the bytes however their join flow requires.
#[derive(Debug, Clone)]
pub struct JoinMaterial(pub Vec<u8>);

/// Sink a provider writes step output into. The executor supplies an
/// implementation backed by the fan-out log bus (spec.md §4.6) so every byte
/// a step produces is both persisted and streamed live.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_stdout(&self, data: &[u8]);
    async fn write_stderr(&self, data: &[u8]);
}

/// One method per plan step kind in `plan.rs`. Every method is independently
/// retryable/timeoutable by the executor; providers should not implement
/// their own retry loops.
///
/// Every method takes a cancellation token, the owning operation id (for log
/// attribution), and the machine (spec.md §4.3), plus its specific
/// parameters. A provider that cooperatively honors `cancel` can return
/// promptly instead of relying on the executor to drop the call's future out
/// from under it.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn set_netboot(&self, cancel: &CancellationToken, op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()>;

    async fn reboot(&self, cancel: &CancellationToken, op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()>;

    async fn repave_image(&self, cancel: &CancellationToken, op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()>;

    async fn mint_join_material(
        &self,
        cancel: &CancellationToken,
        op_id: OperationId,
        machine: &Machine,
        cluster: &ClusterRef,
        logs: &dyn LogSink,
    ) -> ProviderResult<JoinMaterial>;

    async fn join_node(
        &self,
        cancel: &CancellationToken,
        op_id: OperationId,
        machine: &Machine,
        material: JoinMaterial,
        logs: &dyn LogSink,
    ) -> ProviderResult<()>;

    async fn verify_in_cluster(
        &self,
        cancel: &CancellationToken,
        op_id: OperationId,
        machine: &Machine,
        cluster: &ClusterRef,
        logs: &dyn LogSink,
    ) -> ProviderResult<()>;

    async fn remote_exec(
        &self,
        cancel: &CancellationToken,
        op_id: OperationId,
        machine: &Machine,
        command: &str,
        logs: &dyn LogSink,
    ) -> ProviderResult<()>;

    async fn net_reconfig(&self, cancel: &CancellationToken, op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()>;

    async fn rma_mark(&self, cancel: &CancellationToken, op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()>;
}

/// Combines the two calls a `MintJoinAndJoin` step needs, since the plan
/// registry models it as a single step (spec.md §4.2 note on step
/// granularity vs. provider granularity).
pub async fn mint_and_join(
    provider: &dyn Provider,
    cancel: &CancellationToken,
    op_id: OperationId,
    machine: &Machine,
    cluster: &ClusterRef,
    logs: &dyn LogSink,
) -> ProviderResult<()> {
    let material = provider.mint_join_material(cancel, op_id, machine, cluster, logs).await?;
    provider.join_node(cancel, op_id, machine, material, logs).await?;
    Ok(())
}
