//! Reference `Provider` implementation used by tests and local development.
//!
//! Not part of the core (spec.md §1: "the simulated 'fake' provider is
//! useful as a reference implementation... but is not part of the core").
//! Modeled on the configurable-failure-injection shape of
//! `storage-operator`'s test doubles: a shared, lockable config that tests
//! mutate before driving the executor, rather than a hand-rolled mock
//! framework.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use ironhold_core::model::{ClusterRef, Machine, OperationId};
use ironhold_core::provider::{JoinMaterial, LogSink, Provider, ProviderError, ProviderResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    SetNetboot,
    Reboot,
    RepaveImage,
    MintJoinMaterial,
    JoinNode,
    VerifyInCluster,
    RemoteExec,
    NetReconfig,
    RmaMark,
}

#[derive(Clone, Debug)]
struct Failure {
    retryable: bool,
    remaining: u32,
}

#[derive(Default)]
struct Config {
    failures: HashMap<Capability, Failure>,
    delays: HashMap<Capability, Duration>,
}

/// An in-memory provider that logs each capability invocation and succeeds
/// immediately, unless a test has configured `fail_next`/`delay` for that
/// capability.
#[derive(Clone)]
pub struct FakeProvider {
    config: Arc<Mutex<Config>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self { config: Arc::new(Mutex::new(Config::default())) }
    }

    /// Makes the next `times` invocations of `cap` fail, then resume
    /// succeeding. `times = u32::MAX` fails forever, for "exhausts every
    /// retry" scenarios.
    pub async fn fail_next(&self, cap: Capability, times: u32, retryable: bool) {
        self.config.lock().await.failures.insert(cap, Failure { retryable, remaining: times });
    }

    /// Adds a fixed delay before `cap` resolves, for exercising
    /// cancellation-during-a-running-step timing.
    pub async fn delay(&self, cap: Capability, duration: Duration) {
        self.config.lock().await.delays.insert(cap, duration);
    }

    async fn run(&self, cap: Capability, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        logs.write_stdout(format!("{cap:?} starting on {}\n", machine.id).as_bytes()).await;

        let delay = self.config.lock().await.delays.get(&cap).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut cfg = self.config.lock().await;
            match cfg.failures.get_mut(&cap) {
                Some(f) if f.remaining > 0 => {
                    f.remaining -= 1;
                    Some(f.retryable)
                }
                _ => None,
            }
        };

        if let Some(retryable) = failure {
            logs.write_stderr(format!("{cap:?} injected failure\n").as_bytes()).await;
            return Err(if retryable {
                ProviderError::retryable(format!("{cap:?} failed (injected)"))
            } else {
                ProviderError::permanent(format!("{cap:?} failed (injected)"))
            });
        }

        logs.write_stdout(format!("{cap:?} complete\n").as_bytes()).await;
        Ok(())
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn set_netboot(&self, _cancel: &CancellationToken, _op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        self.run(Capability::SetNetboot, machine, logs).await
    }

    async fn reboot(&self, _cancel: &CancellationToken, _op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        self.run(Capability::Reboot, machine, logs).await
    }

    async fn repave_image(&self, _cancel: &CancellationToken, _op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        self.run(Capability::RepaveImage, machine, logs).await
    }

    async fn mint_join_material(
        &self,
        _cancel: &CancellationToken,
        _op_id: OperationId,
        machine: &Machine,
        cluster: &ClusterRef,
        logs: &dyn LogSink,
    ) -> ProviderResult<JoinMaterial> {
        self.run(Capability::MintJoinMaterial, machine, logs).await?;
        Ok(JoinMaterial(format!("join-token-for-{}", cluster.cluster_id).into_bytes()))
    }

    async fn join_node(
        &self,
        _cancel: &CancellationToken,
        _op_id: OperationId,
        machine: &Machine,
        _material: JoinMaterial,
        logs: &dyn LogSink,
    ) -> ProviderResult<()> {
        self.run(Capability::JoinNode, machine, logs).await
    }

    async fn verify_in_cluster(
        &self,
        _cancel: &CancellationToken,
        _op_id: OperationId,
        machine: &Machine,
        _cluster: &ClusterRef,
        logs: &dyn LogSink,
    ) -> ProviderResult<()> {
        self.run(Capability::VerifyInCluster, machine, logs).await
    }

    async fn remote_exec(
        &self,
        _cancel: &CancellationToken,
        _op_id: OperationId,
        machine: &Machine,
        _command: &str,
        logs: &dyn LogSink,
    ) -> ProviderResult<()> {
        self.run(Capability::RemoteExec, machine, logs).await
    }

    async fn net_reconfig(&self, _cancel: &CancellationToken, _op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        self.run(Capability::NetReconfig, machine, logs).await
    }

    async fn rma_mark(&self, _cancel: &CancellationToken, _op_id: OperationId, machine: &Machine, logs: &dyn LogSink) -> ProviderResult<()> {
        self.run(Capability::RmaMark, machine, logs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironhold_core::model::{MachineId, MachineSpec, MachineStatus};

    struct NullSink;

    #[async_trait]
    impl LogSink for NullSink {
        async fn write_stdout(&self, _data: &[u8]) {}
        async fn write_stderr(&self, _data: &[u8]) {}
    }

    fn machine() -> Machine {
        Machine { id: MachineId::new(), spec: MachineSpec::default(), status: MachineStatus::default() }
    }

    #[tokio::test]
    async fn succeeds_by_default() {
        let provider = FakeProvider::new();
        let cancel = CancellationToken::new();
        let result = provider.reboot(&cancel, OperationId::new(), &machine(), &NullSink).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fails_configured_number_of_times_then_recovers() {
        let provider = FakeProvider::new();
        provider.fail_next(Capability::Reboot, 2, true).await;
        let cancel = CancellationToken::new();
        let m = machine();

        assert!(provider.reboot(&cancel, OperationId::new(), &m, &NullSink).await.is_err());
        assert!(provider.reboot(&cancel, OperationId::new(), &m, &NullSink).await.is_err());
        assert!(provider.reboot(&cancel, OperationId::new(), &m, &NullSink).await.is_ok());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retryable() {
        let provider = FakeProvider::new();
        provider.fail_next(Capability::JoinNode, 1, false).await;
        let cancel = CancellationToken::new();
        let err = provider
            .join_node(&cancel, OperationId::new(), &machine(), JoinMaterial(vec![]), &NullSink)
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
