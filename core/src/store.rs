//! In-memory system of record for machines and operations (spec.md §4.1/§4.4).
//!
//! No persistence: spec.md's Non-goals exclude durable storage, so restart
//! loses state exactly as an in-memory `HashMap` would. Guarded the way
//! `storage/src/replication.rs` guards its shard table — async `RwLock` for
//! the machine/operation maps since reads (status queries) dominate writes
//! (admission, step transitions).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::model::{Machine, MachineId, Operation, OperationId, RequestId};

#[derive(Default)]
struct Inner {
    machines: HashMap<MachineId, Machine>,
    operations: HashMap<OperationId, Operation>,
    /// `(machine_id, request_id) -> operation_id`, enforcing idempotent
    /// replay per spec.md §4.5: the same request id against the same
    /// machine always resolves to the same operation.
    request_index: HashMap<(MachineId, RequestId), OperationId>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())) }
    }

    pub async fn insert_machine(&self, machine: Machine) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.machines.contains_key(&machine.id) {
            return Err(CoreError::AlreadyExists(machine.id));
        }
        inner.machines.insert(machine.id, machine);
        Ok(())
    }

    pub async fn get_machine(&self, id: MachineId) -> CoreResult<Machine> {
        self.inner
            .read()
            .await
            .machines
            .get(&id)
            .cloned()
            .ok_or(CoreError::MachineNotFound(id))
    }

    pub async fn list_machines(&self) -> Vec<Machine> {
        self.inner.read().await.machines.values().cloned().collect()
    }

    pub async fn update_machine<F>(&self, id: MachineId, f: F) -> CoreResult<Machine>
    where
        F: FnOnce(&mut Machine),
    {
        let mut inner = self.inner.write().await;
        let machine = inner.machines.get_mut(&id).ok_or(CoreError::MachineNotFound(id))?;
        f(machine);
        Ok(machine.clone())
    }

    /// Atomically sets `active_operation_id` iff currently unset, enforcing
    /// the single-active-operation-per-machine invariant (spec.md §4.1) at
    /// the only point that matters: admission.
    pub async fn try_set_active_operation(&self, machine_id: MachineId, op_id: OperationId) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        let machine = inner.machines.get_mut(&machine_id).ok_or(CoreError::MachineNotFound(machine_id))?;
        if let Some(existing) = machine.status.active_operation_id {
            return Err(CoreError::ResourceExhausted(machine_id, existing));
        }
        machine.status.active_operation_id = Some(op_id);
        Ok(())
    }

    pub async fn clear_active_operation(&self, machine_id: MachineId, op_id: OperationId) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        let machine = inner.machines.get_mut(&machine_id).ok_or(CoreError::MachineNotFound(machine_id))?;
        if machine.status.active_operation_id == Some(op_id) {
            machine.status.active_operation_id = None;
        }
        Ok(())
    }

    /// Inserts a brand new operation and its request-id index entry in one
    /// critical section, so a concurrent identical request can never race
    /// past the idempotency check (spec.md §4.5 "admission is atomic").
    pub async fn insert_operation(&self, op: Operation) -> CoreResult<Operation> {
        let mut inner = self.inner.write().await;
        let key = (op.machine_id, op.request_id.clone());
        if let Some(existing_id) = inner.request_index.get(&key) {
            return inner
                .operations
                .get(existing_id)
                .cloned()
                .ok_or(CoreError::OperationNotFound(*existing_id));
        }
        inner.request_index.insert(key, op.id);
        inner.operations.insert(op.id, op.clone());
        Ok(op)
    }

    /// Looks up an existing operation by `(machine_id, request_id)` without
    /// inserting, used by the façade to decide whether a request is a fresh
    /// admission or an idempotent replay before it builds a new `Operation`.
    pub async fn find_by_request_id(&self, machine_id: MachineId, request_id: &RequestId) -> Option<Operation> {
        let inner = self.inner.read().await;
        let op_id = inner.request_index.get(&(machine_id, request_id.clone()))?;
        inner.operations.get(op_id).cloned()
    }

    pub async fn get_operation(&self, id: OperationId) -> CoreResult<Operation> {
        self.inner
            .read()
            .await
            .operations
            .get(&id)
            .cloned()
            .ok_or(CoreError::OperationNotFound(id))
    }

    pub async fn list_operations_for_machine(&self, machine_id: MachineId) -> Vec<Operation> {
        self.inner
            .read()
            .await
            .operations
            .values()
            .filter(|op| op.machine_id == machine_id)
            .cloned()
            .collect()
    }

    pub async fn update_operation<F>(&self, id: OperationId, f: F) -> CoreResult<Operation>
    where
        F: FnOnce(&mut Operation),
    {
        let mut inner = self.inner.write().await;
        let op = inner.operations.get_mut(&id).ok_or(CoreError::OperationNotFound(id))?;
        f(op);
        Ok(op.clone())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MachineSpec, MachineStatus, OperationType};

    fn machine() -> Machine {
        Machine { id: MachineId::new(), spec: MachineSpec::default(), status: MachineStatus::default() }
    }

    #[tokio::test]
    async fn duplicate_machine_registration_rejected() {
        let store = Store::new();
        let m = machine();
        store.insert_machine(m.clone()).await.unwrap();
        assert!(matches!(store.insert_machine(m).await, Err(CoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn second_active_operation_rejected_until_first_clears() {
        let store = Store::new();
        let m = machine();
        store.insert_machine(m.clone()).await.unwrap();

        let op1 = OperationId::new();
        store.try_set_active_operation(m.id, op1).await.unwrap();

        let op2 = OperationId::new();
        assert!(matches!(
            store.try_set_active_operation(m.id, op2).await,
            Err(CoreError::ResourceExhausted(_, existing)) if existing == op1
        ));

        store.clear_active_operation(m.id, op1).await.unwrap();
        store.try_set_active_operation(m.id, op2).await.unwrap();
    }

    #[tokio::test]
    async fn inserting_same_request_id_twice_returns_same_operation() {
        let store = Store::new();
        let m = machine();
        store.insert_machine(m.clone()).await.unwrap();

        let rid = RequestId("req-1".into());
        let op = Operation::new(OperationId::new(), m.id, OperationType::Reboot, rid.clone());
        let first = store.insert_operation(op.clone()).await.unwrap();

        let replay = Operation::new(OperationId::new(), m.id, OperationType::Reboot, rid);
        let second = store.insert_operation(replay).await.unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn find_by_request_id_does_not_insert() {
        let store = Store::new();
        let m = machine();
        store.insert_machine(m.clone()).await.unwrap();

        let rid = RequestId("req-2".into());
        assert!(store.find_by_request_id(m.id, &rid).await.is_none());

        let op = Operation::new(OperationId::new(), m.id, OperationType::Reboot, rid.clone());
        store.insert_operation(op.clone()).await.unwrap();
        assert_eq!(store.find_by_request_id(m.id, &rid).await.unwrap().id, op.id);
    }
}
