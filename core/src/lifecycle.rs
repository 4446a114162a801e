//! Condition mutation and effective-state computation. Pure functions over a
//! `MachineStatus` snapshot — no I/O, no locking — so they are unit-testable
//! without a live Store, the same shape as the free `get_phase` /
//! `get_last_updated` helpers over a resource snapshot in
//! `storage-operator/src/clusters/reconcile.rs`.

use chrono::Utc;

use crate::model::{Condition, ConditionType, EffectiveState, MachineStatus, Operation, Phase};

/// `SetCondition(machine, type, status, reason, message)` from spec.md §4.1.
///
/// If a condition of `t` exists, its reason/message are always refreshed;
/// `last_transition_time` only moves forward when `status` actually flips.
/// Otherwise a new condition is appended with the current time.
pub fn set_condition(status: &mut MachineStatus, t: ConditionType, value: bool, reason: &str, message: &str) {
    if let Some(existing) = status.conditions.iter_mut().find(|c| c.r#type == t) {
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        if existing.status != value {
            existing.status = value;
            existing.last_transition_time = Utc::now();
        }
        return;
    }

    status.conditions.push(Condition {
        r#type: t,
        status: value,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now(),
    });
}

/// The six-rule precedence table from spec.md §4.1. `active_op` is the
/// operation referenced by `status.active_operation_id`, if the caller was
/// able to resolve it; per rule 3, an unresolved active id is treated
/// conservatively as still active.
pub fn compute_effective_state(status: &MachineStatus, active_op: Option<&Operation>) -> EffectiveState {
    if status.condition_is(ConditionType::Retired) || status.condition_is(ConditionType::Rma) {
        return EffectiveState::Blocked;
    }

    if status.condition_is(ConditionType::NeedsIntervention) {
        return EffectiveState::Attention;
    }

    if status.active_operation_id.is_some()
        && active_op.map(|op| op.phase.is_active()).unwrap_or(true)
    {
        return EffectiveState::Busy;
    }

    match status.phase {
        Phase::Maintenance => EffectiveState::MaintenanceIdle,
        Phase::FactoryReady => EffectiveState::New,
        _ => EffectiveState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MachineId, OperationId, OperationPhase, OperationType, RequestId};

    fn op(phase: OperationPhase) -> Operation {
        let mut op = Operation::new(
            OperationId::new(),
            MachineId::new(),
            OperationType::Reboot,
            RequestId("r1".into()),
        );
        op.phase = phase;
        op
    }

    #[test]
    fn set_condition_appends_then_updates_without_bumping_timestamp_if_unchanged() {
        let mut status = MachineStatus::default();
        set_condition(&mut status, ConditionType::NeedsIntervention, true, "RunFailed", "m1");
        let first_ts = status.condition(ConditionType::NeedsIntervention).unwrap().last_transition_time;

        set_condition(&mut status, ConditionType::NeedsIntervention, true, "RunFailed", "m2");
        let second = status.condition(ConditionType::NeedsIntervention).unwrap();
        assert_eq!(second.message, "m2");
        assert_eq!(second.last_transition_time, first_ts);
    }

    #[test]
    fn set_condition_bumps_timestamp_when_status_flips() {
        let mut status = MachineStatus::default();
        set_condition(&mut status, ConditionType::NeedsIntervention, true, "RunFailed", "m1");
        let first_ts = status.condition(ConditionType::NeedsIntervention).unwrap().last_transition_time;

        std::thread::sleep(std::time::Duration::from_millis(2));
        set_condition(&mut status, ConditionType::NeedsIntervention, false, "Cleared", "m2");
        let second = status.condition(ConditionType::NeedsIntervention).unwrap();
        assert!(second.last_transition_time > first_ts);
    }

    #[test]
    fn precedence_blocked_beats_everything() {
        let mut status = MachineStatus::default();
        set_condition(&mut status, ConditionType::Rma, true, "R", "m");
        set_condition(&mut status, ConditionType::NeedsIntervention, true, "R", "m");
        status.active_operation_id = Some(OperationId::new());
        assert_eq!(compute_effective_state(&status, None), EffectiveState::Blocked);
    }

    #[test]
    fn precedence_attention_beats_busy() {
        let mut status = MachineStatus::default();
        set_condition(&mut status, ConditionType::NeedsIntervention, true, "R", "m");
        status.active_operation_id = Some(OperationId::new());
        assert_eq!(compute_effective_state(&status, None), EffectiveState::Attention);
    }

    #[test]
    fn busy_when_active_op_unresolved() {
        let mut status = MachineStatus::default();
        status.active_operation_id = Some(OperationId::new());
        assert_eq!(compute_effective_state(&status, None), EffectiveState::Busy);
    }

    #[test]
    fn busy_when_active_op_resolved_and_running() {
        let mut status = MachineStatus::default();
        let running = op(OperationPhase::Running);
        status.active_operation_id = Some(running.id);
        assert_eq!(compute_effective_state(&status, Some(&running)), EffectiveState::Busy);
    }

    #[test]
    fn not_busy_when_active_op_resolved_and_terminal() {
        let mut status = MachineStatus::default();
        let done = op(OperationPhase::Succeeded);
        status.active_operation_id = Some(done.id);
        status.phase = Phase::Ready;
        assert_eq!(compute_effective_state(&status, Some(&done)), EffectiveState::Idle);
    }

    #[test]
    fn maintenance_idle_and_new_and_idle() {
        let mut status = MachineStatus::default();
        status.phase = Phase::Maintenance;
        assert_eq!(compute_effective_state(&status, None), EffectiveState::MaintenanceIdle);

        status.phase = Phase::FactoryReady;
        assert_eq!(compute_effective_state(&status, None), EffectiveState::New);

        status.phase = Phase::Ready;
        assert_eq!(compute_effective_state(&status, None), EffectiveState::Idle);
    }

    #[test]
    fn pure_function_is_deterministic() {
        let status = MachineStatus::default();
        assert_eq!(
            compute_effective_state(&status, None),
            compute_effective_state(&status, None)
        );
    }
}
