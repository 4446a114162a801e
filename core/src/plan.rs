//! Process-wide catalog of named step sequences (spec.md §4.2). Not part of
//! the external contract — operations only ever expose `current_stage`.
//!
//! Modeled as a read-mostly map guarded by an `RwLock`, the same shape
//! `storage/src/replication.rs` uses for its `RoutingTable`/`ShardRuntime`:
//! reads (plan lookups on every operation admission) vastly outnumber writes
//! (plan registration at startup).

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    SetNetboot,
    Reboot,
    RepaveImage,
    MintJoinAndJoin,
    VerifyInCluster,
    RemoteExec,
    NetReconfig,
    RmaMark,
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub name: String,
    pub kind: StepKind,
    pub timeout_seconds: i64,
    pub max_retries: u32,
}

impl PlanStep {
    pub fn new(name: &str, kind: StepKind, timeout_seconds: i64, max_retries: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            timeout_seconds,
            max_retries,
        }
    }

    /// Per spec.md §8 boundary behavior: `max_retries=0` means "at least one
    /// attempt".
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Per spec.md §8 boundary behavior: `timeout_seconds <= 0` falls back to
    /// a documented 5 minute default.
    pub fn effective_timeout(&self) -> std::time::Duration {
        if self.timeout_seconds <= 0 {
            std::time::Duration::from_secs(5 * 60)
        } else {
            std::time::Duration::from_secs(self.timeout_seconds as u64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub steps: Vec<PlanStep>,
}

pub struct PlanRegistry {
    plans: RwLock<HashMap<String, Plan>>,
}

impl PlanRegistry {
    pub fn with_builtins() -> Self {
        let registry = Self {
            plans: RwLock::new(HashMap::new()),
        };
        for plan in builtin_plans() {
            registry.register(plan);
        }
        registry
    }

    /// Registers a plan, overwriting any existing plan with the same id.
    /// Available at startup for custom plans (spec.md §4.2).
    pub fn register(&self, plan: Plan) {
        self.plans.write().expect("plan registry poisoned").insert(plan.id.clone(), plan);
    }

    /// Returns a deep clone so callers cannot mutate shared state.
    pub fn get(&self, id: &str) -> Option<Plan> {
        self.plans.read().expect("plan registry poisoned").get(id).cloned()
    }
}

fn builtin_plans() -> Vec<Plan> {
    vec![
        Plan {
            id: "reboot".into(),
            steps: vec![PlanStep::new("reboot", StepKind::Reboot, 300, 1)],
        },
        Plan {
            id: "reimage".into(),
            steps: vec![
                PlanStep::new("set-netboot", StepKind::SetNetboot, 60, 3),
                PlanStep::new("reboot-to-netboot", StepKind::Reboot, 300, 2),
                PlanStep::new("repave-image", StepKind::RepaveImage, 900, 2),
                PlanStep::new("mint-join-and-join", StepKind::MintJoinAndJoin, 300, 3),
                PlanStep::new("verify-in-cluster", StepKind::VerifyInCluster, 300, 3),
            ],
        },
        Plan {
            id: "maintenance-enter".into(),
            steps: vec![PlanStep::new("mark-maintenance", StepKind::RemoteExec, 60, 1)],
        },
        Plan {
            id: "maintenance-exit".into(),
            // A plain readiness probe, not a cluster-membership check: exiting
            // maintenance must not require a `target_cluster` to be set.
            steps: vec![PlanStep::new("verify-ready", StepKind::RemoteExec, 120, 2)],
        },
        Plan {
            id: "rma".into(),
            steps: vec![
                PlanStep::new("drain-check", StepKind::RemoteExec, 120, 2),
                PlanStep::new("graceful-shutdown", StepKind::Reboot, 300, 1),
                PlanStep::new("mark-rma", StepKind::RmaMark, 60, 1),
            ],
        },
        Plan {
            id: "net-reconfig".into(),
            steps: vec![PlanStep::new("net-reconfig", StepKind::NetReconfig, 120, 2)],
        },
        Plan {
            id: "upgrade".into(),
            steps: vec![
                PlanStep::new("pre-check", StepKind::RemoteExec, 120, 2),
                PlanStep::new("repave-image", StepKind::RepaveImage, 900, 2),
                PlanStep::new("verify-in-cluster", StepKind::VerifyInCluster, 300, 3),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_independent_clones() {
        let registry = PlanRegistry::with_builtins();
        let mut a = registry.get("reboot").unwrap();
        a.steps.clear();
        let b = registry.get("reboot").unwrap();
        assert_eq!(b.steps.len(), 1);
    }

    #[test]
    fn unknown_plan_is_none() {
        let registry = PlanRegistry::with_builtins();
        assert!(registry.get("does-not-exist").is_none());
    }

    #[test]
    fn custom_registration_is_visible() {
        let registry = PlanRegistry::with_builtins();
        registry.register(Plan {
            id: "custom".into(),
            steps: vec![PlanStep::new("noop", StepKind::RemoteExec, 30, 1)],
        });
        assert!(registry.get("custom").is_some());
    }

    #[test]
    fn zero_retries_means_at_least_one_attempt() {
        let step = PlanStep::new("x", StepKind::Reboot, 10, 0);
        assert_eq!(step.effective_max_retries(), 1);
    }

    #[test]
    fn non_positive_timeout_falls_back_to_five_minutes() {
        let step = PlanStep::new("x", StepKind::Reboot, 0, 1);
        assert_eq!(step.effective_timeout(), std::time::Duration::from_secs(300));
        let step = PlanStep::new("x", StepKind::Reboot, -5, 1);
        assert_eq!(step.effective_timeout(), std::time::Duration::from_secs(300));
    }
}
