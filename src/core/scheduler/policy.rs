//! Pluggable adjustments applied to effective priorities before ranking.
//!
//! Policies run in registration order over a view of every pending task. They
//! only adjust `score` and `ready`; the queue sorts the result.

use std::collections::HashMap;

use crate::config::SchedulerConfig;
use crate::util::serde::TaskId;

const DEADLINE_BONUS: f64 = 30.0;
const DEADLINE_HORIZON_SECS: f64 = 3600.0;
const CROWDED_GROUP_BONUS: f64 = 10.0;
const LONG_WAIT_BONUS: f64 = 15.0;
const HIGH_LOAD_MALUS: f64 = 20.0;
const LOW_LOAD_BONUS: f64 = 10.0;

/// A pending task as seen by policies.
#[derive(Debug, Clone)]
pub struct TaskView {
    /// Task id.
    pub id: TaskId,
    /// Score so far; starts at the effective priority.
    pub score: f64,
    /// Whether the task may be dispatched.
    pub ready: bool,
    /// Whether every dependency is satisfied.
    pub deps_satisfied: bool,
    /// Seconds in the queue.
    pub waited_secs: f64,
    /// Seconds to the deadline, negative once passed.
    pub secs_to_deadline: Option<f64>,
    /// Submitting user.
    pub user: Option<String>,
    /// Submitting group.
    pub group: Option<String>,
    /// Mean requested share across compute, memory and attention.
    pub resource_cost: f64,
}

/// System-wide inputs shared by all policies in one pass.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Current time.
    pub now_ms: u128,
    /// Mean utilization across resource kinds in [0, 1].
    pub system_load: f64,
    /// Pending tasks per user.
    pub pending_per_user: HashMap<String, usize>,
    /// Pending tasks per group.
    pub pending_per_group: HashMap<String, usize>,
    /// Load above which cheap tasks are favoured.
    pub high_load_threshold: f64,
    /// Load below which expensive tasks are favoured.
    pub low_load_threshold: f64,
    /// Pending count above which a user or group is boosted.
    pub fairness_pending_threshold: usize,
    /// Wait at which the long-wait boost saturates.
    pub fairness_wait_threshold_secs: f64,
}

impl PolicyContext {
    /// Context seeded with thresholds from `config`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_config(config: &SchedulerConfig, now_ms: u128, system_load: f64) -> Self {
        Self {
            now_ms,
            system_load,
            pending_per_user: HashMap::new(),
            pending_per_group: HashMap::new(),
            high_load_threshold: config.high_load_threshold,
            low_load_threshold: config.low_load_threshold,
            fairness_pending_threshold: config.fairness_pending_threshold,
            fairness_wait_threshold_secs: config.fairness_wait_threshold_secs.max(1) as f64,
        }
    }

    /// Count pending tasks per user and group.
    pub fn count_pending(&mut self, views: &[TaskView]) {
        for view in views {
            if let Some(user) = &view.user {
                *self.pending_per_user.entry(user.clone()).or_default() += 1;
            }
            if let Some(group) = &view.group {
                *self.pending_per_group.entry(group.clone()).or_default() += 1;
            }
        }
    }
}

/// A scoring adjustment.
pub trait SchedulingPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Adjust the views in place.
    fn apply(&self, ctx: &PolicyContext, views: &mut [TaskView]);
}

/// Boosts tasks as their deadline nears.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlinePolicy;

impl SchedulingPolicy for DeadlinePolicy {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn apply(&self, _ctx: &PolicyContext, views: &mut [TaskView]) {
        for view in views.iter_mut() {
            let Some(remaining) = view.secs_to_deadline else {
                continue;
            };
            let urgency = if remaining <= 0.0 {
                1.0
            } else {
                (1.0 - remaining / DEADLINE_HORIZON_SECS).max(0.0)
            };
            view.score += DEADLINE_BONUS * urgency;
        }
    }
}

/// Boosts crowded users and groups, and long waiters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairnessPolicy;

impl SchedulingPolicy for FairnessPolicy {
    fn name(&self) -> &'static str {
        "fairness"
    }

    fn apply(&self, ctx: &PolicyContext, views: &mut [TaskView]) {
        let crowded = |counts: &HashMap<String, usize>, key: &Option<String>| {
            key.as_ref()
                .and_then(|k| counts.get(k))
                .is_some_and(|n| *n > ctx.fairness_pending_threshold)
        };
        for view in views.iter_mut() {
            if crowded(&ctx.pending_per_user, &view.user)
                || crowded(&ctx.pending_per_group, &view.group)
            {
                view.score += CROWDED_GROUP_BONUS;
            }
            let wait = (view.waited_secs / ctx.fairness_wait_threshold_secs).min(1.0);
            view.score += LONG_WAIT_BONUS * wait;
        }
    }
}

/// Favours cheap tasks under load and expensive ones when idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalancingPolicy;

impl SchedulingPolicy for LoadBalancingPolicy {
    fn name(&self) -> &'static str {
        "load_balancing"
    }

    fn apply(&self, ctx: &PolicyContext, views: &mut [TaskView]) {
        let adjust = if ctx.system_load > ctx.high_load_threshold {
            -HIGH_LOAD_MALUS
        } else if ctx.system_load < ctx.low_load_threshold {
            LOW_LOAD_BONUS
        } else {
            return;
        };
        for view in views.iter_mut() {
            view.score += adjust * view.resource_cost;
        }
    }
}

/// Holds back tasks whose dependencies are not yet satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyPolicy;

impl SchedulingPolicy for DependencyPolicy {
    fn name(&self) -> &'static str {
        "dependency"
    }

    fn apply(&self, _ctx: &PolicyContext, views: &mut [TaskView]) {
        for view in views.iter_mut() {
            view.ready = view.deps_satisfied;
        }
    }
}

/// The four built-in policies in their default order.
#[must_use]
pub fn default_policies() -> Vec<Box<dyn SchedulingPolicy>> {
    vec![
        Box::new(DeadlinePolicy),
        Box::new(FairnessPolicy),
        Box::new(DependencyPolicy),
        Box::new(LoadBalancingPolicy),
    ]
}
