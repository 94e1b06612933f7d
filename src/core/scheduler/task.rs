//! Tasks, their dependencies and the effective priority function.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::model::{Metadata, ResourceRequirements};
use crate::util::clock::secs_between;
use crate::util::serde::{AllocationId, Priority, TaskId};

/// Starvation bonus ceiling and the wait over which it is reached.
pub const MAX_STARVATION_BONUS: f64 = 20.0;
const STARVATION_WINDOW_SECS: f64 = 3600.0;
/// Deadline bonus ceiling, reached once the deadline has passed.
pub const MAX_DEADLINE_BONUS: f64 = 50.0;
const DEADLINE_WINDOW_SECS: f64 = 3600.0;
const IMPORTANCE_BONUS: f64 = 15.0;
const FAIRNESS_BONUS: f64 = 10.0;
const DEPENDENCY_BONUS: f64 = 10.0;
const PREEMPTION_PENALTY: f64 = 5.0;
const MAX_PREEMPTION_PENALTY: f64 = 15.0;

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue.
    Pending,
    /// Chosen for dispatch; resources being acquired.
    Scheduled,
    /// Holding resources.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error or timed out.
    Failed,
    /// Displaced by higher priority work; about to re-enter the queue.
    Preempted,
    /// Withdrawn by the caller.
    Cancelled,
}

impl TaskState {
    /// Whether the task can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Preempted => "preempted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What a dependency waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The target completed successfully.
    Completion,
    /// The target started running.
    Start,
    /// The target gave its resources back, however it ended.
    Resource,
}

impl DependencyKind {
    /// Whether a target in `state` satisfies this kind of edge.
    #[must_use]
    pub const fn satisfied_by(self, state: TaskState) -> bool {
        match self {
            Self::Completion => matches!(state, TaskState::Completed),
            Self::Start => matches!(state, TaskState::Running | TaskState::Completed),
            Self::Resource => state.is_terminal(),
        }
    }

    /// Whether a target in `state` can never satisfy this edge.
    #[must_use]
    pub const fn unsatisfiable_by(self, state: TaskState) -> bool {
        match self {
            Self::Completion => matches!(state, TaskState::Failed | TaskState::Cancelled),
            Self::Start => matches!(state, TaskState::Cancelled),
            Self::Resource => false,
        }
    }
}

/// An edge to another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Task waited on.
    pub task_id: TaskId,
    /// What is waited for.
    pub kind: DependencyKind,
    /// Whether the condition has been met.
    pub satisfied: bool,
}

/// Submission parameters for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human readable name.
    pub name: String,
    /// Resources to acquire when dispatched.
    pub requirements: ResourceRequirements,
    /// Edges to existing tasks.
    pub dependencies: Vec<(TaskId, DependencyKind)>,
    /// Importance in [0, 1].
    pub importance: f64,
    /// Urgency in [0, 1].
    pub urgency: f64,
    /// Submitting user, for fairness.
    pub user: Option<String>,
    /// Submitting group, for fairness.
    pub group: Option<String>,
}

impl TaskSpec {
    /// A task named `name` that needs `requirements`.
    #[must_use]
    pub fn new(name: impl Into<String>, requirements: ResourceRequirements) -> Self {
        Self {
            name: name.into(),
            requirements,
            dependencies: Vec::new(),
            importance: 0.5,
            urgency: 0.5,
            user: None,
            group: None,
        }
    }

    /// Set an absolute deadline.
    #[must_use]
    pub const fn with_deadline_ms(mut self, deadline_ms: u128) -> Self {
        self.requirements.deadline_ms = Some(deadline_ms);
        self
    }

    /// Wait on `task_id`.
    #[must_use]
    pub fn depends_on(mut self, task_id: impl Into<TaskId>, kind: DependencyKind) -> Self {
        self.dependencies.push((task_id.into(), kind));
        self
    }

    /// Set importance.
    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Set urgency.
    #[must_use]
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = urgency.clamp(0.0, 1.0);
        self
    }

    /// Set the submitting user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the submitting group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Human readable name.
    pub name: String,
    /// Resources acquired when dispatched.
    pub requirements: ResourceRequirements,
    /// Current state.
    pub state: TaskState,
    /// Edges to other tasks.
    pub dependencies: Vec<Dependency>,
    /// Tasks waiting on this one.
    pub dependents: BTreeSet<TaskId>,
    /// Importance in [0, 1].
    pub importance: f64,
    /// Urgency in [0, 1].
    pub urgency: f64,
    /// Submitting user.
    pub user: Option<String>,
    /// Submitting group.
    pub group: Option<String>,
    /// Times this task has been preempted.
    pub preemption_count: u32,
    /// Submission time.
    pub submitted_at_ms: u128,
    /// Last time the task entered the queue.
    pub queued_at_ms: u128,
    /// Last dispatch time.
    pub started_at_ms: Option<u128>,
    /// Time the task reached a terminal state.
    pub finished_at_ms: Option<u128>,
    /// Allocation held while running.
    pub allocation_id: Option<AllocationId>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Caller metadata.
    pub metadata: Metadata,
}

impl Task {
    pub(crate) fn from_spec(id: TaskId, spec: TaskSpec, now_ms: u128) -> Self {
        Self {
            id,
            name: spec.name,
            metadata: spec.requirements.metadata.clone(),
            requirements: spec.requirements,
            state: TaskState::Pending,
            dependencies: spec
                .dependencies
                .into_iter()
                .map(|(task_id, kind)| Dependency {
                    task_id,
                    kind,
                    satisfied: false,
                })
                .collect(),
            dependents: BTreeSet::new(),
            importance: spec.importance,
            urgency: spec.urgency,
            user: spec.user,
            group: spec.group,
            preemption_count: 0,
            submitted_at_ms: now_ms,
            queued_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
            allocation_id: None,
            error: None,
        }
    }

    /// Base priority of the request.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.requirements.priority
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub const fn deadline_ms(&self) -> Option<u128> {
        self.requirements.deadline_ms
    }

    /// Whether every dependency is satisfied.
    #[must_use]
    pub fn dependencies_satisfied(&self) -> bool {
        self.dependencies.iter().all(|d| d.satisfied)
    }

    /// Seconds spent in the queue since it last entered it.
    #[must_use]
    pub fn waited_secs(&self, now_ms: u128) -> f64 {
        secs_between(self.queued_at_ms, now_ms)
    }

    /// Seconds until the deadline; negative once it has passed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn secs_to_deadline(&self, now_ms: u128) -> Option<f64> {
        self.deadline_ms().map(|deadline| {
            if deadline >= now_ms {
                (deadline - now_ms) as f64 / 1000.0
            } else {
                -((now_ms - deadline) as f64 / 1000.0)
            }
        })
    }

    /// Mean share requested across compute, memory and attention.
    #[must_use]
    pub fn resource_cost(&self) -> f64 {
        let r = &self.requirements;
        (r.compute + r.memory + r.attention) / 3.0
    }
}

/// Breakdown of a task's effective priority.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriorityFactors {
    /// Base value of the priority class.
    pub base: f64,
    /// Bonus for time spent waiting.
    pub starvation: f64,
    /// Bonus for an approaching or missed deadline.
    pub deadline: f64,
    /// Bonus for importance and urgency.
    pub importance: f64,
    /// Bonus or malus from the user's dispatch share.
    pub fairness: f64,
    /// Bonus once dependencies are satisfied.
    pub dependency: f64,
    /// Malus for previous preemptions.
    pub preemption_penalty: f64,
}

impl PriorityFactors {
    /// Sum of the factors.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.base + self.starvation + self.deadline + self.importance + self.fairness
            + self.dependency
            - self.preemption_penalty
    }
}

/// Compute the effective priority of `task` at `now_ms`.
///
/// `fairness` is the submitting user's fairness factor in [-1, 1].
#[must_use]
pub fn effective_priority(task: &Task, now_ms: u128, fairness: f64) -> PriorityFactors {
    let starvation =
        (MAX_STARVATION_BONUS * task.waited_secs(now_ms) / STARVATION_WINDOW_SECS).min(MAX_STARVATION_BONUS);
    let deadline = match task.secs_to_deadline(now_ms) {
        Some(remaining) if remaining <= 0.0 => MAX_DEADLINE_BONUS,
        Some(remaining) if remaining < DEADLINE_WINDOW_SECS => {
            MAX_DEADLINE_BONUS * (1.0 - remaining / DEADLINE_WINDOW_SECS).powi(2)
        }
        _ => 0.0,
    };
    let preemptions = f64::from(task.preemption_count);
    PriorityFactors {
        base: task.priority().value(),
        starvation,
        deadline,
        importance: IMPORTANCE_BONUS * 0.5f64.mul_add(task.importance, 0.5 * task.urgency),
        fairness: FAIRNESS_BONUS * fairness.clamp(-1.0, 1.0),
        dependency: if task.dependencies_satisfied() {
            DEPENDENCY_BONUS
        } else {
            0.0
        },
        preemption_penalty: (PREEMPTION_PENALTY * preemptions).min(MAX_PREEMPTION_PENALTY),
    }
}

/// Fairness factor of a user: `clamp((mean − user) / mean, −1, 1)` over
/// dispatch counts; zero when nothing has been dispatched yet.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fairness_factor(user_dispatches: u64, mean_dispatches: f64) -> f64 {
    if mean_dispatches <= 0.0 {
        return 0.0;
    }
    ((mean_dispatches - user_dispatches as f64) / mean_dispatches).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority, at: u128) -> Task {
        Task::from_spec(
            "t".into(),
            TaskSpec::new("t", ResourceRequirements::new(priority)).with_importance(0.0).with_urgency(0.0),
            at,
        )
    }

    #[test]
    fn base_values_follow_priority() {
        let high = effective_priority(&task(Priority::High, 0), 0, 0.0);
        let low = effective_priority(&task(Priority::Low, 0), 0, 0.0);
        assert!((high.total() - 90.0).abs() < 1e-9);
        assert!((low.total() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn starvation_is_capped() {
        let t = task(Priority::Low, 0);
        assert!((effective_priority(&t, 1_800_000, 0.0).starvation - 10.0).abs() < 1e-9);
        assert!((effective_priority(&t, 36_000_000, 0.0).starvation - 20.0).abs() < 1e-9);
    }

    #[test]
    fn deadline_bonus_is_quadratic_then_flat() {
        let mut t = task(Priority::Medium, 0);
        t.requirements.deadline_ms = Some(3_600_000);
        assert!(effective_priority(&t, 0, 0.0).deadline.abs() < 1e-9);
        assert!((effective_priority(&t, 1_800_000, 0.0).deadline - 12.5).abs() < 1e-9);
        assert!((effective_priority(&t, 4_000_000, 0.0).deadline - 50.0).abs() < 1e-9);
    }

    #[test]
    fn preemption_penalty_is_capped() {
        let mut t = task(Priority::Medium, 0);
        t.preemption_count = 5;
        assert!((effective_priority(&t, 0, 0.0).preemption_penalty - 15.0).abs() < 1e-9);
    }

    #[test]
    fn fairness_favours_under_served_users() {
        assert!((fairness_factor(0, 2.0) - 1.0).abs() < 1e-9);
        assert!((fairness_factor(6, 2.0) + 1.0).abs() < 1e-9);
        assert!(fairness_factor(3, 0.0).abs() < 1e-9);
    }

    #[test]
    fn dependency_kinds() {
        assert!(DependencyKind::Start.satisfied_by(TaskState::Running));
        assert!(!DependencyKind::Completion.satisfied_by(TaskState::Running));
        assert!(DependencyKind::Resource.satisfied_by(TaskState::Failed));
        assert!(DependencyKind::Completion.unsatisfiable_by(TaskState::Failed));
    }
}
