//! Priority scheduler.
//!
//! Tasks wait in a [`PendingQueue`] ordered by a recomputed effective
//! priority adjusted by [`SchedulingPolicy`] implementations. A scheduling
//! pass dispatches the best ready tasks while running slots remain, acquiring
//! resources through a [`ResourceBroker`]. HIGH and CRITICAL tasks may displace
//! lower priority running work with [`PriorityScheduler::preempt`].
//!
//! The scheduler never holds its lock while talking to the broker or the
//! runner; a task is parked in `Scheduled` while its resources are acquired
//! and re-checked afterwards.

pub mod policy;
pub mod queue;
pub mod task;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::core::allocator::CAPACITY_EPSILON;
use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::model::{ResourceAllocation, ResourceRequirements, ResourceUtilization};
use crate::runtime::Spawn;
use crate::util::clock::{secs_to_ms, Clock};
use crate::util::serde::{new_id, AllocationId, TaskId};

pub use policy::{
    default_policies, DeadlinePolicy, DependencyPolicy, FairnessPolicy, LoadBalancingPolicy,
    PolicyContext, SchedulingPolicy, TaskView,
};
pub use queue::{PendingQueue, RankedTask};
pub use task::{
    effective_priority, fairness_factor, Dependency, DependencyKind, PriorityFactors, Task,
    TaskSpec, TaskState,
};

const COMPONENT: &str = "scheduler";
/// Metadata key linking an allocation to the task that holds it.
pub const TASK_ID_KEY: &str = "task_id";

/// Where the scheduler gets resources from.
pub trait ResourceBroker: Send + Sync {
    /// Acquire resources for a task.
    ///
    /// # Errors
    /// Capacity or lifecycle errors from the underlying allocators.
    fn acquire(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError>;

    /// Give an allocation back. Unknown ids return `Ok(false)`.
    ///
    /// # Errors
    /// Lifecycle errors from the underlying allocators.
    fn relinquish(&self, allocation_id: &str) -> Result<bool, ResourceError>;

    /// Free share of each resource kind.
    fn headroom(&self) -> ResourceUtilization;

    /// Mean utilization across resource kinds in [0, 1].
    fn system_load(&self) -> f64;
}

/// Executes a started task. The scheduler completes or fails the task with
/// the result.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `task` holding `allocation`.
    async fn run(&self, task: Task, allocation: ResourceAllocation) -> Result<(), String>;
}

/// Boxed future handed to the spawner.
pub type BoxedTaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type SpawnFn = Arc<dyn Fn(BoxedTaskFuture) + Send + Sync>;

#[derive(Clone)]
struct Dispatcher {
    runner: Arc<dyn TaskRunner>,
    spawn: SpawnFn,
}

/// Result of [`PriorityScheduler::preempt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PreemptionOutcome {
    /// The task is running; `victims` went back to pending.
    Admitted {
        /// Tasks displaced to make room.
        victims: Vec<TaskId>,
    },
    /// Running lower priority work could not cover the shortfall. Nothing
    /// was displaced and the task stays pending.
    Insufficient,
    /// The task's dependencies are not satisfied yet.
    Blocked,
    /// Preemption is turned off in configuration.
    Disabled,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks moved to running.
    pub dispatched: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed, timeouts included.
    pub failed: u64,
    /// Tasks cancelled, cascades included.
    pub cancelled: u64,
    /// Running tasks displaced by preemption.
    pub preemptions: u64,
    /// Running tasks failed by the timeout sweep.
    pub timeouts: u64,
    /// Tasks currently pending.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Mean seconds from submission to first dispatch.
    pub average_wait_secs: f64,
}

#[derive(Debug)]
struct SchedulerState {
    lifecycle: Lifecycle,
    tasks: HashMap<TaskId, Task>,
    queue: PendingQueue,
    running: BTreeSet<TaskId>,
    /// Tasks marked scheduled whose acquire has not returned yet.
    dispatching: BTreeSet<TaskId>,
    dispatches: HashMap<String, u64>,
    stats: SchedulerStats,
    total_wait_ms: u128,
}

impl SchedulerState {
    /// Slots held by running tasks and by dispatches still acquiring.
    fn occupied_slots(&self) -> usize {
        self.running.len() + self.dispatching.len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn fairness(&self, task: &Task) -> f64 {
        let Some(user) = &task.user else {
            return 0.0;
        };
        if self.dispatches.is_empty() {
            return 0.0;
        }
        let mean = self.dispatches.values().sum::<u64>() as f64 / self.dispatches.len() as f64;
        fairness_factor(self.dispatches.get(user).copied().unwrap_or(0), mean)
    }

    fn view(&self, task: &Task, now_ms: u128) -> TaskView {
        TaskView {
            id: task.id.clone(),
            score: effective_priority(task, now_ms, self.fairness(task)).total(),
            ready: task.dependencies_satisfied(),
            deps_satisfied: task.dependencies_satisfied(),
            waited_secs: task.waited_secs(now_ms),
            secs_to_deadline: task.secs_to_deadline(now_ms),
            user: task.user.clone(),
            group: task.group.clone(),
            resource_cost: task.resource_cost(),
        }
    }

    fn ranked(&self, task: &Task, now_ms: u128) -> RankedTask {
        let view = self.view(task, now_ms);
        RankedTask {
            id: view.id,
            ready: view.ready,
            score: view.score,
            queued_at_ms: task.queued_at_ms,
        }
    }

    /// Recompute every pending task's score and rebuild the queue.
    fn rank(&mut self, policies: &[Box<dyn SchedulingPolicy>], mut ctx: PolicyContext) {
        let now_ms = ctx.now_ms;
        let mut views: Vec<TaskView> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| self.view(t, now_ms))
            .collect();
        ctx.count_pending(&views);
        for policy in policies {
            policy.apply(&ctx, &mut views);
        }
        let ranked = views
            .into_iter()
            .map(|v| RankedTask {
                queued_at_ms: self.tasks.get(&v.id).map_or(0, |t| t.queued_at_ms),
                id: v.id,
                ready: v.ready,
                score: v.score,
            })
            .collect();
        self.queue.rebuild(ranked);
    }

    fn requeue(&mut self, id: &str, now_ms: u128) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.state = TaskState::Pending;
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let entry = self.ranked(task, now_ms);
        if let Err(err) = self.queue.push(entry) {
            warn!(task_id = %id, error = %err, "failed to requeue task");
        }
    }

    fn start(&mut self, id: &str, allocation_id: AllocationId, now_ms: u128) -> Option<Task> {
        let task = self.tasks.get_mut(id)?;
        task.state = TaskState::Running;
        task.allocation_id = Some(allocation_id);
        let first_dispatch = task.started_at_ms.is_none();
        task.started_at_ms = Some(now_ms);
        let started = task.clone();
        self.running.insert(id.to_string());
        if let Some(user) = &started.user {
            *self.dispatches.entry(user.clone()).or_default() += 1;
        }
        self.stats.dispatched += 1;
        if first_dispatch {
            self.total_wait_ms += now_ms.saturating_sub(started.submitted_at_ms);
        }
        self.propagate(id, now_ms);
        Some(started)
    }

    /// Apply the state of `id` to the edges of its dependents, cancelling
    /// those that can no longer run. Returns allocations to give back.
    fn propagate(&mut self, id: &str, now_ms: u128) -> Vec<AllocationId> {
        let mut released = Vec::new();
        let mut worklist = VecDeque::from([id.to_string()]);
        while let Some(changed_id) = worklist.pop_front() {
            let Some(changed) = self.tasks.get(&changed_id) else {
                continue;
            };
            let new_state = changed.state;
            let dependents: Vec<TaskId> = changed.dependents.iter().cloned().collect();
            for dependent_id in dependents {
                let Some(dependent) = self.tasks.get_mut(&dependent_id) else {
                    continue;
                };
                if dependent.state.is_terminal() {
                    continue;
                }
                let mut doomed = false;
                for edge in dependent
                    .dependencies
                    .iter_mut()
                    .filter(|e| e.task_id == changed_id && !e.satisfied)
                {
                    if edge.kind.satisfied_by(new_state) {
                        edge.satisfied = true;
                    } else if edge.kind.unsatisfiable_by(new_state) {
                        doomed = true;
                    }
                }
                if !doomed {
                    continue;
                }
                dependent.state = TaskState::Cancelled;
                dependent.error = Some(format!("dependency {changed_id} {new_state}"));
                dependent.finished_at_ms = Some(now_ms);
                released.extend(dependent.allocation_id.take());
                self.queue.remove(&dependent_id);
                self.running.remove(&dependent_id);
                self.stats.cancelled += 1;
                warn!(
                    task_id = %dependent_id,
                    dependency = %changed_id,
                    dependency_state = %new_state,
                    "task cancelled by dependency"
                );
                worklist.push_back(dependent_id);
            }
        }
        released
    }

    /// Move `id` to a terminal state. `Ok(None)` when the transition does not
    /// apply.
    fn finish(
        &mut self,
        id: &str,
        to: TaskState,
        reason: Option<String>,
        now_ms: u128,
    ) -> Result<Option<Vec<AllocationId>>, ResourceError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ResourceError::not_found("task", id))?;
        if task.state.is_terminal() || (to == TaskState::Completed && task.state != TaskState::Running)
        {
            return Ok(None);
        }
        task.state = to;
        task.error = reason;
        task.finished_at_ms = Some(now_ms);
        let mut released: Vec<AllocationId> = task.allocation_id.take().into_iter().collect();
        self.running.remove(id);
        self.dispatching.remove(id);
        self.queue.remove(id);
        match to {
            TaskState::Completed => self.stats.completed += 1,
            TaskState::Failed => self.stats.failed += 1,
            TaskState::Cancelled => self.stats.cancelled += 1,
            _ => {}
        }
        released.extend(self.propagate(id, now_ms));
        Ok(Some(released))
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot_stats(&self) -> SchedulerStats {
        let first_dispatches = self
            .tasks
            .values()
            .filter(|t| t.started_at_ms.is_some())
            .count();
        SchedulerStats {
            pending: self
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Pending)
                .count(),
            running: self.running.len(),
            average_wait_secs: if first_dispatches == 0 {
                0.0
            } else {
                self.total_wait_ms as f64 / 1000.0 / first_dispatches as f64
            },
            ..self.stats.clone()
        }
    }
}

fn dispatch_requirements(task: &Task) -> ResourceRequirements {
    let mut req = task.requirements.clone();
    req.metadata.insert(TASK_ID_KEY.into(), task.id.clone());
    req
}

struct SchedulerInner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    broker: Arc<dyn ResourceBroker>,
    policies: Vec<Box<dyn SchedulingPolicy>>,
    state: Mutex<SchedulerState>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

/// Cloneable handle to a priority scheduler.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
}

impl PriorityScheduler {
    /// Scheduler with the built-in policies.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn new(
        config: SchedulerConfig,
        broker: Arc<dyn ResourceBroker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResourceError> {
        Self::with_policies(config, broker, clock, default_policies())
    }

    /// Scheduler applying `policies` in order.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn with_policies(
        config: SchedulerConfig,
        broker: Arc<dyn ResourceBroker>,
        clock: Arc<dyn Clock>,
        policies: Vec<Box<dyn SchedulingPolicy>>,
    ) -> Result<Self, ResourceError> {
        config.validate().map_err(ResourceError::InvalidConfig)?;
        let queue = PendingQueue::new(config.max_queue_depth);
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    lifecycle: Lifecycle::Initialized,
                    tasks: HashMap::new(),
                    queue,
                    running: BTreeSet::new(),
                    dispatching: BTreeSet::new(),
                    dispatches: HashMap::new(),
                    stats: SchedulerStats::default(),
                    total_wait_ms: 0,
                }),
                config,
                clock,
                broker,
                policies,
                dispatcher: Mutex::new(None),
            }),
        })
    }

    /// Execute started tasks with `runner`, spawned through `spawner`.
    pub fn set_runner<S>(&self, runner: Arc<dyn TaskRunner>, spawner: S)
    where
        S: Spawn + Send + Sync + 'static,
    {
        let spawn: SpawnFn = Arc::new(move |fut: BoxedTaskFuture| spawner.spawn(fut));
        *self.inner.dispatcher.lock() = Some(Dispatcher { runner, spawn });
    }

    /// Scheduler configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Begin accepting and dispatching tasks.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        state.lifecycle = Lifecycle::Running;
        info!(
            max_concurrent_tasks = self.inner.config.max_concurrent_tasks,
            preemption_enabled = self.inner.config.preemption_enabled,
            "scheduler started"
        );
    }

    /// Stop dispatching. Queued and running tasks are kept.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            info!(pending = state.queue.len(), running = state.running.len(), "scheduler stopped");
        }
    }

    /// Queue a task.
    ///
    /// # Errors
    /// `NotRunning`, `InvalidDependency` for unknown or already failed
    /// targets, `QueueFull`.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, ResourceError> {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        if state.queue.len() >= state.queue.max_depth() {
            return Err(ResourceError::QueueFull(state.queue.len()));
        }
        for (target, kind) in &spec.dependencies {
            let target_task = state.tasks.get(target).ok_or_else(|| {
                ResourceError::InvalidDependency(format!("unknown task {target}"))
            })?;
            if kind.unsatisfiable_by(target_task.state) {
                return Err(ResourceError::InvalidDependency(format!(
                    "task {target} is {} and can never satisfy a {kind:?} dependency",
                    target_task.state
                )));
            }
        }

        let id = new_id();
        let mut task = Task::from_spec(id.clone(), spec, now);
        for edge in &mut task.dependencies {
            if let Some(target) = state.tasks.get_mut(&edge.task_id) {
                edge.satisfied = edge.kind.satisfied_by(target.state);
                target.dependents.insert(id.clone());
            }
        }
        let entry = state.ranked(&task, now);
        debug!(
            task_id = %id,
            name = %task.name,
            priority = %task.priority(),
            dependencies = task.dependencies.len(),
            "task submitted"
        );
        state.tasks.insert(id.clone(), task);
        state.queue.push(entry)?;
        state.stats.submitted += 1;
        Ok(id)
    }

    /// Run one scheduling pass. Returns the tasks started.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn schedule(&self) -> Result<Vec<TaskId>, ResourceError> {
        let inner = &self.inner;
        inner.state.lock().lifecycle.ensure_running(COMPONENT)?;
        let load = inner.broker.system_load();
        let now = inner.clock.now_ms();

        let candidates: Vec<(TaskId, ResourceRequirements)> = {
            let mut state = inner.state.lock();
            state.lifecycle.ensure_running(COMPONENT)?;
            state.rank(&inner.policies, PolicyContext::from_config(&inner.config, now, load));
            let slots = inner
                .config
                .max_concurrent_tasks
                .saturating_sub(state.occupied_slots());
            let mut picked = Vec::new();
            while picked.len() < slots {
                let Some(top) = state.queue.pop() else {
                    break;
                };
                if !top.ready {
                    state.queue.push(top)?;
                    break;
                }
                if let Some(task) = state.tasks.get_mut(&top.id) {
                    task.state = TaskState::Scheduled;
                    picked.push((task.id.clone(), dispatch_requirements(task)));
                    state.dispatching.insert(top.id);
                }
            }
            picked
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let results: Vec<_> = candidates
            .into_iter()
            .map(|(id, req)| {
                let result = inner.broker.acquire(&req);
                (id, result)
            })
            .collect();

        let mut started = Vec::new();
        let mut orphaned = Vec::new();
        let mut to_run = Vec::new();
        {
            let mut state = inner.state.lock();
            let now = inner.clock.now_ms();
            for (id, result) in results {
                state.dispatching.remove(&id);
                let still_scheduled = state
                    .tasks
                    .get(&id)
                    .is_some_and(|t| t.state == TaskState::Scheduled);
                match result {
                    Ok(allocation) if still_scheduled => {
                        if let Some(task) = state.start(&id, allocation.id.clone(), now) {
                            debug!(task_id = %id, allocation_id = %allocation.id, "task started");
                            started.push(id);
                            to_run.push((task, allocation));
                        }
                    }
                    Ok(allocation) => orphaned.push(allocation.id),
                    Err(err) if still_scheduled => {
                        debug!(task_id = %id, error = %err, "dispatch deferred");
                        state.requeue(&id, now);
                    }
                    Err(_) => {}
                }
            }
        }
        for allocation_id in orphaned {
            self.relinquish(&allocation_id);
        }
        self.run(to_run);
        Ok(started)
    }

    /// Make room for a pending HIGH or CRITICAL task by displacing running
    /// tasks of lower base priority, cheapest effective priority first, then
    /// start it.
    ///
    /// # Errors
    /// `NotRunning`, `NotFound` when `task_id` is not pending,
    /// `PreemptionIneligible` below HIGH.
    pub fn preempt(&self, task_id: &str) -> Result<PreemptionOutcome, ResourceError> {
        let inner = &self.inner;
        inner.state.lock().lifecycle.ensure_running(COMPONENT)?;
        if !inner.config.preemption_enabled {
            return Ok(PreemptionOutcome::Disabled);
        }
        let headroom = inner.broker.headroom();
        let now = inner.clock.now_ms();

        let (victims, released, req) = {
            let mut state = inner.state.lock();
            let task = state
                .tasks
                .get(task_id)
                .filter(|t| t.state == TaskState::Pending)
                .ok_or_else(|| ResourceError::not_found("pending task", task_id))?;
            let priority = task.priority();
            if !priority.is_protected() {
                return Err(ResourceError::PreemptionIneligible(priority));
            }
            if !task.dependencies_satisfied() {
                return Ok(PreemptionOutcome::Blocked);
            }
            let req = dispatch_requirements(task);
            let shortfall = [
                (req.compute - headroom.compute).max(0.0),
                (req.memory - headroom.memory).max(0.0),
                (req.attention - headroom.attention).max(0.0),
            ];
            let need_slot = state.occupied_slots() >= inner.config.max_concurrent_tasks;

            let mut candidates: Vec<(f64, &Task)> = state
                .running
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .filter(|t| t.priority() < priority)
                .map(|t| (effective_priority(t, now, state.fairness(t)).total(), t))
                .collect();
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

            let covered = |freed: &[f64; 3], count: usize| {
                freed
                    .iter()
                    .zip(&shortfall)
                    .all(|(f, s)| f + CAPACITY_EPSILON >= *s)
                    && (!need_slot || count > 0)
            };
            let mut freed = [0.0; 3];
            let mut victims: Vec<TaskId> = Vec::new();
            for (_, candidate) in &candidates {
                if covered(&freed, victims.len()) {
                    break;
                }
                let r = &candidate.requirements;
                freed[0] += r.compute;
                freed[1] += r.memory;
                freed[2] += r.attention;
                victims.push(candidate.id.clone());
            }
            if !covered(&freed, victims.len()) {
                debug!(task_id = %task_id, "preemption cannot cover shortfall");
                return Ok(PreemptionOutcome::Insufficient);
            }

            let mut released = Vec::new();
            for victim_id in &victims {
                let Some(victim) = state.tasks.get_mut(victim_id) else {
                    continue;
                };
                victim.state = TaskState::Preempted;
                victim.preemption_count += 1;
                victim.queued_at_ms = now;
                released.extend(victim.allocation_id.take());
                warn!(
                    task_id = %victim_id,
                    preempted_by = %task_id,
                    preemption_count = victim.preemption_count,
                    "task preempted"
                );
                state.running.remove(victim_id);
                state.stats.preemptions += 1;
                state.requeue(victim_id, now);
            }
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.state = TaskState::Scheduled;
            }
            state.queue.remove(task_id);
            state.dispatching.insert(task_id.to_string());
            (victims, released, req)
        };

        for allocation_id in &released {
            self.relinquish(allocation_id);
        }
        let result = inner.broker.acquire(&req);

        let mut state = inner.state.lock();
        let now = inner.clock.now_ms();
        state.dispatching.remove(task_id);
        let still_scheduled = state
            .tasks
            .get(task_id)
            .is_some_and(|t| t.state == TaskState::Scheduled);
        match result {
            Ok(allocation) if still_scheduled => {
                let started = state.start(task_id, allocation.id.clone(), now);
                drop(state);
                info!(task_id = %task_id, victims = victims.len(), "task admitted by preemption");
                if let Some(task) = started {
                    self.run(vec![(task, allocation)]);
                }
                Ok(PreemptionOutcome::Admitted { victims })
            }
            Ok(allocation) => {
                drop(state);
                self.relinquish(&allocation.id);
                Ok(PreemptionOutcome::Insufficient)
            }
            Err(err) => {
                if still_scheduled {
                    state.requeue(task_id, now);
                }
                warn!(task_id = %task_id, error = %err, "preempting task still could not acquire resources");
                Ok(PreemptionOutcome::Insufficient)
            }
        }
    }

    /// Mark a running task completed and release its resources.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks.
    pub fn complete_task(&self, task_id: &str) -> Result<bool, ResourceError> {
        self.finish(task_id, TaskState::Completed, None)
    }

    /// Fail a task in any non-terminal state.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks.
    pub fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool, ResourceError> {
        self.finish(task_id, TaskState::Failed, Some(reason.to_string()))
    }

    /// Cancel a task in any non-terminal state.
    ///
    /// # Errors
    /// `NotFound` for unknown tasks.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool, ResourceError> {
        self.finish(task_id, TaskState::Cancelled, Some("cancelled".to_string()))
    }

    fn finish(
        &self,
        task_id: &str,
        to: TaskState,
        reason: Option<String>,
    ) -> Result<bool, ResourceError> {
        let now = self.inner.clock.now_ms();
        let outcome = self.inner.state.lock().finish(task_id, to, reason, now)?;
        let Some(released) = outcome else {
            return Ok(false);
        };
        debug!(task_id = %task_id, state = %to, "task finished");
        for allocation_id in &released {
            self.relinquish(allocation_id);
        }
        Ok(true)
    }

    /// Mark every `kind` edge pointing at `target_id` satisfied. Returns the
    /// number of edges changed.
    pub fn satisfy_dependencies(&self, target_id: &str, kind: DependencyKind) -> usize {
        let mut state = self.inner.state.lock();
        let Some(target) = state.tasks.get(target_id) else {
            return 0;
        };
        let dependents: Vec<TaskId> = target.dependents.iter().cloned().collect();
        let mut changed = 0;
        for dependent_id in dependents {
            if let Some(dependent) = state.tasks.get_mut(&dependent_id) {
                for edge in dependent
                    .dependencies
                    .iter_mut()
                    .filter(|e| e.task_id == target_id && e.kind == kind && !e.satisfied)
                {
                    edge.satisfied = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Fail running tasks that exceeded the configured timeout.
    pub fn sweep_timeouts(&self) -> Vec<TaskId> {
        let now = self.inner.clock.now_ms();
        let timeout_ms = secs_to_ms(self.inner.config.task_timeout_secs);
        let mut timed_out = Vec::new();
        let mut released = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let overdue: Vec<TaskId> = state
                .running
                .iter()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .and_then(|t| t.started_at_ms)
                        .is_some_and(|at| at + timeout_ms < now)
                })
                .cloned()
                .collect();
            for id in overdue {
                if let Ok(Some(allocations)) =
                    state.finish(&id, TaskState::Failed, Some("timed out".into()), now)
                {
                    warn!(task_id = %id, timeout_secs = self.inner.config.task_timeout_secs, "task timed out");
                    state.stats.timeouts += 1;
                    released.extend(allocations);
                    timed_out.push(id);
                }
            }
        }
        for allocation_id in &released {
            self.relinquish(allocation_id);
        }
        timed_out
    }

    /// Timeout sweep followed by a scheduling pass.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn tick(&self) -> Result<Vec<TaskId>, ResourceError> {
        self.sweep_timeouts();
        self.schedule()
    }

    /// Snapshot of a task.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.state.lock().tasks.get(task_id).cloned()
    }

    /// Effective priority breakdown of a task at the current time.
    #[must_use]
    pub fn priority_of(&self, task_id: &str) -> Option<PriorityFactors> {
        let now = self.inner.clock.now_ms();
        let state = self.inner.state.lock();
        let task = state.tasks.get(task_id)?;
        Some(effective_priority(task, now, state.fairness(task)))
    }

    /// Pending tasks in dispatch order, with policy-adjusted scores.
    #[must_use]
    pub fn ranked_pending(&self) -> Vec<RankedTask> {
        let load = self.inner.broker.system_load();
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        state.rank(
            &self.inner.policies,
            PolicyContext::from_config(&self.inner.config, now, load),
        );
        state.queue.ordered()
    }

    /// Ids of running tasks.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.inner.state.lock().running.iter().cloned().collect()
    }

    /// Counters and current queue sizes.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner.state.lock().snapshot_stats()
    }

    fn relinquish(&self, allocation_id: &str) {
        if let Err(err) = self.inner.broker.relinquish(allocation_id) {
            warn!(allocation_id = %allocation_id, error = %err, "failed to release task allocation");
        }
    }

    fn run(&self, started: Vec<(Task, ResourceAllocation)>) {
        if started.is_empty() {
            return;
        }
        let Some(dispatcher) = self.inner.dispatcher.lock().clone() else {
            return;
        };
        for (task, allocation) in started {
            let scheduler = self.clone();
            let runner = Arc::clone(&dispatcher.runner);
            let task_id = task.id.clone();
            (dispatcher.spawn)(Box::pin(async move {
                let result = match runner.run(task, allocation).await {
                    Ok(()) => scheduler.complete_task(&task_id),
                    Err(reason) => scheduler.fail_task(&task_id, &reason),
                };
                if let Err(err) = result {
                    warn!(task_id = %task_id, error = %err, "failed to record task outcome");
                }
            }));
        }
    }
}
