//! Integration tests for the priority scheduler: dependency chains run by a
//! task runner, fairness across users, concurrent submission and timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use prometheus_resource_core::config::SchedulerConfig;
use prometheus_resource_core::core::{
    DependencyKind, PreemptionOutcome, PriorityScheduler, ResourceAllocation, ResourceBroker, ResourceError,
    ResourceRequirements, ResourceUtilization, Task, TaskRunner, TaskSpec, TaskState,
};
use prometheus_resource_core::runtime::TokioSpawner;
use prometheus_resource_core::util::clock::{Clock, ManualClock};
use prometheus_resource_core::util::serde::{new_id, Priority, ResourceKind};

/// Compute-only broker with a unit pool.
#[derive(Default)]
struct PoolBroker {
    held: Mutex<HashMap<String, f64>>,
}

impl PoolBroker {
    fn used(&self) -> f64 {
        self.held.lock().values().sum()
    }
}

impl ResourceBroker for PoolBroker {
    fn acquire(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        let mut held = self.held.lock();
        let used: f64 = held.values().sum();
        if used + req.compute > 1.0 + 1e-9 {
            return Err(ResourceError::CapacityExceeded {
                resource: ResourceKind::Compute,
                requested: req.compute,
                available: 1.0 - used,
            });
        }
        let mut allocation = ResourceAllocation::empty(new_id(), req, 0);
        allocation.compute = req.compute;
        held.insert(allocation.id.clone(), req.compute);
        Ok(allocation)
    }

    fn relinquish(&self, allocation_id: &str) -> Result<bool, ResourceError> {
        Ok(self.held.lock().remove(allocation_id).is_some())
    }

    fn headroom(&self) -> ResourceUtilization {
        ResourceUtilization {
            compute: 1.0 - self.used(),
            memory: 1.0,
            attention: 1.0,
            ..ResourceUtilization::default()
        }
    }

    fn system_load(&self) -> f64 {
        self.used()
    }
}

/// Holds the first acquire until the test lets it through.
struct GatedBroker {
    pool: PoolBroker,
    gated: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedBroker {
    fn new() -> Self {
        Self {
            pool: PoolBroker::default(),
            gated: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl ResourceBroker for GatedBroker {
    fn acquire(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.pool.acquire(req)
    }

    fn relinquish(&self, allocation_id: &str) -> Result<bool, ResourceError> {
        self.pool.relinquish(allocation_id)
    }

    fn headroom(&self) -> ResourceUtilization {
        self.pool.headroom()
    }

    fn system_load(&self) -> f64 {
        self.pool.system_load()
    }
}

fn scheduler(config: SchedulerConfig) -> (PriorityScheduler, Arc<PoolBroker>, Arc<ManualClock>) {
    let broker = Arc::new(PoolBroker::default());
    let clock = Arc::new(ManualClock::new(10_000_000));
    let scheduler = PriorityScheduler::new(config, broker.clone(), clock.clone()).unwrap();
    scheduler.start();
    (scheduler, broker, clock)
}

fn spec(name: &str, share: f64) -> TaskSpec {
    TaskSpec::new(name, ResourceRequirements::new(Priority::Medium).with_compute(share))
}

/// Records the order in which tasks run.
#[derive(Default)]
struct RecordingRunner {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: Task, _allocation: ResourceAllocation) -> Result<(), String> {
        self.order.lock().push(task.name.clone());
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(())
    }
}

/// Never finishes.
struct Stuck;

#[async_trait]
impl TaskRunner for Stuck {
    async fn run(&self, _task: Task, _allocation: ResourceAllocation) -> Result<(), String> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_dependency_chain_runs_in_order() {
    let (scheduler, broker, _) = scheduler(SchedulerConfig::default());
    let runner = Arc::new(RecordingRunner::default());
    scheduler.set_runner(runner.clone(), TokioSpawner::current().expect("runtime"));

    let a = scheduler.submit(spec("a", 0.2)).unwrap();
    let b = scheduler
        .submit(spec("b", 0.2).depends_on(a.clone(), DependencyKind::Completion))
        .unwrap();
    let c = scheduler
        .submit(spec("c", 0.2).depends_on(b.clone(), DependencyKind::Completion))
        .unwrap();

    for _ in 0..200 {
        scheduler.schedule().unwrap();
        if scheduler.task(&c).is_some_and(|t| t.state == TaskState::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(*runner.order.lock(), vec!["a", "b", "c"]);
    for id in [&a, &b, &c] {
        assert_eq!(scheduler.task(id).unwrap().state, TaskState::Completed);
    }
    assert_eq!(scheduler.stats().completed, 3);
    assert!(broker.used().abs() < 1e-9);
}

#[test]
fn test_cancel_cascades_down_chain() {
    let (scheduler, broker, _) = scheduler(SchedulerConfig::default());
    let a = scheduler.submit(spec("a", 0.3)).unwrap();
    scheduler.schedule().unwrap();
    let b = scheduler
        .submit(spec("b", 0.2).depends_on(a.clone(), DependencyKind::Completion))
        .unwrap();
    let c = scheduler
        .submit(spec("c", 0.2).depends_on(b.clone(), DependencyKind::Start))
        .unwrap();

    assert!(scheduler.cancel_task(&a).unwrap());
    assert!(!scheduler.cancel_task(&a).unwrap());
    assert_eq!(scheduler.task(&b).unwrap().state, TaskState::Cancelled);
    assert_eq!(scheduler.task(&c).unwrap().state, TaskState::Cancelled);
    assert_eq!(scheduler.stats().cancelled, 3);
    assert!(scheduler.ranked_pending().is_empty());
    assert!(broker.used().abs() < 1e-9);

    let err = scheduler
        .submit(spec("d", 0.1).depends_on(a, DependencyKind::Completion))
        .unwrap_err();
    assert!(matches!(err, ResourceError::InvalidDependency(_)));
}

#[test]
fn test_fairness_favours_underserved_user() {
    let (scheduler, _, _) = scheduler(SchedulerConfig::default());
    let mut first_round = Vec::new();
    for _ in 0..3 {
        first_round.push(scheduler.submit(spec("heavy", 0.1).with_user("heavy")).unwrap());
    }
    first_round.push(scheduler.submit(spec("light", 0.1).with_user("light")).unwrap());
    assert_eq!(scheduler.schedule().unwrap().len(), 4);
    for id in &first_round {
        assert!(scheduler.complete_task(id).unwrap());
    }

    let heavy = scheduler.submit(spec("heavy", 0.1).with_user("heavy")).unwrap();
    let light = scheduler.submit(spec("light", 0.1).with_user("light")).unwrap();

    // Mean dispatches 2: heavy (3) is over, light (1) is under.
    let heavy_factors = scheduler.priority_of(&heavy).unwrap();
    let light_factors = scheduler.priority_of(&light).unwrap();
    assert!((heavy_factors.fairness + 5.0).abs() < 1e-9);
    assert!((light_factors.fairness - 5.0).abs() < 1e-9);

    let ranked = scheduler.ranked_pending();
    assert_eq!(ranked[0].id, light);
    assert_eq!(ranked[1].id, heavy);
}

#[test]
fn test_deadline_factor() {
    let (scheduler, _, clock) = scheduler(SchedulerConfig::default());
    let now = clock.now_ms();
    let missed = scheduler
        .submit(spec("missed", 0.1).with_deadline_ms(now - 1_000))
        .unwrap();
    let half = scheduler
        .submit(spec("half", 0.1).with_deadline_ms(now + 1_800_000))
        .unwrap();
    let none = scheduler.submit(spec("none", 0.1)).unwrap();

    assert!((scheduler.priority_of(&missed).unwrap().deadline - 50.0).abs() < 1e-9);
    assert!((scheduler.priority_of(&half).unwrap().deadline - 12.5).abs() < 1e-9);
    assert!(scheduler.priority_of(&none).unwrap().deadline.abs() < 1e-9);

    let order: Vec<String> = scheduler.ranked_pending().into_iter().map(|r| r.id).collect();
    assert_eq!(order, vec![missed, half, none]);
}

#[test]
fn test_concurrent_submission() {
    let (scheduler, broker, _) = scheduler(SchedulerConfig::default());
    let ids: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    (0..25)
                        .map(|i| {
                            scheduler
                                .submit(spec(&format!("t{t}-{i}"), 0.05).with_user(format!("u{t}")))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 200);
    assert_eq!(scheduler.stats().submitted, 200);
    assert_eq!(scheduler.stats().pending, 200);

    let started = scheduler.schedule().unwrap();
    assert_eq!(started.len(), 10);
    assert_eq!(scheduler.running_tasks().len(), 10);
    assert!((broker.used() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_async_submitters_share_scheduler() {
    let (scheduler, _, _) = scheduler(SchedulerConfig {
        max_queue_depth: 16,
        ..SchedulerConfig::default()
    });
    let results = join_all((0..20).map(|i| {
        let scheduler = scheduler.clone();
        async move { scheduler.submit(spec(&format!("job-{i}"), 0.01)) }
    }))
    .await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(ResourceError::QueueFull(16))))
        .count();
    assert_eq!(accepted, 16);
    assert_eq!(rejected, 4);
}

#[tokio::test]
async fn test_stuck_task_times_out() {
    let (scheduler, broker, clock) = scheduler(SchedulerConfig {
        task_timeout_secs: 60,
        ..SchedulerConfig::default()
    });
    scheduler.set_runner(Arc::new(Stuck), TokioSpawner::current().expect("runtime"));
    let id = scheduler.submit(spec("stuck", 0.4)).unwrap();
    assert_eq!(scheduler.tick().unwrap(), vec![id.clone()]);
    tokio::task::yield_now().await;

    clock.advance(Duration::from_secs(30));
    assert!(scheduler.sweep_timeouts().is_empty());

    clock.advance(Duration::from_secs(31));
    assert_eq!(scheduler.sweep_timeouts(), vec![id.clone()]);
    let task = scheduler.task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.as_deref(), Some("timed out"));
    assert_eq!(scheduler.stats().timeouts, 1);
    assert!(broker.used().abs() < 1e-9);
}

#[test]
fn test_stopped_scheduler_keeps_finishing() {
    let (scheduler, broker, _) = scheduler(SchedulerConfig::default());
    let id = scheduler.submit(spec("a", 0.2)).unwrap();
    scheduler.schedule().unwrap();
    scheduler.stop();

    assert!(matches!(
        scheduler.submit(spec("b", 0.1)),
        Err(ResourceError::NotRunning { .. })
    ));
    assert!(matches!(
        scheduler.schedule(),
        Err(ResourceError::NotRunning { .. })
    ));
    assert!(scheduler.complete_task(&id).unwrap());
    assert!(broker.used().abs() < 1e-9);
    assert!(matches!(
        scheduler.complete_task("missing"),
        Err(ResourceError::NotFound { .. })
    ));
}

#[test]
fn test_dispatch_in_flight_holds_its_slot() {
    let broker = Arc::new(GatedBroker::new());
    let clock = Arc::new(ManualClock::new(10_000_000));
    let scheduler = PriorityScheduler::new(
        SchedulerConfig {
            max_concurrent_tasks: 1,
            ..SchedulerConfig::default()
        },
        broker.clone(),
        clock,
    )
    .unwrap();
    scheduler.start();

    let first_req = ResourceRequirements::new(Priority::High).with_compute(0.2);
    let a = scheduler.submit(TaskSpec::new("a", first_req)).unwrap();
    let b = scheduler.submit(spec("b", 0.2)).unwrap();

    let (first, second, urgent, outcome) = std::thread::scope(|scope| {
        let dispatcher = scope.spawn(|| scheduler.schedule().unwrap());
        // "a" is now inside acquire with the scheduler lock released.
        broker.entered.wait();
        let second = scheduler.schedule().unwrap();
        let urgent_req = ResourceRequirements::new(Priority::Critical).with_compute(0.1);
        let urgent = scheduler.submit(TaskSpec::new("urgent", urgent_req)).unwrap();
        let outcome = scheduler.preempt(&urgent).unwrap();
        broker.release.wait();
        (dispatcher.join().unwrap(), second, urgent, outcome)
    });

    assert_eq!(first, vec![a.clone()]);
    assert!(second.is_empty());
    assert_eq!(outcome, PreemptionOutcome::Insufficient);
    assert_eq!(scheduler.running_tasks(), vec![a.clone()]);
    assert_eq!(scheduler.task(&b).unwrap().state, TaskState::Pending);
    assert_eq!(scheduler.task(&urgent).unwrap().state, TaskState::Pending);
    assert!((broker.pool.used() - 0.2).abs() < 1e-9);

    assert!(scheduler.complete_task(&a).unwrap());
    assert_eq!(scheduler.schedule().unwrap(), vec![urgent.clone()]);
    assert!(scheduler.complete_task(&urgent).unwrap());
    assert_eq!(scheduler.schedule().unwrap(), vec![b]);
}
