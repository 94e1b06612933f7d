//! Integration tests for the unified resource manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_resource_core::builders::ManagerBuilder;
use prometheus_resource_core::config::ManagerConfig;
use prometheus_resource_core::core::{
    AttentionFocus, AuditAction, Lifecycle, MemoryTierKind, ResourceAllocation, ResourceError,
    ResourceRequirements, Task, TaskRunner, TaskSpec, TaskState, UnifiedResourceManager,
};
use prometheus_resource_core::runtime::TokioSpawner;
use prometheus_resource_core::util::clock::{Clock, ManualClock};
use prometheus_resource_core::util::serde::Priority;

const EPS: f64 = 1e-6;

fn running_manager() -> (UnifiedResourceManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(5_000_000));
    let manager = ManagerBuilder::new(ManagerConfig::default())
        .with_clock(clock.clone())
        .started()
        .build()
        .unwrap();
    (manager, clock)
}

fn hog_attention(manager: &UnifiedResourceManager, share: f64) -> ResourceAllocation {
    manager
        .allocate_resources(&ResourceRequirements::new(Priority::High).with_attention(share))
        .unwrap()
}

#[test]
fn test_capacity_exhaustion_and_recovery() {
    let (manager, _) = running_manager();
    let req = ResourceRequirements::uniform(0.2, Priority::Medium);

    let granted: Vec<ResourceAllocation> = (0..5)
        .map(|_| manager.allocate_resources(&req).unwrap())
        .collect();
    let used = manager.get_resource_utilization();
    assert!((used.compute - 1.0).abs() < EPS);
    assert!((used.attention - 1.0).abs() < EPS);

    let err = manager.allocate_resources(&req).unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(manager.live_allocations(), 5);

    assert!(manager.release_resources(&granted[0].id).unwrap());
    let again = manager.allocate_resources(&req).unwrap();
    assert!((again.attention - 0.2).abs() < EPS);
    assert_eq!(manager.live_allocations(), 5);
}

#[test]
fn test_interaction_profile_focuses_attention() {
    let (manager, _) = running_manager();
    let allocation = manager
        .allocate_resources_for_interaction("42", "query")
        .unwrap();

    assert!(allocation.attention >= 0.4 - EPS);
    assert!((allocation.compute - 0.3).abs() < EPS);
    assert_eq!(allocation.priority, Priority::High);
    assert_eq!(
        allocation.metadata.get("focus_target").map(String::as_str),
        Some("interaction:42")
    );
    assert_eq!(
        allocation.metadata.get("interaction_type").map(String::as_str),
        Some("query")
    );
    let focus = manager.attention().focus("interaction:42").unwrap();
    assert!((focus.allocation - 0.4).abs() < EPS);
    assert!(!allocation.is_dummy());
}

#[test]
fn test_thought_profile() {
    let (manager, _) = running_manager();
    let allocation = manager
        .allocate_resources_for_thought("t-7", "planning")
        .unwrap();
    assert_eq!(allocation.priority, Priority::High);
    assert!((allocation.attention - 0.35).abs() < EPS);
    assert!(manager.attention().focus("thought:t-7").is_some());

    let fallback_type = manager
        .allocate_resources_for_thought("t-8", "daydream")
        .unwrap();
    assert_eq!(fallback_type.priority, Priority::Low);
}

#[test]
fn test_interaction_falls_back_to_reduced_profile() {
    let (manager, _) = running_manager();
    hog_attention(&manager, 0.9);

    let allocation = manager
        .allocate_resources_for_interaction("7", "query")
        .unwrap();
    assert!(!allocation.is_dummy());
    assert!((allocation.attention - 0.05).abs() < EPS);
    assert!((allocation.compute - 0.05).abs() < EPS);

    let report = manager.get_performance_report();
    assert_eq!(report.allocations.fallbacks, 1);
    assert_eq!(report.allocations.rollbacks, 1);
    // Compute and memory from the failed full profile were rolled back.
    assert!((report.utilization.compute - 0.05).abs() < EPS);

    let actions: Vec<AuditAction> = manager.audit_events().iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Allocate, AuditAction::Rollback, AuditAction::Allocate, AuditAction::Fallback]
    );
}

#[test]
fn test_exhausted_interaction_gets_dummy() {
    let (manager, _) = running_manager();
    hog_attention(&manager, 1.0);
    let before = manager.get_resource_utilization();

    let allocation = manager
        .allocate_resources_for_interaction("9", "command")
        .unwrap();
    assert!(allocation.is_dummy());
    assert!((allocation.compute - 0.01).abs() < EPS);
    assert!(allocation.memory_bytes > 0);

    // Dummies consume nothing real.
    let after = manager.get_resource_utilization();
    assert!((after.compute - before.compute).abs() < EPS);
    assert_eq!(manager.get_performance_report().allocations.dummies, 1);

    assert!(manager.release_resources(&allocation.id).unwrap());
    assert!(!manager.release_resources(&allocation.id).unwrap());
    assert!(manager
        .audit_events()
        .iter()
        .any(|e| e.action == AuditAction::Dummy && e.allocation_id == allocation.id));
}

#[test]
fn test_stopped_manager_rejects_interactions() {
    let (manager, _) = running_manager();
    let held = manager
        .allocate_resources(&ResourceRequirements::uniform(0.1, Priority::Low))
        .unwrap();
    manager.stop();
    assert_eq!(manager.lifecycle(), Lifecycle::Stopped);

    let err = manager
        .allocate_resources_for_interaction("1", "query")
        .unwrap_err();
    assert!(matches!(err, ResourceError::NotRunning { .. }));
    assert!(manager.release_resources(&held.id).is_err());
    assert_eq!(manager.live_allocations(), 1);
}

fn sorted_foci(manager: &UnifiedResourceManager) -> Vec<AttentionFocus> {
    let mut foci = manager.attention().foci();
    foci.sort_by(|a, b| a.target.cmp(&b.target));
    foci
}

fn block_placement(manager: &UnifiedResourceManager) -> Vec<(String, MemoryTierKind, bool)> {
    let mut blocks: Vec<_> = manager
        .memory()
        .blocks()
        .into_iter()
        .map(|b| (b.id, b.tier, b.cached))
        .collect();
    blocks.sort();
    blocks
}

#[test]
fn test_optimize_is_stable_without_changes() {
    let (manager, clock) = running_manager();
    manager
        .allocate_resources(&ResourceRequirements::uniform(0.3, Priority::Medium))
        .unwrap();
    manager
        .allocate_resources(&ResourceRequirements::uniform(0.2, Priority::Low))
        .unwrap();
    manager
        .allocate_resources_for_interaction("7", "conversation")
        .unwrap();
    manager
        .memory()
        .allocate_memory_block(1 << 20, "long_term")
        .unwrap();

    // Let the time-driven passes run once, then repeat at the same instant.
    clock.advance(Duration::from_secs(10));
    let first = manager.optimize().unwrap();
    let after_first = manager.get_resource_utilization();
    let foci_first = sorted_foci(&manager);
    let blocks_first = block_placement(&manager);
    let second = manager.optimize().unwrap();
    let after_second = manager.get_resource_utilization();

    let foci_second = sorted_foci(&manager);
    assert_eq!(foci_first.len(), 3);
    assert_eq!(foci_first.len(), foci_second.len());
    for (a, b) in foci_first.iter().zip(&foci_second) {
        assert_eq!(a.target, b.target);
        assert!((a.importance - b.importance).abs() < f64::EPSILON, "{}", a.target);
        assert!((a.urgency - b.urgency).abs() < f64::EPSILON, "{}", a.target);
        assert!((a.allocation - b.allocation).abs() < f64::EPSILON, "{}", a.target);
        assert_eq!(a.active, b.active);
    }
    assert_eq!(blocks_first, block_placement(&manager));

    assert_eq!(first.expired, 0);
    assert_eq!(second.expired, 0);
    assert!(second.failures.is_empty());
    assert_eq!(second.reports.len(), 3);
    assert!((after_first.compute - after_second.compute).abs() < EPS);
    assert!((after_first.memory - after_second.memory).abs() < EPS);
    assert!((after_first.attention - after_second.attention).abs() < EPS);
    assert_eq!(manager.live_allocations(), 3);
    assert!(manager.compute().is_consistent());
    assert!(manager.memory().is_consistent());
    assert!(manager.attention().is_consistent());
}

#[test]
fn test_expired_allocations_are_reclaimed() {
    let (manager, clock) = running_manager();
    let deadline = clock.now_ms() + 1_000;
    let expiring = manager
        .allocate_resources(
            &ResourceRequirements::uniform(0.2, Priority::Medium).with_deadline_ms(deadline),
        )
        .unwrap();
    let kept = manager
        .allocate_resources(&ResourceRequirements::uniform(0.2, Priority::Medium))
        .unwrap();

    clock.advance(Duration::from_secs(2));
    let summary = manager.optimize().unwrap();

    assert_eq!(summary.expired, 1);
    assert!(manager.allocation(&expiring.id).is_none());
    assert!(manager.allocation(&kept.id).is_some());
    assert!((manager.get_resource_utilization().compute - 0.2).abs() < EPS);
    assert_eq!(manager.get_performance_report().allocations.expirations, 1);
    assert!(manager
        .audit_events()
        .iter()
        .any(|e| e.action == AuditAction::Expire && e.allocation_id == expiring.id));
}

#[test]
fn test_check_optimization_respects_interval() {
    let (manager, clock) = running_manager();
    assert!(manager.check_optimization().unwrap().is_none());

    clock.advance(Duration::from_secs(299));
    assert!(manager.check_optimization().unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let summary = manager.check_optimization().unwrap().unwrap();
    assert_eq!(summary.timestamp_ms, clock.now_ms());
    assert!(manager.check_optimization().unwrap().is_none());
    assert_eq!(
        manager.get_performance_report().last_optimization_ms,
        clock.now_ms()
    );
}

#[test]
fn test_performance_report_counts() {
    let (manager, _) = running_manager();
    let a = manager
        .allocate_resources(&ResourceRequirements::uniform(0.25, Priority::Medium))
        .unwrap();
    manager
        .allocate_resources(&ResourceRequirements::uniform(0.9, Priority::Medium))
        .unwrap_err();
    manager.release_resources(&a.id).unwrap();

    let report = manager.get_performance_report();
    assert_eq!(report.lifecycle, Lifecycle::Running);
    assert_eq!(report.allocations.allocations, 1);
    assert_eq!(report.allocations.releases, 1);
    assert_eq!(report.allocations.failures, 1);
    assert_eq!(report.allocations.live, 0);
    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.pools.len(), 4);
    assert_eq!(report.tiers.len(), 3);
    assert!(report.utilization.compute.abs() < EPS);
}

#[test]
fn test_scheduler_acquires_through_manager() {
    let (manager, _) = running_manager();
    let scheduler = manager.scheduler();
    let id = scheduler
        .submit(TaskSpec::new(
            "index",
            ResourceRequirements::uniform(0.4, Priority::Medium),
        ))
        .unwrap();
    assert_eq!(scheduler.schedule().unwrap(), vec![id.clone()]);

    let task = scheduler.task(&id).unwrap();
    let allocation_id = task.allocation_id.clone().unwrap();
    let allocation = manager.allocation(&allocation_id).unwrap();
    assert_eq!(allocation.metadata.get("task_id"), Some(&id));
    assert!((manager.get_resource_utilization().compute - 0.4).abs() < EPS);

    assert!(scheduler.complete_task(&id).unwrap());
    assert!(manager.allocation(&allocation_id).is_none());
    assert_eq!(manager.live_allocations(), 0);
}

struct Sleeper;

#[async_trait]
impl TaskRunner for Sleeper {
    async fn run(&self, task: Task, _allocation: ResourceAllocation) -> Result<(), String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if task.name == "doomed" {
            Err("runner gave up".into())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_background_loops_drive_scheduler() {
    let mut config = ManagerConfig::default();
    config.scheduler.schedule_interval_ms = 10;
    let spawner = TokioSpawner::current().expect("inside a runtime");
    let manager = ManagerBuilder::new(config)
        .with_clock(Arc::new(ManualClock::new(1_000)))
        .with_runner(Arc::new(Sleeper), spawner)
        .started()
        .build()
        .unwrap();

    let background = manager.start_background(&tokio::runtime::Handle::current());
    let mut names = background.names();
    names.sort_unstable();
    assert_eq!(names, vec!["attention", "memory", "optimization", "scheduler"]);

    let scheduler = manager.scheduler();
    let ok = scheduler
        .submit(TaskSpec::new("ok", ResourceRequirements::uniform(0.2, Priority::Medium)))
        .unwrap();
    let doomed = scheduler
        .submit(TaskSpec::new("doomed", ResourceRequirements::uniform(0.2, Priority::Low)))
        .unwrap();

    for _ in 0..200 {
        let done = [&ok, &doomed]
            .iter()
            .all(|id| scheduler.task(id).is_some_and(|t| t.state.is_terminal()));
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(scheduler.task(&ok).unwrap().state, TaskState::Completed);
    let failed = scheduler.task(&doomed).unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.error.as_deref(), Some("runner gave up"));
    assert_eq!(manager.live_allocations(), 0);

    background.shutdown().await;
    manager.stop();
}
