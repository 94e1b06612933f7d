//! Tests for the manager builder

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_resource_core::builders::ManagerBuilder;
use prometheus_resource_core::config::ManagerConfig;
use prometheus_resource_core::core::{
    AuditAction, AuditEvent, AuditSink, Lifecycle, ResourceAllocation, ResourceError,
    ResourceRequirements, Task, TaskRunner, TaskSpec, TaskState,
};
use prometheus_resource_core::runtime::TokioSpawner;
use prometheus_resource_core::util::clock::ManualClock;
use prometheus_resource_core::util::serde::Priority;

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<AuditEvent>>>);

impl AuditSink for SharedSink {
    fn record(&mut self, event: AuditEvent) {
        self.0.lock().push(event);
    }
}

struct Instant;

#[async_trait]
impl TaskRunner for Instant {
    async fn run(&self, _task: Task, _allocation: ResourceAllocation) -> Result<(), String> {
        Ok(())
    }
}

#[test]
fn test_builder_defaults_not_started() {
    let manager = ManagerBuilder::default().build().unwrap();
    assert_eq!(manager.lifecycle(), Lifecycle::Uninitialized);
    let err = manager
        .allocate_resources(&ResourceRequirements::uniform(0.1, Priority::Low))
        .unwrap_err();
    assert!(matches!(err, ResourceError::NotRunning { .. }));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut config = ManagerConfig::default();
    config.memory.total_memory = 0;
    let result = ManagerBuilder::new(config).build();
    assert!(matches!(result, Err(ResourceError::InvalidConfig(_))));
}

#[test]
fn test_builder_started_with_custom_sink() {
    let sink = SharedSink::default();
    let manager = ManagerBuilder::new(ManagerConfig::default())
        .with_clock(Arc::new(ManualClock::new(1_000)))
        .with_audit_sink(Box::new(sink.clone()))
        .started()
        .build()
        .unwrap();
    assert_eq!(manager.lifecycle(), Lifecycle::Running);

    let allocation = manager
        .allocate_resources(&ResourceRequirements::uniform(0.1, Priority::Medium))
        .unwrap();
    manager.release_resources(&allocation.id).unwrap();

    let recorded = sink.0.lock();
    let actions: Vec<AuditAction> = recorded.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Allocate, AuditAction::Release]);
    assert!(recorded.iter().all(|e| e.created_at_ms == 1_000));
    // Custom sinks do not retain for the manager.
    assert!(manager.audit_events().is_empty());
}

#[tokio::test]
async fn test_builder_installs_runner() {
    let spawner = TokioSpawner::current().expect("inside a runtime");
    let manager = ManagerBuilder::new(ManagerConfig::default())
        .with_runner(Arc::new(Instant), spawner)
        .started()
        .build()
        .unwrap();

    let scheduler = manager.scheduler();
    let id = scheduler
        .submit(TaskSpec::new(
            "noop",
            ResourceRequirements::uniform(0.1, Priority::Medium),
        ))
        .unwrap();
    assert_eq!(scheduler.schedule().unwrap(), vec![id.clone()]);

    for _ in 0..100 {
        if scheduler.task(&id).map(|t| t.state) == Some(TaskState::Completed) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.task(&id).unwrap().state, TaskState::Completed);
    assert_eq!(manager.live_allocations(), 0);
}
