//! Tests for error types

use prometheus_resource_core::core::{Lifecycle, ResourceError};
use prometheus_resource_core::util::serde::{Priority, ResourceKind};

#[test]
fn test_capacity_exceeded_error() {
    let err = ResourceError::CapacityExceeded {
        resource: ResourceKind::Compute,
        requested: 0.5,
        available: 0.25,
    };
    assert_eq!(
        err.to_string(),
        "capacity exceeded for compute: requested 0.5000, available 0.2500"
    );
    assert!(err.is_capacity());
    assert!(err.is_recoverable());
}

#[test]
fn test_not_found_error() {
    let err = ResourceError::not_found("memory block", "b-1");
    assert_eq!(err.to_string(), "memory block not found: b-1");
    assert!(err.is_recoverable());
    assert!(!err.is_capacity());
}

#[test]
fn test_not_running_error() {
    let err = ResourceError::NotRunning {
        component: "scheduler",
        state: Lifecycle::Stopped,
    };
    assert_eq!(err.to_string(), "scheduler is not running (state: stopped)");
    assert!(!err.is_recoverable());
}

#[test]
fn test_preemption_ineligible_error() {
    let err = ResourceError::PreemptionIneligible(Priority::Low);
    assert_eq!(
        err.to_string(),
        "preemption requires HIGH or CRITICAL priority, got LOW"
    );
}

#[test]
fn test_queue_full_error() {
    let err = ResourceError::QueueFull(10);
    assert_eq!(err.to_string(), "task queue full (10 pending)");
    assert!(err.is_recoverable());
}

#[test]
fn test_invalid_config_error() {
    let err = ResourceError::InvalidConfig("total_memory must be greater than 0".into());
    assert_eq!(
        err.to_string(),
        "invalid configuration: total_memory must be greater than 0"
    );
    assert!(!err.is_recoverable());
}

#[test]
fn test_error_converts_into_anyhow() {
    fn edge() -> prometheus_resource_core::core::AppResult<()> {
        Err(ResourceError::InvalidDependency("unknown task t".into()))?;
        Ok(())
    }
    let err = edge().unwrap_err();
    assert!(err.to_string().contains("unknown task t"));
    assert!(err.downcast_ref::<ResourceError>().is_some());
}
