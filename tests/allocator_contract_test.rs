//! Contract tests run against every allocator through `ResourceAllocator`.
//!
//! Each allocator reports its own share in `get_utilization`, so the helpers
//! below pick the matching field.

use std::sync::Arc;

use prometheus_resource_core::config::{AttentionConfig, ComputeConfig, MemoryConfig};
use prometheus_resource_core::core::{
    AttentionManager, ComputeResourceAllocator, MemoryManager, ResourceAllocator, ResourceError,
    ResourceRequirements,
};
use prometheus_resource_core::util::clock::ManualClock;
use prometheus_resource_core::util::serde::Priority;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EPS: f64 = 1e-6;

fn allocators() -> Vec<Box<dyn ResourceAllocator>> {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let compute = ComputeResourceAllocator::new(ComputeConfig::default(), clock.clone()).unwrap();
    let memory = MemoryManager::new(MemoryConfig::default(), clock.clone()).unwrap();
    let attention = AttentionManager::new(AttentionConfig::default(), clock).unwrap();
    let all: Vec<Box<dyn ResourceAllocator>> =
        vec![Box::new(compute), Box::new(memory), Box::new(attention)];
    for allocator in &all {
        allocator.start().unwrap();
    }
    all
}

fn used(allocator: &dyn ResourceAllocator) -> f64 {
    let u = allocator.get_utilization();
    match allocator.name() {
        "compute" => u.compute,
        "memory" => u.memory,
        _ => u.attention,
    }
}

fn request(allocator: &dyn ResourceAllocator, share: f64, priority: Priority) -> ResourceRequirements {
    let req = ResourceRequirements::new(priority);
    match allocator.name() {
        "compute" => req.with_compute(share),
        "memory" => req.with_memory(share),
        _ => req.with_attention(share),
    }
}

#[test]
fn test_random_workload_conserves_capacity() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<(String, f64)> = Vec::new();

        for _ in 0..500 {
            if live.is_empty() || rng.random_bool(0.6) {
                let share = f64::from(rng.random_range(1_u32..=30)) / 100.0;
                let priority = Priority::ALL[rng.random_range(0..4)];
                let before = used(allocator);
                match allocator.allocate(&request(allocator, share, priority)) {
                    Ok(allocation) => live.push((allocation.id, share)),
                    Err(err) => {
                        assert!(err.is_capacity(), "{}: {err}", allocator.name());
                        assert!(before + share > 1.0 - EPS);
                        assert!((used(allocator) - before).abs() < EPS);
                    }
                }
            } else {
                let index = rng.random_range(0..live.len());
                let (id, _) = live.swap_remove(index);
                assert!(allocator.release(&id).unwrap());
            }

            let expected: f64 = live.iter().map(|(_, share)| share).sum();
            let observed = used(allocator);
            assert!(observed <= 1.0 + EPS, "{} over capacity", allocator.name());
            assert!(
                (observed - expected).abs() < 1e-3,
                "{}: ledger {observed} vs live {expected}",
                allocator.name()
            );
        }
    }
}

#[test]
fn test_release_is_idempotent() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        let allocation = allocator
            .allocate(&request(allocator, 0.25, Priority::Medium))
            .unwrap();
        assert!(allocator.release(&allocation.id).unwrap());
        assert!(!allocator.release(&allocation.id).unwrap());
        assert!(!allocator.release("never-issued").unwrap());
        assert!(used(allocator).abs() < EPS);
    }
}

#[test]
fn test_stopped_allocator_rejects_calls() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        let held = allocator
            .allocate(&request(allocator, 0.1, Priority::Low))
            .unwrap();
        allocator.stop();

        let err = allocator
            .allocate(&request(allocator, 0.1, Priority::Low))
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotRunning { .. }));
        assert!(matches!(
            allocator.release(&held.id),
            Err(ResourceError::NotRunning { .. })
        ));
        assert!(allocator.optimize().is_err());
        // Live allocations survive a stop.
        assert!((used(allocator) - 0.1).abs() < EPS);
    }
}

#[test]
fn test_critical_preempts_only_unprotected() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        let low = allocator
            .allocate(&request(allocator, 0.6, Priority::Low))
            .unwrap();
        allocator
            .allocate(&request(allocator, 0.3, Priority::High))
            .unwrap();

        let err = allocator
            .allocate(&request(allocator, 0.6, Priority::High))
            .unwrap_err();
        assert!(err.is_capacity(), "{}: HIGH must not preempt", allocator.name());

        let critical = allocator
            .allocate(&request(allocator, 0.6, Priority::Critical))
            .unwrap();
        assert!((used(allocator) - 0.9).abs() < EPS, "{}", allocator.name());
        assert!(!allocator.release(&low.id).unwrap(), "low was displaced");

        // Nothing unprotected is left to displace.
        let err = allocator
            .allocate(&request(allocator, 0.2, Priority::Critical))
            .unwrap_err();
        assert!(err.is_capacity());
        assert!(allocator.release(&critical.id).unwrap());
    }
}

#[test]
fn test_failed_preemption_releases_nothing() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        allocator
            .allocate(&request(allocator, 0.2, Priority::Low))
            .unwrap();
        allocator
            .allocate(&request(allocator, 0.7, Priority::High))
            .unwrap();
        let err = allocator
            .allocate(&request(allocator, 0.5, Priority::Critical))
            .unwrap_err();
        assert!(err.is_capacity());
        assert!((used(allocator) - 0.9).abs() < EPS, "{}", allocator.name());
    }
}

#[test]
fn test_rollback_restores_displaced() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        allocator
            .allocate(&request(allocator, 0.6, Priority::Low))
            .unwrap();
        allocator
            .allocate(&request(allocator, 0.3, Priority::High))
            .unwrap();
        let critical = allocator
            .allocate(&request(allocator, 0.6, Priority::Critical))
            .unwrap();

        assert!(allocator.rollback(&critical.id).unwrap());
        assert!(!allocator.rollback(&critical.id).unwrap());
        assert!(
            (used(allocator) - 0.9).abs() < EPS,
            "{}: displaced allocation restored",
            allocator.name()
        );
    }
}

#[test]
fn test_update_allocation_is_atomic() {
    for allocator in allocators() {
        let allocator = allocator.as_ref();
        let held = allocator
            .allocate(&request(allocator, 0.3, Priority::Medium))
            .unwrap();
        allocator
            .allocate(&request(allocator, 0.5, Priority::Medium))
            .unwrap();

        let err = allocator
            .update_allocation(&held.id, &request(allocator, 0.6, Priority::Medium))
            .unwrap_err();
        assert!(err.is_capacity());
        assert!((used(allocator) - 0.8).abs() < EPS);

        allocator
            .update_allocation(&held.id, &request(allocator, 0.5, Priority::Medium))
            .unwrap();
        assert!((used(allocator) - 1.0).abs() < EPS);
        allocator
            .update_allocation(&held.id, &request(allocator, 0.1, Priority::Medium))
            .unwrap();
        assert!((used(allocator) - 0.6).abs() < EPS);

        let missing = allocator
            .update_allocation("missing", &request(allocator, 0.1, Priority::Medium))
            .unwrap_err();
        assert!(matches!(missing, ResourceError::NotFound { .. }));
    }
}

#[test]
fn test_optimize_reports_component() {
    for allocator in allocators() {
        let report = allocator.optimize().unwrap();
        assert_eq!(report.component, allocator.name());
        assert!(!report.passes.is_empty());
    }
}
