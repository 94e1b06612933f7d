//! Tests for utility functions

use std::time::Duration;

use prometheus_resource_core::util::clock::{secs_between, Clock, ManualClock, SystemClock};
use prometheus_resource_core::util::serde::{new_id, Priority, ResourceKind};
use prometheus_resource_core::util::stats::{
    classify_trend, linear_regression, weighted_recent_delta, Trend,
};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Medium);
    assert!(Priority::Medium > Priority::Low);
    assert!(Priority::Low > Priority::Background);
}

#[test]
fn test_priority_weights() {
    let weights: Vec<f64> = Priority::ALL.iter().map(|p| p.weight()).collect();
    assert_eq!(weights, vec![0.2, 0.4, 0.6, 0.8, 1.0]);
    assert_eq!(Priority::default(), Priority::Medium);
}

#[test]
fn test_resource_kind_display() {
    assert_eq!(ResourceKind::Attention.to_string(), "attention");
}

#[test]
fn test_ids_are_unique() {
    assert_ne!(new_id(), new_id());
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(500);
    clock.advance(Duration::from_millis(1500));
    assert_eq!(clock.now_ms(), 2000);
    assert!((secs_between(500, clock.now_ms()) - 1.5).abs() < f64::EPSILON);
}

#[test]
fn test_system_clock_moves_forward() {
    let clock = SystemClock;
    let a = clock.now_ms();
    let b = clock.now_ms();
    assert!(b >= a);
    assert!(a > 0);
}

#[test]
fn test_trend_classification() {
    let rising = linear_regression(&[0.1, 0.2, 0.35, 0.5]).unwrap();
    assert_eq!(classify_trend(rising.slope, 0.01), Trend::Increasing);
    let flat = linear_regression(&[0.4, 0.4, 0.4]).unwrap();
    assert_eq!(classify_trend(flat.slope, 0.01), Trend::Stable);
}

#[test]
fn test_weighted_recent_delta_newest_first() {
    // Deltas oldest to newest: 0.1, 0.2. Newest gets weight 0.8.
    let delta = weighted_recent_delta(&[0.0, 0.1, 0.3], &[0.8, 0.6]).unwrap();
    assert!((delta - (0.2 * 0.8 + 0.1 * 0.6)).abs() < 1e-12);
    assert!(weighted_recent_delta(&[0.5], &[0.8]).is_none());
}
