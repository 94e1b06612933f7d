//! Tests for configuration validation

use prometheus_resource_core::config::{
    ComputeConfig, ComputeNodeConfig, ManagerConfig, MemoryConfig, SchedulerConfig,
};

#[test]
fn test_defaults_are_valid() {
    let cfg = ManagerConfig::default();
    assert!(cfg.validate().is_ok());
    assert!((cfg.compute.total_compute_units - 1.0).abs() < f64::EPSILON);
    assert_eq!(cfg.memory.total_memory, 1 << 30);
    assert_eq!(cfg.memory.effective_cache_size(), (1 << 30) / 10);
    assert_eq!(cfg.scheduler.max_concurrent_tasks, 10);
    assert!(cfg.scheduler.preemption_enabled);
    assert_eq!(cfg.scheduler.task_timeout_secs, 3600);
    assert_eq!(cfg.optimization_interval_secs, 300);
    assert_eq!(cfg.memory.gc_interval_secs, 300);
    assert_eq!(cfg.memory.defrag_interval_secs, 3600);
    assert_eq!(cfg.attention.decay_interval_secs, 5);
    assert_eq!(cfg.attention.refresh_interval_secs, 60);
}

#[test]
fn test_compute_node_validation() {
    let mut cfg = ComputeConfig::default();
    cfg.compute_nodes.insert(
        "gpu".into(),
        ComputeNodeConfig {
            capacity: 0.5,
            load: 0.6,
            efficiency: 1.0,
        },
    );
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("gpu"));
}

#[test]
fn test_memory_tiers_must_sum_to_one() {
    let mut cfg = MemoryConfig::default();
    cfg.memory_tiers.fast.capacity_fraction = 0.5;
    assert!(cfg.validate().unwrap_err().contains("sum to 1.0"));
}

#[test]
fn test_scheduler_thresholds_ordered() {
    let cfg = SchedulerConfig {
        low_load_threshold: 0.9,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_manager_validation_names_section() {
    let mut cfg = ManagerConfig::default();
    cfg.scheduler.max_concurrent_tasks = 0;
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("scheduler invalid"));
}

#[test]
fn test_from_json_str_fills_defaults() {
    let cfg = ManagerConfig::from_json_str(
        r#"{
            "compute": { "total_compute_units": 2.0, "max_compute_units": 8.0 },
            "scheduler": { "max_concurrent_tasks": 4, "preemption_enabled": false }
        }"#,
    )
    .unwrap();
    assert!((cfg.compute.total_compute_units - 2.0).abs() < f64::EPSILON);
    assert_eq!(cfg.scheduler.max_concurrent_tasks, 4);
    assert!(!cfg.scheduler.preemption_enabled);
    assert_eq!(cfg.memory, MemoryConfig::default());
}

#[test]
fn test_from_json_str_rejects_invalid() {
    let err = ManagerConfig::from_json_str(r#"{ "optimization_interval_secs": 0 }"#).unwrap_err();
    assert!(err.contains("optimization_interval_secs"));
    assert!(ManagerConfig::from_json_str("not json").unwrap_err().starts_with("parse error"));
}

#[test]
fn test_config_round_trips_through_json() {
    let cfg = ManagerConfig::default();
    let json = serde_json::to_string(&cfg).unwrap();
    let parsed = ManagerConfig::from_json_str(&json).unwrap();
    assert_eq!(parsed.memory.total_memory, cfg.memory.total_memory);
    assert_eq!(parsed.scheduler.max_queue_depth, cfg.scheduler.max_queue_depth);
    assert_eq!(parsed.audit_capacity, cfg.audit_capacity);
    assert!((parsed.attention.decay_rate - cfg.attention.decay_rate).abs() < 1e-12);
}
