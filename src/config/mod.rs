//! Configuration models for the allocators, the scheduler and the manager.

pub mod resource;

pub use resource::{
    AttentionConfig, ComputeConfig, ComputeNodeConfig, ManagerConfig, MemoryConfig,
    MemoryTierConfig, MemoryTiersConfig, SchedulerConfig,
};
