//! Allocators, the scheduler and the manager that composes them.

pub mod allocator;
pub mod attention;
pub mod audit;
pub mod compute;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod memory;
pub mod model;
pub mod scheduler;

pub use allocator::{
    AllocationLedger, LiveAllocation, OptimizationReport, PassOutcome, ResourceAllocator,
};
pub use attention::{AttentionFocus, AttentionManager, AttentionStats, ContextSnapshot};
pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use compute::{ComputeResourceAllocator, ComputeStats, NodeSnapshot};
pub use error::{AppResult, ResourceError};
pub use lifecycle::Lifecycle;
pub use manager::{
    ManagerStats, OptimizationSummary, PerformanceReport, ResourceProfile, UnifiedResourceManager,
};
pub use memory::{MemoryBlock, MemoryManager, MemoryPoolKind, MemoryStats, MemoryTierKind};
pub use model::{Metadata, ResourceAllocation, ResourceRequirements, ResourceUtilization};
pub use scheduler::{
    DependencyKind, PreemptionOutcome, PriorityScheduler, ResourceBroker, SchedulerStats,
    SchedulingPolicy, Task, TaskRunner, TaskSpec, TaskState,
};
