//! # Prometheus Resource Core
//!
//! Unified resource allocation and priority scheduling for the Prometheus AI
//! platform.
//!
//! Cognitive workloads compete for three kinds of capacity: compute, memory
//! and attention. This crate accounts each of them with its own allocator,
//! composes them behind a single manager, and orders queued work with a
//! priority scheduler that can displace lower priority work when critical
//! tasks arrive.
//!
//! ## Components
//!
//! - **`ComputeResourceAllocator`**: normalized compute units over one or more
//!   nodes, adaptive sizing from task complexity, node rebalancing and
//!   predictive auto-scaling.
//! - **`MemoryManager`**: a byte budget split into fast/standard/slow tiers and
//!   purpose pools, with named blocks, LRU eviction, garbage collection,
//!   defragmentation, caching, tier migration and predictive reservation.
//! - **`AttentionManager`**: a unit attention budget divided into foci grouped
//!   by context, with decay, refresh, context switching and distraction
//!   filtering.
//! - **`PriorityScheduler`**: effective priority with starvation, deadline,
//!   fairness and dependency terms, pluggable policies and preemption.
//! - **`UnifiedResourceManager`**: all-or-nothing composite allocation,
//!   interaction and thought profiles with fallback, periodic optimization and
//!   an audit trail.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use prometheus_resource_core::builders::ManagerBuilder;
//! use prometheus_resource_core::config::ManagerConfig;
//! use prometheus_resource_core::core::ResourceRequirements;
//! use prometheus_resource_core::util::serde::Priority;
//!
//! let manager = ManagerBuilder::new(ManagerConfig::default()).started().build()?;
//!
//! let req = ResourceRequirements::new(Priority::High)
//!     .with_compute(0.3)
//!     .with_memory(0.2)
//!     .with_attention(0.4);
//! let allocation = manager.allocate_resources(&req)?;
//! // ... do the work ...
//! manager.release_resources(&allocation.id)?;
//!
//! // Interactions never fail for capacity; they degrade to a fallback.
//! let interaction = manager.allocate_resources_for_interaction("42", "query")?;
//! manager.release_resources(&interaction.id)?;
//! ```
//!
//! Every component reads time through [`util::clock::Clock`], so tests drive
//! decay, starvation and interval gates with a `ManualClock`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Allocators, scheduler, manager and their shared model.
pub mod core;
/// Configuration models for the allocators, the scheduler and the manager.
pub mod config;
/// Builders to construct the manager from configuration.
pub mod builders;
/// Spawning and periodic background loops.
pub mod runtime;
/// Shared utilities.
pub mod util;
