//! Unified resource manager.
//!
//! Composes the compute, memory and attention allocators into a single
//! allocation, owns the priority scheduler, and runs periodic optimization.
//! Composite allocations are serialized by one lock that is held across the
//! three allocator calls; allocators never call back into the manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::core::allocator::{OptimizationReport, ResourceAllocator};
use crate::core::attention::{AttentionManager, AttentionStats, FOCUS_TARGET_KEY};
use crate::core::audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
use crate::core::compute::{ComputeResourceAllocator, ComputeStats, NodeSnapshot};
use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::memory::{MemoryManager, MemoryStats, PoolSnapshot, TierSnapshot};
use crate::core::model::{
    Metadata, ResourceAllocation, ResourceRequirements, ResourceUtilization, UtilizationHistory,
    DUMMY_MARKER,
};
use crate::core::scheduler::{
    default_policies, PriorityScheduler, ResourceBroker, SchedulerStats, SchedulingPolicy,
};
use crate::util::clock::{secs_to_ms, Clock};
use crate::util::serde::{new_id, AllocationId, Priority};
use crate::util::stats::{classify_trend, linear_regression, Trend};

const COMPONENT: &str = "manager";
/// Share requested by the reduced fallback profile.
pub const FALLBACK_SHARE: f64 = 0.05;
/// Share reported by a synthesized dummy allocation.
pub const DUMMY_SHARE: f64 = 0.01;
const UTILIZATION_HISTORY: usize = 100;
const TREND_TOLERANCE: f64 = 0.01;

/// Requested shares and priority for one kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Compute share.
    pub compute: f64,
    /// Memory share.
    pub memory: f64,
    /// Attention share.
    pub attention: f64,
    /// Priority of the request.
    pub priority: Priority,
}

impl ResourceProfile {
    const fn new(compute: f64, memory: f64, attention: f64, priority: Priority) -> Self {
        Self {
            compute,
            memory,
            attention,
            priority,
        }
    }

    /// Profile for a user interaction type.
    #[must_use]
    pub fn for_interaction(interaction_type: &str) -> Self {
        match interaction_type {
            "query" => Self::new(0.3, 0.2, 0.4, Priority::High),
            "command" => Self::new(0.4, 0.2, 0.5, Priority::High),
            "conversation" => Self::new(0.2, 0.15, 0.3, Priority::Medium),
            _ => Self::new(0.2, 0.1, 0.3, Priority::Medium),
        }
    }

    /// Profile for a background thought type.
    #[must_use]
    pub fn for_thought(thought_type: &str) -> Self {
        match thought_type {
            "insight" => Self::new(0.4, 0.3, 0.3, Priority::Medium),
            "reflection" => Self::new(0.3, 0.2, 0.2, Priority::Low),
            "planning" => Self::new(0.4, 0.25, 0.35, Priority::High),
            _ => Self::new(0.25, 0.15, 0.2, Priority::Low),
        }
    }

    /// The profile as a request.
    #[must_use]
    pub fn requirements(&self) -> ResourceRequirements {
        ResourceRequirements::new(self.priority)
            .with_compute(self.compute)
            .with_memory(self.memory)
            .with_attention(self.attention)
    }
}

/// Counters for composite allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Composite allocations granted, fallbacks and dummies included.
    pub allocations: u64,
    /// Composite allocations released.
    pub releases: u64,
    /// Composite requests rejected.
    pub failures: u64,
    /// Partial allocations undone.
    pub rollbacks: u64,
    /// Profile requests served by the reduced fallback.
    pub fallbacks: u64,
    /// Dummy allocations synthesized.
    pub dummies: u64,
    /// Allocations reclaimed after their deadline.
    pub expirations: u64,
    /// Composite allocations currently live.
    pub live: usize,
}

/// Aggregate view for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// When the report was taken.
    pub timestamp_ms: u128,
    /// Manager lifecycle.
    pub lifecycle: Lifecycle,
    /// Current utilization across kinds.
    pub utilization: ResourceUtilization,
    /// Direction of mean utilization over recent samples.
    pub utilization_trend: Trend,
    /// Composite allocation counters.
    pub allocations: ManagerStats,
    /// Compute allocator counters.
    pub compute: ComputeStats,
    /// Compute trend from the allocator's own history.
    pub compute_trend: Trend,
    /// Capacity-weighted node efficiency.
    pub compute_efficiency: f64,
    /// Compute nodes.
    pub nodes: Vec<NodeSnapshot>,
    /// Memory manager counters.
    pub memory: MemoryStats,
    /// Memory tiers.
    pub tiers: Vec<TierSnapshot>,
    /// Memory pools.
    pub pools: Vec<PoolSnapshot>,
    /// Attention manager counters.
    pub attention: AttentionStats,
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Last manager-wide optimization.
    pub last_optimization_ms: u128,
}

/// Outcome of a manager-wide optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizationSummary {
    /// Reports from allocators that ran.
    pub reports: Vec<OptimizationReport>,
    /// Allocators whose `optimize` returned an error.
    pub failures: BTreeMap<String, String>,
    /// Composite allocations reclaimed after their deadline.
    pub expired: usize,
    /// When the optimization ran.
    pub timestamp_ms: u128,
}

impl OptimizationSummary {
    /// Report of one allocator.
    #[must_use]
    pub fn report(&self, component: &str) -> Option<&OptimizationReport> {
        self.reports.iter().find(|r| r.component == component)
    }

    /// Sum of actions across every allocator.
    #[must_use]
    pub fn total_actions(&self) -> usize {
        self.reports.iter().map(OptimizationReport::total_actions).sum()
    }
}

#[derive(Debug, Clone)]
struct CompositeRecord {
    allocation: ResourceAllocation,
    compute_id: Option<AllocationId>,
    memory_id: Option<AllocationId>,
    attention_id: Option<AllocationId>,
}

#[derive(Default)]
struct CompositeState {
    live: HashMap<AllocationId, CompositeRecord>,
    stats: ManagerStats,
}

/// Composite allocation over the three allocators. Also the scheduler's
/// resource broker.
struct AllocationCore {
    total_memory: u64,
    clock: Arc<dyn Clock>,
    compute: Arc<ComputeResourceAllocator>,
    memory: Arc<MemoryManager>,
    attention: Arc<AttentionManager>,
    composite: Mutex<CompositeState>,
    audit: Mutex<Box<dyn AuditSink>>,
}

impl AllocationCore {
    fn audit(&self, allocation: &ResourceAllocation, action: AuditAction, detail: Metadata) {
        let event = build_audit_event(
            allocation.id.clone(),
            action,
            allocation.priority,
            self.clock.now_ms(),
            detail,
        );
        self.audit.lock().record(event);
    }

    fn allocators(&self) -> [&dyn ResourceAllocator; 3] {
        [
            self.compute.as_ref(),
            self.memory.as_ref(),
            self.attention.as_ref(),
        ]
    }

    /// Undo granted phases in reverse order.
    fn unwind(&self, granted: &[(&dyn ResourceAllocator, AllocationId)]) {
        for (allocator, id) in granted.iter().rev() {
            if let Err(err) = allocator.rollback(id) {
                warn!(component = allocator.name(), allocation_id = %id, error = %err, "rollback failed");
            }
        }
    }

    fn allocate(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let mut composite = self.composite.lock();

        let shares = [req.compute, req.memory, req.attention];
        let mut granted: Vec<(&dyn ResourceAllocator, AllocationId)> = Vec::new();
        let mut parts: [Option<ResourceAllocation>; 3] = [None, None, None];
        for (index, allocator) in self.allocators().into_iter().enumerate() {
            if shares[index] <= 0.0 {
                continue;
            }
            match allocator.allocate(req) {
                Ok(part) => {
                    granted.push((allocator, part.id.clone()));
                    parts[index] = Some(part);
                }
                Err(err) => {
                    self.unwind(&granted);
                    composite.stats.failures += 1;
                    if !granted.is_empty() {
                        composite.stats.rollbacks += 1;
                        let mut detail = Metadata::new();
                        detail.insert("failed_component".into(), allocator.name().into());
                        detail.insert("error".into(), err.to_string());
                        let partial = ResourceAllocation::empty(new_id(), req, now);
                        drop(composite);
                        self.audit(&partial, AuditAction::Rollback, detail);
                    }
                    debug!(component = allocator.name(), error = %err, "composite allocation failed");
                    return Err(err);
                }
            }
        }

        let [compute, memory, attention] = parts;
        let mut allocation = ResourceAllocation::empty(new_id(), req, now);
        let mut record = CompositeRecord {
            allocation: allocation.clone(),
            compute_id: None,
            memory_id: None,
            attention_id: None,
        };
        for part in [&compute, &memory, &attention].into_iter().flatten() {
            for (key, value) in &part.metadata {
                allocation.metadata.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(part) = compute {
            allocation.compute = part.compute;
            record.compute_id = Some(part.id);
        }
        if let Some(part) = memory {
            allocation.memory_bytes = part.memory_bytes;
            record.memory_id = Some(part.id);
        }
        if let Some(part) = attention {
            allocation.attention = part.attention;
            record.attention_id = Some(part.id);
        }
        record.allocation = allocation.clone();
        composite.live.insert(allocation.id.clone(), record);
        composite.stats.allocations += 1;
        drop(composite);

        info!(
            allocation_id = %allocation.id,
            compute = allocation.compute,
            memory_bytes = allocation.memory_bytes,
            attention = allocation.attention,
            priority = %allocation.priority,
            "resources allocated"
        );
        self.audit(&allocation, AuditAction::Allocate, allocation.metadata.clone());
        Ok(allocation)
    }

    /// Register an allocation backed by nothing.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn dummy(&self, req: &ResourceRequirements) -> ResourceAllocation {
        let now = self.clock.now_ms();
        let mut allocation = ResourceAllocation::empty(new_id(), req, now);
        allocation.compute = DUMMY_SHARE;
        allocation.memory_bytes = (self.total_memory as f64 * DUMMY_SHARE) as u64;
        allocation.attention = DUMMY_SHARE;
        allocation.metadata.insert(DUMMY_MARKER.into(), "true".into());
        let mut composite = self.composite.lock();
        composite.live.insert(
            allocation.id.clone(),
            CompositeRecord {
                allocation: allocation.clone(),
                compute_id: None,
                memory_id: None,
                attention_id: None,
            },
        );
        composite.stats.allocations += 1;
        composite.stats.dummies += 1;
        drop(composite);
        self.audit(&allocation, AuditAction::Dummy, allocation.metadata.clone());
        allocation
    }

    fn release_with(&self, id: &str, action: AuditAction) -> Result<bool, ResourceError> {
        let mut composite = self.composite.lock();
        let Some(record) = composite.live.remove(id) else {
            return Ok(false);
        };
        let parts = [
            (self.compute.as_ref() as &dyn ResourceAllocator, &record.compute_id),
            (self.memory.as_ref() as &dyn ResourceAllocator, &record.memory_id),
            (self.attention.as_ref() as &dyn ResourceAllocator, &record.attention_id),
        ];
        let mut first_error = None;
        for (allocator, part) in parts {
            let Some(part) = part else { continue };
            match allocator.release(part) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(component = allocator.name(), allocation_id = %part, "sub-allocation already gone");
                }
                Err(err) => {
                    warn!(component = allocator.name(), allocation_id = %part, error = %err, "sub-allocation release failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match action {
            AuditAction::Expire => composite.stats.expirations += 1,
            _ => composite.stats.releases += 1,
        }
        drop(composite);
        if let Some(err) = first_error {
            return Err(err);
        }
        debug!(allocation_id = %id, action = %action, "resources released");
        self.audit(&record.allocation, action, Metadata::new());
        Ok(true)
    }

    fn reclaim_expired(&self, now_ms: u128) -> usize {
        let expired: Vec<AllocationId> = self
            .composite
            .lock()
            .live
            .values()
            .filter(|r| r.allocation.is_expired(now_ms))
            .map(|r| r.allocation.id.clone())
            .collect();
        let mut reclaimed = 0;
        for id in expired {
            match self.release_with(&id, AuditAction::Expire) {
                Ok(true) => {
                    warn!(allocation_id = %id, "expired allocation reclaimed");
                    reclaimed += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(allocation_id = %id, error = %err, "failed to reclaim expired allocation"),
            }
        }
        reclaimed
    }

    fn utilization(&self) -> ResourceUtilization {
        let compute = self.compute.get_utilization();
        let memory = self.memory.get_utilization();
        let attention = self.attention.get_utilization();
        ResourceUtilization {
            compute: compute.compute,
            memory: memory.memory,
            attention: attention.attention,
            network: 0.0,
            storage: 0.0,
            timestamp_ms: self.clock.now_ms(),
        }
    }
}

impl ResourceBroker for AllocationCore {
    fn acquire(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        self.allocate(req)
    }

    fn relinquish(&self, allocation_id: &str) -> Result<bool, ResourceError> {
        self.release_with(allocation_id, AuditAction::Release)
    }

    fn headroom(&self) -> ResourceUtilization {
        let used = self.utilization();
        ResourceUtilization {
            compute: (1.0 - used.compute).max(0.0),
            memory: (1.0 - used.memory).max(0.0),
            attention: (1.0 - used.attention).max(0.0),
            network: 1.0,
            storage: 1.0,
            timestamp_ms: used.timestamp_ms,
        }
    }

    fn system_load(&self) -> f64 {
        let used = self.utilization();
        (used.compute + used.memory + used.attention) / 3.0
    }
}

struct ManagerState {
    lifecycle: Lifecycle,
    last_optimization_ms: u128,
    history: UtilizationHistory,
}

struct ManagerInner {
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    core: Arc<AllocationCore>,
    scheduler: PriorityScheduler,
    state: Mutex<ManagerState>,
}

/// Cloneable handle to the unified resource manager.
#[derive(Clone)]
pub struct UnifiedResourceManager {
    inner: Arc<ManagerInner>,
}

impl UnifiedResourceManager {
    /// Manager with an in-memory audit sink and the built-in scheduling
    /// policies.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn new(config: ManagerConfig, clock: Arc<dyn Clock>) -> Result<Self, ResourceError> {
        let sink = Box::new(InMemoryAuditSink::new(config.audit_capacity));
        Self::with_parts(config, clock, sink, default_policies())
    }

    /// Manager with an explicit audit sink and scheduling policies.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn with_parts(
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
        audit: Box<dyn AuditSink>,
        policies: Vec<Box<dyn SchedulingPolicy>>,
    ) -> Result<Self, ResourceError> {
        config.validate().map_err(ResourceError::InvalidConfig)?;
        let compute = Arc::new(ComputeResourceAllocator::new(
            config.compute.clone(),
            Arc::clone(&clock),
        )?);
        let memory = Arc::new(MemoryManager::new(config.memory.clone(), Arc::clone(&clock))?);
        let attention = Arc::new(AttentionManager::new(
            config.attention.clone(),
            Arc::clone(&clock),
        )?);
        let core = Arc::new(AllocationCore {
            total_memory: config.memory.total_memory,
            clock: Arc::clone(&clock),
            compute,
            memory,
            attention,
            composite: Mutex::new(CompositeState::default()),
            audit: Mutex::new(audit),
        });
        let scheduler = PriorityScheduler::with_policies(
            config.scheduler.clone(),
            Arc::clone(&core) as Arc<dyn ResourceBroker>,
            Arc::clone(&clock),
            policies,
        )?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    lifecycle: Lifecycle::Uninitialized,
                    last_optimization_ms: 0,
                    history: UtilizationHistory::new(UTILIZATION_HISTORY),
                }),
                config,
                clock,
                core,
                scheduler,
            }),
        })
    }

    /// Manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Build every allocator's structures without accepting work.
    pub fn initialize(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            return;
        }
        self.inner.core.compute.initialize();
        self.inner.core.memory.initialize();
        self.inner.core.attention.initialize();
        state.lifecycle = Lifecycle::Initialized;
    }

    /// Start the allocators and the scheduler.
    ///
    /// # Errors
    /// The first allocator start failure.
    pub fn start(&self) -> Result<(), ResourceError> {
        self.initialize();
        for allocator in self.inner.core.allocators() {
            allocator.start()?;
        }
        self.inner.scheduler.start();
        let mut state = self.inner.state.lock();
        state.lifecycle = Lifecycle::Running;
        state.last_optimization_ms = self.inner.clock.now_ms();
        info!(
            optimization_interval_secs = self.inner.config.optimization_interval_secs,
            "resource manager running"
        );
        Ok(())
    }

    /// Stop the scheduler and the allocators. Live allocations are kept.
    pub fn stop(&self) {
        self.inner.scheduler.stop();
        for allocator in self.inner.core.allocators() {
            allocator.stop();
        }
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            info!(live = self.inner.core.composite.lock().live.len(), "resource manager stopped");
        }
    }

    fn ensure_running(&self) -> Result<(), ResourceError> {
        self.inner.state.lock().lifecycle.ensure_running(COMPONENT)
    }

    /// Allocate compute, memory and attention together. On any failure the
    /// phases already granted are rolled back.
    ///
    /// # Errors
    /// `CapacityExceeded` from the first phase that ran short, `NotRunning`.
    pub fn allocate_resources(
        &self,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        self.ensure_running()?;
        self.inner.core.allocate(req)
    }

    /// Release a composite allocation. Unknown or already released ids
    /// return `Ok(false)`.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn release_resources(&self, id: &str) -> Result<bool, ResourceError> {
        self.ensure_running()?;
        self.inner.core.release_with(id, AuditAction::Release)
    }

    /// Allocate for a user interaction. Falls back to a reduced profile and
    /// finally to a dummy allocation; never fails for capacity.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn allocate_resources_for_interaction(
        &self,
        interaction_id: &str,
        interaction_type: &str,
    ) -> Result<ResourceAllocation, ResourceError> {
        let req = ResourceProfile::for_interaction(interaction_type)
            .requirements()
            .with_metadata(FOCUS_TARGET_KEY, format!("interaction:{interaction_id}"))
            .with_metadata("interaction_id", interaction_id)
            .with_metadata("interaction_type", interaction_type);
        self.allocate_with_fallback(&req)
    }

    /// Allocate for a background thought. Same fallback chain as
    /// interactions.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn allocate_resources_for_thought(
        &self,
        thought_id: &str,
        thought_type: &str,
    ) -> Result<ResourceAllocation, ResourceError> {
        let req = ResourceProfile::for_thought(thought_type)
            .requirements()
            .with_metadata(FOCUS_TARGET_KEY, format!("thought:{thought_id}"))
            .with_metadata("thought_id", thought_id)
            .with_metadata("thought_type", thought_type);
        self.allocate_with_fallback(&req)
    }

    fn allocate_with_fallback(
        &self,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        self.ensure_running()?;
        let core = &self.inner.core;
        let first = match core.allocate(req) {
            Err(err) if err.is_capacity() => err,
            other => return other,
        };

        let mut reduced = req.clone();
        reduced.compute = FALLBACK_SHARE;
        reduced.memory = FALLBACK_SHARE;
        reduced.attention = FALLBACK_SHARE;
        match core.allocate(&reduced) {
            Ok(allocation) => {
                core.composite.lock().stats.fallbacks += 1;
                warn!(allocation_id = %allocation.id, error = %first, "served by fallback profile");
                let mut detail = Metadata::new();
                detail.insert("error".into(), first.to_string());
                core.audit(&allocation, AuditAction::Fallback, detail);
                Ok(allocation)
            }
            Err(err) if err.is_capacity() => {
                let allocation = core.dummy(req);
                warn!(allocation_id = %allocation.id, error = %err, "served by dummy allocation");
                Ok(allocation)
            }
            Err(err) => Err(err),
        }
    }

    /// Snapshot of a live composite allocation.
    #[must_use]
    pub fn allocation(&self, id: &str) -> Option<ResourceAllocation> {
        self.inner
            .core
            .composite
            .lock()
            .live
            .get(id)
            .map(|r| r.allocation.clone())
    }

    /// Number of live composite allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.inner.core.composite.lock().live.len()
    }

    /// Current utilization across compute, memory and attention. The sample
    /// is kept for trend analysis.
    #[must_use]
    pub fn get_resource_utilization(&self) -> ResourceUtilization {
        let sample = self.inner.core.utilization();
        self.inner.state.lock().history.push(sample);
        sample
    }

    /// Counters, utilization, trends and per-component details.
    #[must_use]
    pub fn get_performance_report(&self) -> PerformanceReport {
        let utilization = self.get_resource_utilization();
        let core = &self.inner.core;
        let (lifecycle, last_optimization_ms, utilization_trend) = {
            let state = self.inner.state.lock();
            let series = state
                .history
                .series(|s| (s.compute + s.memory + s.attention) / 3.0);
            let trend = linear_regression(&series)
                .map_or(Trend::Stable, |fit| classify_trend(fit.slope, TREND_TOLERANCE));
            (state.lifecycle, state.last_optimization_ms, trend)
        };
        let allocations = {
            let composite = core.composite.lock();
            ManagerStats {
                live: composite.live.len(),
                ..composite.stats.clone()
            }
        };
        PerformanceReport {
            timestamp_ms: utilization.timestamp_ms,
            lifecycle,
            utilization,
            utilization_trend,
            allocations,
            compute: core.compute.stats(),
            compute_trend: core.compute.trend(),
            compute_efficiency: core.compute.efficiency_score(),
            nodes: core.compute.nodes(),
            memory: core.memory.stats(),
            tiers: core.memory.tiers(),
            pools: core.memory.pools(),
            attention: core.attention.stats(),
            scheduler: self.inner.scheduler.stats(),
            last_optimization_ms,
        }
    }

    /// Run [`Self::optimize`] if the optimization interval has elapsed.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn check_optimization(&self) -> Result<Option<OptimizationSummary>, ResourceError> {
        self.ensure_running()?;
        let now = self.inner.clock.now_ms();
        let due = {
            let state = self.inner.state.lock();
            now.saturating_sub(state.last_optimization_ms)
                >= secs_to_ms(self.inner.config.optimization_interval_secs)
        };
        if due {
            self.optimize().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reclaim expired composite allocations, then run every allocator's
    /// optimization passes. An allocator failure is recorded and does not
    /// stop the others.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn optimize(&self) -> Result<OptimizationSummary, ResourceError> {
        self.ensure_running()?;
        let now = self.inner.clock.now_ms();
        let mut summary = OptimizationSummary {
            expired: self.inner.core.reclaim_expired(now),
            timestamp_ms: now,
            ..OptimizationSummary::default()
        };
        for allocator in self.inner.core.allocators() {
            match allocator.optimize() {
                Ok(report) => summary.reports.push(report),
                Err(err) => {
                    warn!(component = allocator.name(), error = %err, "optimization failed");
                    summary.failures.insert(allocator.name().to_string(), err.to_string());
                }
            }
        }
        let sample = self.inner.core.utilization();
        {
            let mut state = self.inner.state.lock();
            state.last_optimization_ms = now;
            state.history.push(sample);
        }
        info!(
            expired = summary.expired,
            actions = summary.total_actions(),
            failures = summary.failures.len(),
            "optimization finished"
        );
        Ok(summary)
    }

    /// Retained audit events, oldest first.
    #[must_use]
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.core.audit.lock().events()
    }

    /// The scheduler, which acquires resources through this manager.
    #[must_use]
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    /// The compute allocator.
    #[must_use]
    pub fn compute(&self) -> &Arc<ComputeResourceAllocator> {
        &self.inner.core.compute
    }

    /// The memory manager.
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.inner.core.memory
    }

    /// The attention manager.
    #[must_use]
    pub fn attention(&self) -> &Arc<AttentionManager> {
        &self.inner.core.attention
    }

    /// Spawn the periodic loops: manager optimization, attention decay,
    /// memory maintenance and the scheduler tick with its timeout sweep.
    #[cfg(feature = "tokio-runtime")]
    pub fn start_background(
        &self,
        handle: &tokio::runtime::Handle,
    ) -> crate::runtime::BackgroundTasks {
        use std::time::Duration;

        use crate::runtime::{BackgroundTasks, PeriodicTask};

        let config = &self.inner.config;
        let mut tasks = BackgroundTasks::new();

        let manager = self.clone();
        tasks.push(PeriodicTask::spawn(
            handle,
            "optimization",
            Duration::from_secs(config.optimization_interval_secs),
            move || {
                if let Err(err) = manager.check_optimization() {
                    debug!(error = %err, "optimization loop idle");
                }
            },
        ));

        let attention = Arc::clone(&self.inner.core.attention);
        tasks.push(PeriodicTask::spawn(
            handle,
            "attention",
            Duration::from_secs(config.attention.decay_interval_secs.max(1)),
            move || {
                if let Err(err) = attention.optimize() {
                    debug!(error = %err, "attention loop idle");
                }
            },
        ));

        let memory = Arc::clone(&self.inner.core.memory);
        tasks.push(PeriodicTask::spawn(
            handle,
            "memory",
            Duration::from_secs(config.memory.gc_interval_secs.max(1)),
            move || {
                if let Err(err) = memory.optimize() {
                    debug!(error = %err, "memory loop idle");
                }
            },
        ));

        let scheduler = self.inner.scheduler.clone();
        tasks.push(PeriodicTask::spawn(
            handle,
            "scheduler",
            Duration::from_millis(config.scheduler.schedule_interval_ms),
            move || {
                if let Err(err) = scheduler.tick() {
                    debug!(error = %err, "scheduler loop idle");
                }
            },
        ));

        info!(loops = tasks.len(), "background loops started");
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    fn manager() -> UnifiedResourceManager {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let manager = UnifiedResourceManager::new(ManagerConfig::default(), clock).unwrap();
        manager.start().unwrap();
        manager
    }

    #[test]
    fn profiles_match_task_types() {
        let query = ResourceProfile::for_interaction("query");
        assert!((query.attention - 0.4).abs() < 1e-9);
        assert_eq!(query.priority, Priority::High);
        assert_eq!(ResourceProfile::for_thought("unknown").priority, Priority::Low);
        assert_eq!(ResourceProfile::for_thought("planning").priority, Priority::High);
    }

    #[test]
    fn composite_links_sub_allocations() {
        let m = manager();
        let req = ResourceRequirements::uniform(0.2, Priority::Medium);
        let allocation = m.allocate_resources(&req).unwrap();
        for key in ["compute_allocation_id", "memory_allocation_id", "attention_allocation_id", "compute_node"] {
            assert!(allocation.metadata.contains_key(key), "missing {key}");
        }
        assert!((allocation.compute - 0.2).abs() < 1e-9);
        assert!(m.release_resources(&allocation.id).unwrap());
        assert!(!m.release_resources(&allocation.id).unwrap());
        assert!(m.get_resource_utilization().compute.abs() < 1e-9);
    }

    #[test]
    fn failed_phase_rolls_back_earlier_ones() {
        let m = manager();
        let hog = ResourceRequirements::new(Priority::High).with_attention(0.9);
        m.allocate_resources(&hog).unwrap();
        let req = ResourceRequirements::uniform(0.3, Priority::Medium);
        let err = m.allocate_resources(&req).unwrap_err();
        assert!(err.is_capacity());
        let used = m.get_resource_utilization();
        assert!(used.compute.abs() < 1e-9);
        assert!(used.memory.abs() < 1e-9);
        assert!(m
            .audit_events()
            .iter()
            .any(|e| e.action == AuditAction::Rollback));
    }

    #[test]
    fn not_running_rejects_work() {
        let clock = Arc::new(ManualClock::new(0));
        let m = UnifiedResourceManager::new(ManagerConfig::default(), clock).unwrap();
        let err = m
            .allocate_resources(&ResourceRequirements::uniform(0.1, Priority::Low))
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotRunning { .. }));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut config = ManagerConfig::default();
        config.compute.total_compute_units = 0.0;
        let clock = Arc::new(ManualClock::new(0));
        assert!(matches!(
            UnifiedResourceManager::new(config, clock),
            Err(ResourceError::InvalidConfig(_))
        ));
    }
}
