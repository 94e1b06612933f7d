//! Compute allocator: a normalized pool of compute units spread over one or
//! more nodes, with adaptive sizing, load balancing and predictive scaling.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ComputeConfig;
use crate::core::allocator::{
    capacity_error, AllocationLedger, LiveAllocation, OptimizationReport, ResourceAllocator,
    CAPACITY_EPSILON,
};
use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::model::{
    ResourceAllocation, ResourceRequirements, ResourceUtilization, UtilizationHistory,
};
use crate::util::clock::{secs_to_ms, Clock};
use crate::util::serde::{Priority, ResourceKind};
use crate::util::stats::{classify_trend, linear_regression, weighted_recent_delta, Trend};

const COMPONENT: &str = "compute";
const DEFAULT_NODE: &str = "local";
/// Weights applied to the most recent utilization deltas, newest first.
pub const PREDICTION_WEIGHTS: [f64; 5] = [0.8, 0.6, 0.4, 0.2, 0.1];
/// Predicted increase above which auto-scaling kicks in.
pub const SCALE_TRIGGER: f64 = 0.2;
/// Largest single scaling step.
pub const MAX_SCALE_STEP: f64 = 0.5;
/// Nodes within this fraction of the mean load are considered balanced.
pub const BALANCE_TOLERANCE: f64 = 0.2;

#[derive(Debug, Clone)]
struct ComputeNode {
    capacity: f64,
    base_load: f64,
    allocated: f64,
    efficiency: f64,
}

impl ComputeNode {
    fn load(&self) -> f64 {
        self.base_load + self.allocated
    }

    fn load_ratio(&self) -> f64 {
        if self.capacity <= 0.0 {
            1.0
        } else {
            self.load() / self.capacity
        }
    }

    fn available(&self) -> f64 {
        (self.capacity - self.load()).max(0.0)
    }
}

/// Read-only view of a compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node name.
    pub name: String,
    /// Capacity in compute units.
    pub capacity: f64,
    /// Units granted by this allocator.
    pub allocated: f64,
    /// Total load including pre-existing load.
    pub load: f64,
    /// Relative efficiency.
    pub efficiency: f64,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful releases.
    pub releases: u64,
    /// Allocations released to admit CRITICAL work.
    pub preemptions: u64,
    /// Requests rejected for capacity.
    pub failures: u64,
    /// Allocations moved between nodes.
    pub migrations: u64,
    /// Auto-scaling steps taken.
    pub scale_events: u64,
}

#[derive(Debug)]
struct ComputeState {
    lifecycle: Lifecycle,
    ledger: AllocationLedger,
    nodes: BTreeMap<String, ComputeNode>,
    history: UtilizationHistory,
    trend: Trend,
    last_scale_ms: u128,
    stats: ComputeStats,
}

impl ComputeState {
    fn record_sample(&mut self, now_ms: u128) {
        let sample = ResourceUtilization {
            compute: self.ledger.utilization(0.0),
            timestamp_ms: now_ms,
            ..ResourceUtilization::default()
        };
        self.history.push(sample);
    }

    /// Least loaded node that can host `amount`; ties go to the more efficient.
    fn pick_node(&self, amount: f64) -> Option<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.available() + CAPACITY_EPSILON >= amount)
            .min_by(|(_, a), (_, b)| {
                a.load_ratio()
                    .total_cmp(&b.load_ratio())
                    .then_with(|| b.efficiency.total_cmp(&a.efficiency))
            })
            .map(|(name, _)| name.clone())
    }

    fn detach(&mut self, allocation: &LiveAllocation) {
        if let Some(node) = allocation.tag.as_ref().and_then(|t| self.nodes.get_mut(t)) {
            node.allocated = (node.allocated - allocation.amount).max(0.0);
        }
    }

    fn snapshot(&self, allocation: &LiveAllocation, req: Option<&ResourceRequirements>) -> ResourceAllocation {
        let mut metadata = allocation.metadata.clone();
        if let Some(node) = &allocation.tag {
            metadata.insert("compute_node".into(), node.clone());
        }
        metadata.insert("compute_allocation_id".into(), allocation.id.clone());
        ResourceAllocation {
            id: allocation.id.clone(),
            compute: allocation.amount,
            memory_bytes: 0,
            attention: 0.0,
            network: req.map_or(0.0, |r| r.network),
            storage: req.map_or(0.0, |r| r.storage),
            priority: allocation.priority,
            allocated_at_ms: allocation.allocated_at_ms,
            expires_at_ms: allocation.expires_at_ms,
            metadata,
        }
    }
}

/// Allocator for normalized compute capacity.
pub struct ComputeResourceAllocator {
    config: ComputeConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ComputeState>,
}

impl ComputeResourceAllocator {
    /// Create an allocator. Fails fast on invalid configuration.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn new(config: ComputeConfig, clock: Arc<dyn Clock>) -> Result<Self, ResourceError> {
        config.validate().map_err(ResourceError::InvalidConfig)?;
        let history = UtilizationHistory::new(config.history_size);
        Ok(Self {
            state: Mutex::new(ComputeState {
                lifecycle: Lifecycle::Uninitialized,
                ledger: AllocationLedger::new(ResourceKind::Compute, 0.0),
                nodes: BTreeMap::new(),
                history,
                trend: Trend::Stable,
                last_scale_ms: 0,
                stats: ComputeStats::default(),
            }),
            config,
            clock,
        })
    }

    /// Build the pool and node table. Idempotent.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            return;
        }
        state.ledger = AllocationLedger::new(ResourceKind::Compute, self.config.total_compute_units);
        state.nodes = if self.config.compute_nodes.is_empty() {
            BTreeMap::from([(
                DEFAULT_NODE.to_string(),
                ComputeNode {
                    capacity: self.config.total_compute_units,
                    base_load: 0.0,
                    allocated: 0.0,
                    efficiency: 1.0,
                },
            )])
        } else {
            self.config
                .compute_nodes
                .iter()
                .map(|(name, node)| {
                    (
                        name.clone(),
                        ComputeNode {
                            capacity: node.capacity,
                            base_load: node.load,
                            allocated: 0.0,
                            efficiency: node.efficiency,
                        },
                    )
                })
                .collect()
        };
        state.lifecycle = Lifecycle::Initialized;
        debug!(nodes = state.nodes.len(), "compute allocator initialized");
    }

    /// Allocate for a task sized by its complexity and deadline.
    ///
    /// Requests `0.1 + 0.5·complexity` of the pool. Priority is CRITICAL under
    /// 60 seconds to the deadline, HIGH under 300 seconds, MEDIUM otherwise.
    ///
    /// # Errors
    /// `CapacityExceeded` or `NotRunning`.
    pub fn allocate_adaptive(
        &self,
        task_id: &str,
        complexity: f64,
        deadline_ms: Option<u128>,
    ) -> Result<ResourceAllocation, ResourceError> {
        let complexity = complexity.clamp(0.0, 1.0);
        let priority = self.priority_for_deadline(deadline_ms);
        let mut req = ResourceRequirements::new(priority)
            .with_compute(0.5f64.mul_add(complexity, 0.1))
            .with_metadata("task_id", task_id)
            .with_metadata("complexity", format!("{complexity:.3}"));
        req.deadline_ms = deadline_ms;
        self.allocate(&req)
    }

    /// Priority implied by the time left until `deadline_ms`.
    #[must_use]
    pub fn priority_for_deadline(&self, deadline_ms: Option<u128>) -> Priority {
        let Some(deadline) = deadline_ms else {
            return Priority::Medium;
        };
        let remaining_ms = deadline.saturating_sub(self.clock.now_ms());
        if remaining_ms < secs_to_ms(60) {
            Priority::Critical
        } else if remaining_ms < secs_to_ms(300) {
            Priority::High
        } else {
            Priority::Medium
        }
    }

    /// Load-weighted mean efficiency of the nodes, 1.0 when idle.
    #[must_use]
    pub fn efficiency_score(&self) -> f64 {
        let state = self.state.lock();
        let total_load: f64 = state.nodes.values().map(ComputeNode::load).sum();
        if total_load <= 0.0 {
            return 1.0;
        }
        state
            .nodes
            .values()
            .map(|n| n.load() * n.efficiency)
            .sum::<f64>()
            / total_load
    }

    /// Snapshot of every node.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .map(|(name, n)| NodeSnapshot {
                name: name.clone(),
                capacity: n.capacity,
                allocated: n.allocated,
                load: n.load(),
                efficiency: n.efficiency,
            })
            .collect()
    }

    /// Trend found by the last optimization pass.
    #[must_use]
    pub fn trend(&self) -> Trend {
        self.state.lock().trend
    }

    /// Current pool size, including auto-scaling.
    #[must_use]
    pub fn total_units(&self) -> f64 {
        self.state.lock().ledger.total()
    }

    /// Units currently granted.
    #[must_use]
    pub fn allocated_units(&self) -> f64 {
        self.state.lock().ledger.allocated()
    }

    /// Whether the running counter matches the live allocations.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let node_sum: f64 = state.nodes.values().map(|n| n.allocated).sum();
        state.ledger.is_consistent(0.0)
            && (node_sum - state.ledger.allocated()).abs() <= 1e-6
    }

    /// Monitoring counters.
    #[must_use]
    pub fn stats(&self) -> ComputeStats {
        self.state.lock().stats.clone()
    }

    /// Granted amount of a live allocation.
    #[must_use]
    pub fn allocation(&self, id: &str) -> Option<ResourceAllocation> {
        let state = self.state.lock();
        state.ledger.get(id).map(|a| state.snapshot(a, None))
    }

    fn release_expired(state: &mut ComputeState, now_ms: u128) -> usize {
        let expired = state.ledger.expired(now_ms);
        for id in &expired {
            if let Some(removed) = state.ledger.remove(id) {
                state.detach(&removed);
                state.stats.releases += 1;
                debug!(allocation_id = %id, "expired compute allocation released");
            }
        }
        if !expired.is_empty() {
            state.record_sample(now_ms);
        }
        expired.len()
    }

    /// Move the largest allocations off the most loaded node until every node
    /// is within [`BALANCE_TOLERANCE`] of the mean load ratio.
    fn rebalance_nodes(state: &mut ComputeState) -> usize {
        if state.nodes.len() < 2 {
            return 0;
        }
        let mut moves = 0;
        let limit = state.ledger.len();
        while moves < limit {
            let mean = state.nodes.values().map(ComputeNode::load_ratio).sum::<f64>()
                / state.nodes.len() as f64;
            let by_load = |a: &&ComputeNode, b: &&ComputeNode| a.load_ratio().total_cmp(&b.load_ratio());
            let Some((hot, hot_node)) = state.nodes.iter().max_by(|a, b| by_load(&a.1, &b.1)) else {
                break;
            };
            let Some((cold, cold_node)) = state.nodes.iter().min_by(|a, b| by_load(&a.1, &b.1)) else {
                break;
            };
            if hot == cold || hot_node.load_ratio() <= mean * (1.0 + BALANCE_TOLERANCE) {
                break;
            }
            let (hot, cold) = (hot.clone(), cold.clone());
            let hot_ratio = hot_node.load_ratio();
            let cold_available = cold_node.available();
            let cold_capacity = cold_node.capacity;
            let cold_load = cold_node.load();

            let mut candidates: Vec<&LiveAllocation> = state
                .ledger
                .iter()
                .filter(|a| a.tag.as_deref() == Some(hot.as_str()))
                .filter(|a| a.amount > 0.0 && a.amount <= cold_available + CAPACITY_EPSILON)
                .filter(|a| (cold_load + a.amount) / cold_capacity < hot_ratio)
                .collect();
            candidates.sort_by(|a, b| b.amount.total_cmp(&a.amount));
            let Some(chosen) = candidates.first().map(|a| (a.id.clone(), a.amount)) else {
                break;
            };

            let (id, amount) = chosen;
            if let Some(entry) = state.ledger.get_mut(&id) {
                entry.tag = Some(cold.clone());
            }
            if let Some(node) = state.nodes.get_mut(&hot) {
                node.allocated = (node.allocated - amount).max(0.0);
            }
            if let Some(node) = state.nodes.get_mut(&cold) {
                node.allocated += amount;
            }
            state.stats.migrations += 1;
            moves += 1;
            debug!(allocation_id = %id, from = %hot, to = %cold, amount, "compute allocation migrated");
        }
        moves
    }

    fn scale_pool(&self, state: &mut ComputeState, increase: f64) -> f64 {
        let step = increase.min(MAX_SCALE_STEP);
        let current = state.ledger.total();
        let target = (current * (1.0 + step)).min(self.config.max_compute_units);
        if target <= current + CAPACITY_EPSILON {
            return 0.0;
        }
        let factor = target / current;
        for node in state.nodes.values_mut() {
            node.capacity *= factor;
        }
        state.ledger.set_total(target);
        state.stats.scale_events += 1;
        info!(from = current, to = target, predicted_increase = increase, "compute pool scaled up");
        target - current
    }
}

impl ResourceAllocator for ComputeResourceAllocator {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    fn start(&self) -> Result<(), ResourceError> {
        self.initialize();
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Running;
        state.last_scale_ms = self.clock.now_ms();
        info!(total_units = state.ledger.total(), nodes = state.nodes.len(), "compute allocator running");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            info!("compute allocator stopped");
        }
    }

    fn allocate(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        // Shares are fractions of the live, possibly scaled, pool.
        let amount = req.compute * state.ledger.total();

        let mut displaced = Vec::new();
        let picked = state.pick_node(amount).filter(|_| state.ledger.fits(amount, 0.0));
        let node = match picked {
            Some(node) => node,
            None if req.priority == Priority::Critical => {
                // Preempt on the node where the fewest units need to be freed.
                let global_shortfall = amount - state.ledger.available(0.0);
                let target = state
                    .nodes
                    .iter()
                    .filter(|(_, n)| n.capacity + CAPACITY_EPSILON >= amount)
                    .min_by(|(_, a), (_, b)| b.available().total_cmp(&a.available()))
                    .map(|(name, n)| (name.clone(), amount - n.available()));
                let Some((node, node_shortfall)) = target else {
                    state.stats.failures += 1;
                    return Err(capacity_error(ResourceKind::Compute, amount, state.ledger.available(0.0)));
                };
                let shortfall = global_shortfall.max(node_shortfall);
                let on_node = node.clone();
                let Some(victims) = state
                    .ledger
                    .preempt(shortfall, |a| a.tag.as_deref() == Some(on_node.as_str()))
                else {
                    state.stats.failures += 1;
                    warn!(requested = amount, "critical compute request could not preempt enough");
                    return Err(capacity_error(ResourceKind::Compute, amount, state.ledger.available(0.0)));
                };
                for victim in &victims {
                    state.detach(victim);
                }
                state.stats.preemptions += victims.len() as u64;
                displaced = victims;
                node
            }
            None => {
                state.stats.failures += 1;
                let available = state.ledger.available(0.0);
                debug!(requested = amount, available, priority = %req.priority, "compute request rejected");
                return Err(capacity_error(ResourceKind::Compute, amount, available));
            }
        };

        let mut live = LiveAllocation::new(amount, req, now);
        live.tag = Some(node.clone());
        if let Some(n) = state.nodes.get_mut(&node) {
            n.allocated += amount;
        }
        let id = live.id.clone();
        state.ledger.insert(live);
        state.ledger.record_displacement(&id, displaced);
        state.stats.allocations += 1;
        state.record_sample(now);

        let snapshot = state
            .ledger
            .get(&id)
            .map(|a| state.snapshot(a, Some(req)))
            .ok_or_else(|| ResourceError::not_found("compute allocation", id.clone()))?;
        debug!(allocation_id = %id, node = %node, amount, priority = %req.priority, "compute allocated");
        Ok(snapshot)
    }

    fn release(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(removed) = state.ledger.remove(id) else {
            return Ok(false);
        };
        state.detach(&removed);
        state.stats.releases += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, amount = removed.amount, "compute released");
        Ok(true)
    }

    fn rollback(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(current) = state.ledger.get(id).cloned() else {
            return Ok(false);
        };
        state.detach(&current);

        let ComputeState { ledger, nodes, .. } = &mut *state;
        let restored = ledger
            .rollback(id, 0.0, |victim| {
                let Some(node) = victim.tag.as_ref().and_then(|t| nodes.get_mut(t)) else {
                    return false;
                };
                if node.available() + CAPACITY_EPSILON < victim.amount {
                    return false;
                }
                node.allocated += victim.amount;
                true
            })
            .map(|(_, restored)| restored.len())
            .unwrap_or(0);
        state.stats.releases += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, restored, "compute allocation rolled back");
        Ok(true)
    }

    fn update_allocation(
        &self,
        id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let amount = req.compute * state.ledger.total();
        let current = state
            .ledger
            .get(id)
            .cloned()
            .ok_or_else(|| ResourceError::not_found("compute allocation", id))?;

        let delta = amount - current.amount;
        if delta > 0.0 {
            let node_available = current
                .tag
                .as_ref()
                .and_then(|t| state.nodes.get(t))
                .map_or(0.0, ComputeNode::available);
            if !state.ledger.fits(delta, 0.0) || node_available + CAPACITY_EPSILON < delta {
                let available = state.ledger.available(0.0).min(node_available);
                return Err(capacity_error(ResourceKind::Compute, delta, available));
            }
        }

        state.ledger.resize(id, amount);
        if let Some(node) = current.tag.as_ref().and_then(|t| state.nodes.get_mut(t)) {
            node.allocated = (node.allocated + delta).max(0.0);
        }
        if let Some(entry) = state.ledger.get_mut(id) {
            entry.priority = req.priority;
            entry.expires_at_ms = req.deadline_ms;
            entry.metadata.extend(req.metadata.clone());
        }
        state.record_sample(now);
        let snapshot = state
            .ledger
            .get(id)
            .map(|a| state.snapshot(a, Some(req)))
            .ok_or_else(|| ResourceError::not_found("compute allocation", id))?;
        debug!(allocation_id = %id, amount, delta, "compute allocation updated");
        Ok(snapshot)
    }

    fn get_utilization(&self) -> ResourceUtilization {
        let state = self.state.lock();
        ResourceUtilization {
            compute: state.ledger.utilization(0.0),
            timestamp_ms: self.clock.now_ms(),
            ..ResourceUtilization::default()
        }
    }

    fn optimize(&self) -> Result<OptimizationReport, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let mut report = OptimizationReport::new(COMPONENT, now);

        let expired = Self::release_expired(&mut state, now);
        report.ran("expire", expired, format!("released {expired} expired allocations"));

        let series = state.history.series(|s| s.compute);
        match linear_regression(&series) {
            Some(fit) if series.len() >= 3 => {
                let trend = classify_trend(fit.slope, self.config.trend_tolerance);
                state.trend = trend;
                report.ran("trend", 0, format!("{trend:?} (slope {:.4})", fit.slope));
            }
            _ => report.failed("trend", format!("insufficient history ({} samples)", series.len())),
        }

        if state.nodes.len() < 2 {
            report.skipped("rebalance", "single compute node");
        } else {
            let moves = Self::rebalance_nodes(&mut state);
            report.ran("rebalance", moves, format!("migrated {moves} allocations"));
        }

        if !self.config.auto_scale {
            report.skipped("scale", "auto_scale disabled");
        } else if now.saturating_sub(state.last_scale_ms) < secs_to_ms(self.config.scale_interval_secs) {
            report.skipped("scale", "scale interval not elapsed");
        } else {
            match weighted_recent_delta(&series, &PREDICTION_WEIGHTS) {
                None => report.failed("scale", "insufficient history for prediction"),
                Some(increase) if increase > SCALE_TRIGGER => {
                    let added = self.scale_pool(&mut state, increase);
                    state.last_scale_ms = now;
                    report.ran("scale", usize::from(added > 0.0), format!("added {added:.3} units"));
                }
                Some(increase) => {
                    report.ran("scale", 0, format!("predicted increase {increase:.3} below trigger"));
                }
            }
        }

        debug_assert!(state.ledger.is_consistent(0.0));
        debug!(actions = report.total_actions(), "compute optimization finished");
        Ok(report)
    }
}
