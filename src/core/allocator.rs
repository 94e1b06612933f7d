//! Allocator contract shared by the compute, memory and attention allocators,
//! plus the ledger that does their capacity accounting.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::model::{Metadata, ResourceAllocation, ResourceRequirements, ResourceUtilization};
use crate::util::serde::{AllocationId, Priority, ResourceKind};

/// Tolerance for floating point capacity comparisons.
pub const CAPACITY_EPSILON: f64 = 1e-9;

/// Allocate/release/update/utilization protocol.
///
/// Capacity pressure is reported as [`ResourceError::CapacityExceeded`];
/// operations outside the `Running` state fail with
/// [`ResourceError::NotRunning`]. Implementations hold their own lock for the
/// duration of one call and never call into another component while holding
/// it.
pub trait ResourceAllocator: Send + Sync {
    /// Component name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Current lifecycle state.
    fn lifecycle(&self) -> Lifecycle;

    /// Build internal structures (if needed) and begin accepting work.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`] if the configuration cannot be applied.
    fn start(&self) -> Result<(), ResourceError>;

    /// Stop accepting work. Live allocations are kept.
    fn stop(&self);

    /// Grant the requested share, preempting non-protected allocations for
    /// CRITICAL requests.
    ///
    /// # Errors
    /// `CapacityExceeded` or `NotRunning`.
    fn allocate(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError>;

    /// Release an allocation. Unknown ids return `Ok(false)`.
    ///
    /// # Errors
    /// `NotRunning`.
    fn release(&self, id: &str) -> Result<bool, ResourceError>;

    /// Release an allocation and restore, where capacity permits, the
    /// allocations it preempted.
    ///
    /// # Errors
    /// `NotRunning`.
    fn rollback(&self, id: &str) -> Result<bool, ResourceError>;

    /// Resize an allocation atomically: either the whole delta applies or
    /// nothing changes.
    ///
    /// # Errors
    /// `NotFound`, `CapacityExceeded` or `NotRunning`.
    fn update_allocation(
        &self,
        id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError>;

    /// Current utilization. Read-only.
    fn get_utilization(&self) -> ResourceUtilization;

    /// Run this allocator's maintenance passes.
    ///
    /// # Errors
    /// `NotRunning`. Individual pass failures are reported in the result.
    fn optimize(&self) -> Result<OptimizationReport, ResourceError>;
}

/// Result of one optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PassOutcome {
    /// The pass ran and performed `actions` changes.
    Ran {
        /// Number of state changes made.
        actions: usize,
        /// Human readable summary.
        detail: String,
    },
    /// The pass was gated off.
    Skipped {
        /// Why it did not run.
        reason: String,
    },
    /// The pass failed; later passes still ran.
    Failed {
        /// Failure description.
        error: String,
    },
}

/// Per-pass outcomes of one `optimize()` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizationReport {
    /// Component that ran the passes.
    pub component: String,
    /// Outcome keyed by pass name.
    pub passes: BTreeMap<String, PassOutcome>,
    /// When the passes ran.
    pub timestamp_ms: u128,
}

impl OptimizationReport {
    /// Empty report for `component`.
    #[must_use]
    pub fn new(component: &str, timestamp_ms: u128) -> Self {
        Self {
            component: component.to_string(),
            passes: BTreeMap::new(),
            timestamp_ms,
        }
    }

    /// Record a pass that ran.
    pub fn ran(&mut self, pass: &str, actions: usize, detail: impl Into<String>) {
        self.passes.insert(
            pass.to_string(),
            PassOutcome::Ran {
                actions,
                detail: detail.into(),
            },
        );
    }

    /// Record a gated pass.
    pub fn skipped(&mut self, pass: &str, reason: impl Into<String>) {
        self.passes.insert(
            pass.to_string(),
            PassOutcome::Skipped {
                reason: reason.into(),
            },
        );
    }

    /// Record a failed pass.
    pub fn failed(&mut self, pass: &str, error: impl Into<String>) {
        self.passes.insert(
            pass.to_string(),
            PassOutcome::Failed {
                error: error.into(),
            },
        );
    }

    /// Actions performed by `pass`, zero if it did not run.
    #[must_use]
    pub fn actions(&self, pass: &str) -> usize {
        match self.passes.get(pass) {
            Some(PassOutcome::Ran { actions, .. }) => *actions,
            _ => 0,
        }
    }

    /// Sum of actions over every pass.
    #[must_use]
    pub fn total_actions(&self) -> usize {
        self.passes.keys().map(|p| self.actions(p)).sum()
    }

    /// Whether `pass` was skipped by its gate.
    #[must_use]
    pub fn was_skipped(&self, pass: &str) -> bool {
        matches!(self.passes.get(pass), Some(PassOutcome::Skipped { .. }))
    }

    /// Whether `pass` failed.
    #[must_use]
    pub fn has_failed(&self, pass: &str) -> bool {
        matches!(self.passes.get(pass), Some(PassOutcome::Failed { .. }))
    }
}

/// A live claim as the ledger sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveAllocation {
    /// Allocation id.
    pub id: AllocationId,
    /// Amount in the allocator's unit.
    pub amount: f64,
    /// Priority of the request.
    pub priority: Priority,
    /// Grant time.
    pub allocated_at_ms: u128,
    /// Expiry time.
    pub expires_at_ms: Option<u128>,
    /// Allocator-specific placement (compute node, focus target).
    pub tag: Option<String>,
    /// Caller metadata.
    pub metadata: Metadata,
}

impl LiveAllocation {
    /// Live record for a fresh grant.
    #[must_use]
    pub fn new(amount: f64, req: &ResourceRequirements, now_ms: u128) -> Self {
        Self {
            id: crate::util::serde::new_id(),
            amount,
            priority: req.priority,
            allocated_at_ms: now_ms,
            expires_at_ms: req.deadline_ms,
            tag: None,
            metadata: req.metadata.clone(),
        }
    }

    /// Whether the allocation is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now_ms: u128) -> bool {
        self.expires_at_ms.is_some_and(|at| at < now_ms)
    }
}

/// Capacity accounting for one resource kind.
///
/// `allocated` is the authoritative running counter; it always equals the sum
/// of live amounts and never exceeds `total`. Some allocators carve part of
/// the total out for other structures (memory blocks); that share is passed in
/// as `external` on every capacity query.
#[derive(Debug, Clone)]
pub struct AllocationLedger {
    kind: ResourceKind,
    total: f64,
    allocated: f64,
    live: HashMap<AllocationId, LiveAllocation>,
    displaced: HashMap<AllocationId, Vec<LiveAllocation>>,
}

impl AllocationLedger {
    /// Empty ledger over `total` units.
    #[must_use]
    pub fn new(kind: ResourceKind, total: f64) -> Self {
        Self {
            kind,
            total,
            allocated: 0.0,
            live: HashMap::new(),
            displaced: HashMap::new(),
        }
    }

    /// Capacity of the pool.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.total
    }

    /// Sum of live allocations.
    #[must_use]
    pub const fn allocated(&self) -> f64 {
        self.allocated
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no allocations are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Free capacity after `external` usage.
    #[must_use]
    pub fn available(&self, external: f64) -> f64 {
        (self.total - self.allocated - external).max(0.0)
    }

    /// Whether `amount` fits beside `external` usage.
    #[must_use]
    pub fn fits(&self, amount: f64, external: f64) -> bool {
        self.allocated + external + amount <= self.total + CAPACITY_EPSILON
    }

    /// Share of the total in use, including `external`.
    #[must_use]
    pub fn utilization(&self, external: f64) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        ((self.allocated + external) / self.total).clamp(0.0, 1.0)
    }

    /// Look up a live allocation.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LiveAllocation> {
        self.live.get(id)
    }

    /// Mutable lookup. Callers must not change `amount` through this.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut LiveAllocation> {
        self.live.get_mut(id)
    }

    /// Iterate live allocations in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &LiveAllocation> {
        self.live.values()
    }

    /// Record a grant. The caller has checked [`Self::fits`].
    pub fn insert(&mut self, allocation: LiveAllocation) {
        self.allocated += allocation.amount;
        self.live.insert(allocation.id.clone(), allocation);
        self.debug_check();
    }

    /// Remove a grant, returning it if it was live.
    pub fn remove(&mut self, id: &str) -> Option<LiveAllocation> {
        let removed = self.live.remove(id)?;
        self.allocated = (self.allocated - removed.amount).max(0.0);
        self.displaced.remove(id);
        if self.live.is_empty() {
            self.allocated = 0.0;
        }
        self.debug_check();
        Some(removed)
    }

    /// Change the amount of a live allocation. The caller has checked capacity
    /// for any increase.
    pub fn resize(&mut self, id: &str, amount: f64) -> bool {
        let Some(entry) = self.live.get_mut(id) else {
            return false;
        };
        self.allocated = (self.allocated - entry.amount + amount).max(0.0);
        entry.amount = amount;
        self.debug_check();
        true
    }

    /// Change capacity (auto-scaling, pool rebalancing).
    pub fn set_total(&mut self, total: f64) {
        self.total = total.max(self.allocated);
    }

    /// Choose preemption victims covering `shortfall` among allocations
    /// accepted by `eligible`: lowest priority first, newest first within a
    /// priority, never HIGH or CRITICAL.
    ///
    /// Returns `None` when every eligible victim together would not cover it.
    #[must_use]
    pub fn plan_preemption(
        &self,
        shortfall: f64,
        eligible: impl Fn(&LiveAllocation) -> bool,
    ) -> Option<Vec<AllocationId>> {
        let mut candidates: Vec<&LiveAllocation> = self
            .live
            .values()
            .filter(|a| !a.priority.is_protected() && eligible(a))
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.allocated_at_ms.cmp(&a.allocated_at_ms))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut freed = 0.0;
        let mut victims = Vec::new();
        for candidate in candidates {
            if freed + CAPACITY_EPSILON >= shortfall {
                break;
            }
            freed += candidate.amount;
            victims.push(candidate.id.clone());
        }
        (freed + CAPACITY_EPSILON >= shortfall).then_some(victims)
    }

    /// Release victims covering `shortfall` among `eligible` allocations.
    ///
    /// Returns the released records, or `None` with nothing released when the
    /// shortfall cannot be covered.
    pub fn preempt(
        &mut self,
        shortfall: f64,
        eligible: impl Fn(&LiveAllocation) -> bool,
    ) -> Option<Vec<LiveAllocation>> {
        let victims = self.plan_preemption(shortfall, eligible)?;
        let released: Vec<LiveAllocation> =
            victims.iter().filter_map(|id| self.remove(id)).collect();
        for victim in &released {
            tracing::warn!(
                resource = %self.kind,
                allocation_id = %victim.id,
                priority = %victim.priority,
                amount = victim.amount,
                "allocation preempted"
            );
        }
        Some(released)
    }

    /// Release victims so that a request of `amount` fits beside `external`.
    pub fn preempt_for(&mut self, amount: f64, external: f64) -> Option<Vec<LiveAllocation>> {
        let shortfall = amount - self.available(external);
        self.preempt(shortfall, |_| true)
    }

    /// Remember which allocations `id` displaced, for rollback.
    pub fn record_displacement(&mut self, id: &str, victims: Vec<LiveAllocation>) {
        if !victims.is_empty() {
            self.displaced.insert(id.to_string(), victims);
        }
    }

    /// Remove `id` and reinstate the allocations it displaced that still fit
    /// and that `restore_ok` accepts.
    ///
    /// Returns the removed record and the reinstated victims.
    pub fn rollback(
        &mut self,
        id: &str,
        external: f64,
        mut restore_ok: impl FnMut(&LiveAllocation) -> bool,
    ) -> Option<(LiveAllocation, Vec<LiveAllocation>)> {
        let victims = self.displaced.remove(id).unwrap_or_default();
        let removed = self.remove(id)?;
        let mut restored = Vec::new();
        for victim in victims {
            if self.live.contains_key(&victim.id) || !self.fits(victim.amount, external) {
                continue;
            }
            if !restore_ok(&victim) {
                continue;
            }
            self.insert(victim.clone());
            restored.push(victim);
        }
        Some((removed, restored))
    }

    /// Ids of allocations past their expiry.
    #[must_use]
    pub fn expired(&self, now_ms: u128) -> Vec<AllocationId> {
        self.live
            .values()
            .filter(|a| a.is_expired(now_ms))
            .map(|a| a.id.clone())
            .collect()
    }

    /// Sum of live amounts computed from scratch.
    #[must_use]
    pub fn recount(&self) -> f64 {
        self.live.values().map(|a| a.amount).sum()
    }

    /// Conservation check: counter matches the live sum and stays in bounds.
    #[must_use]
    pub fn is_consistent(&self, external: f64) -> bool {
        let tolerance = 1e-6 * self.total.max(1.0);
        (self.recount() - self.allocated).abs() <= tolerance
            && self.allocated + external <= self.total + tolerance
    }

    fn debug_check(&self) {
        debug_assert!(
            (self.recount() - self.allocated).abs() <= 1e-6 * self.total.max(1.0),
            "{} ledger out of balance",
            self.kind
        );
    }
}

/// Build the capacity error for `kind`.
#[must_use]
pub const fn capacity_error(kind: ResourceKind, requested: f64, available: f64) -> ResourceError {
    ResourceError::CapacityExceeded {
        resource: kind,
        requested,
        available,
    }
}
