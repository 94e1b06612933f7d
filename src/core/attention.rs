//! Attention manager: a unit budget divided into foci grouped by context.
//!
//! Every live attention allocation is a focus on some target. Foci decay when
//! left untouched, the most important ones are refreshed, and foci outside the
//! active context are damped when they distract from its primary focus.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AttentionConfig;
use crate::core::allocator::{
    capacity_error, AllocationLedger, LiveAllocation, OptimizationReport, ResourceAllocator,
    CAPACITY_EPSILON,
};
use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::model::{
    ResourceAllocation, ResourceRequirements, ResourceUtilization, UtilizationHistory,
};
use crate::util::clock::{secs_between, secs_to_ms, Clock};
use crate::util::serde::{AllocationId, Priority, ResourceKind};

const COMPONENT: &str = "attention";
/// Context that exists from start and is active initially.
pub const DEFAULT_CONTEXT: &str = "default";
/// Metadata key naming the focus target of a generic allocation.
pub const FOCUS_TARGET_KEY: &str = "focus_target";
/// Metadata key naming the context of a generic allocation.
pub const CONTEXT_KEY: &str = "attention_context";
const RECENCY_WINDOW_SECS: f64 = 300.0;

/// Budget share a focus of `priority` starts from before importance and
/// urgency scaling.
#[must_use]
pub const fn base_share(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 0.6,
        Priority::High => 0.45,
        Priority::Medium => 0.3,
        Priority::Low => 0.15,
        Priority::Background => 0.05,
    }
}

/// Share granted for a focus: `base(priority)·(0.5 + 0.25·importance + 0.25·urgency)`.
#[must_use]
pub fn focus_share(priority: Priority, importance: f64, urgency: f64) -> f64 {
    base_share(priority) * 0.25f64.mul_add(urgency, 0.25f64.mul_add(importance, 0.5))
}

/// A claim on the attention budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionFocus {
    /// Ledger allocation backing this focus.
    pub allocation_id: AllocationId,
    /// What attention is directed at.
    pub target: String,
    /// Current share of the budget.
    pub allocation: f64,
    /// Share granted when the focus was last set.
    pub base_allocation: f64,
    /// Ordering class.
    pub priority: Priority,
    /// Importance in [0, 1].
    pub importance: f64,
    /// Urgency in [0, 1].
    pub urgency: f64,
    /// `0.5 + 0.5·importance`.
    pub distraction_resistance: f64,
    /// Recent access times, oldest first.
    pub access_history: VecDeque<u128>,
    /// Last time the focus was set or refreshed.
    pub last_access_ms: u128,
    /// Creation time.
    pub created_at_ms: u128,
    /// Owning context.
    pub context: Option<String>,
    /// Inactive foci are removed on the next optimization pass.
    pub active: bool,
}

impl AttentionFocus {
    /// `weight(priority)·(0.4 + 0.3·importance + 0.3·urgency)·recency`.
    #[must_use]
    pub fn effective_priority(&self, now_ms: u128) -> f64 {
        let recency = 1.0 / (1.0 + secs_between(self.last_access_ms, now_ms) / RECENCY_WINDOW_SECS);
        self.priority.weight()
            * 0.3f64.mul_add(self.urgency, 0.3f64.mul_add(self.importance, 0.4))
            * recency
    }

    fn touch(&mut self, now_ms: u128, history_size: usize) {
        self.last_access_ms = now_ms;
        if self.access_history.len() >= history_size.max(1) {
            self.access_history.pop_front();
        }
        self.access_history.push_back(now_ms);
    }

    fn set_importance(&mut self, importance: f64) {
        self.importance = importance.clamp(0.0, 1.0);
        self.distraction_resistance = 0.5f64.mul_add(self.importance, 0.5);
    }
}

/// Read-only view of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Context name.
    pub name: String,
    /// Context priority.
    pub priority: Priority,
    /// Allocation ids of member foci.
    pub foci: Vec<AllocationId>,
    /// `0.5·weight(priority) + 0.5·mean focus effective priority`.
    pub score: f64,
    /// Whether this is the active context.
    pub active: bool,
}

/// Monitoring counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionStats {
    /// Foci created.
    pub foci_created: u64,
    /// Foci released or removed.
    pub foci_removed: u64,
    /// Foci preempted by CRITICAL requests.
    pub preemptions: u64,
    /// Requests rejected for capacity.
    pub failures: u64,
    /// Foci refreshed back toward their base share.
    pub refreshes: u64,
    /// Foci damped as distractions.
    pub distractions_filtered: u64,
    /// Active context changes.
    pub context_switches: u64,
}

#[derive(Debug, Clone)]
struct Context {
    priority: Priority,
    foci: BTreeSet<AllocationId>,
}

#[derive(Debug)]
struct AttentionState {
    lifecycle: Lifecycle,
    ledger: AllocationLedger,
    foci: HashMap<AllocationId, AttentionFocus>,
    displaced: HashMap<AllocationId, Vec<AttentionFocus>>,
    contexts: BTreeMap<String, Context>,
    active_context: String,
    context_since_ms: u128,
    last_decay_ms: u128,
    last_refresh_ms: u128,
    last_dynamics_ms: u128,
    last_distraction_ms: u128,
    history: UtilizationHistory,
    stats: AttentionStats,
}

impl AttentionState {
    fn record_sample(&mut self, now_ms: u128) {
        let sample = ResourceUtilization {
            attention: self.ledger.utilization(0.0),
            timestamp_ms: now_ms,
            ..ResourceUtilization::default()
        };
        self.history.push(sample);
    }

    fn find_target(&self, target: &str) -> Option<AllocationId> {
        let mut matching: Vec<&AttentionFocus> =
            self.foci.values().filter(|f| f.target == target).collect();
        matching.sort_by_key(|f| f.created_at_ms);
        matching.first().map(|f| f.allocation_id.clone())
    }

    fn ensure_context(&mut self, name: &str, priority: Priority) {
        self.contexts.entry(name.to_string()).or_insert_with(|| Context {
            priority,
            foci: BTreeSet::new(),
        });
    }

    fn attach(&mut self, id: &str, context: &str) {
        let previous = self.foci.get(id).and_then(|f| f.context.clone());
        if previous.as_deref() == Some(context) {
            return;
        }
        if let Some(old) = previous.and_then(|name| self.contexts.get_mut(&name)) {
            old.foci.remove(id);
        }
        if let Some(ctx) = self.contexts.get_mut(context) {
            ctx.foci.insert(id.to_string());
        }
        if let Some(focus) = self.foci.get_mut(id) {
            focus.context = Some(context.to_string());
        }
    }

    fn detach(&mut self, focus: &AttentionFocus) {
        if let Some(ctx) = focus.context.as_ref().and_then(|c| self.contexts.get_mut(c)) {
            ctx.foci.remove(&focus.allocation_id);
        }
    }

    /// Drop a focus and its ledger entry.
    fn remove_focus(&mut self, id: &str) -> Option<AttentionFocus> {
        self.ledger.remove(id)?;
        self.displaced.remove(id);
        let focus = self.foci.remove(id)?;
        self.detach(&focus);
        self.stats.foci_removed += 1;
        Some(focus)
    }

    /// Set a focus share, keeping the ledger in step.
    fn set_allocation(&mut self, id: &str, share: f64) {
        if let Some(focus) = self.foci.get_mut(id) {
            focus.allocation = share;
            self.ledger.resize(id, share);
        }
    }

    fn context_score(&self, name: &str, now_ms: u128) -> Option<f64> {
        let ctx = self.contexts.get(name)?;
        let priorities: Vec<f64> = ctx
            .foci
            .iter()
            .filter_map(|id| self.foci.get(id))
            .filter(|f| f.active)
            .map(|f| f.effective_priority(now_ms))
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let mean = if priorities.is_empty() {
            0.0
        } else {
            priorities.iter().sum::<f64>() / priorities.len() as f64
        };
        Some(0.5f64.mul_add(ctx.priority.weight(), 0.5 * mean))
    }

    fn focus_allocation(&self, focus: &AttentionFocus, req: Option<&ResourceRequirements>) -> ResourceAllocation {
        let mut metadata = req.map(|r| r.metadata.clone()).unwrap_or_default();
        metadata.insert("attention_allocation_id".into(), focus.allocation_id.clone());
        metadata.insert(FOCUS_TARGET_KEY.into(), focus.target.clone());
        if let Some(ctx) = &focus.context {
            metadata.insert(CONTEXT_KEY.into(), ctx.clone());
        }
        let expires_at_ms = self
            .ledger
            .get(&focus.allocation_id)
            .and_then(|a| a.expires_at_ms);
        ResourceAllocation {
            id: focus.allocation_id.clone(),
            compute: 0.0,
            memory_bytes: 0,
            attention: focus.allocation,
            network: req.map_or(0.0, |r| r.network),
            storage: req.map_or(0.0, |r| r.storage),
            priority: focus.priority,
            allocated_at_ms: focus.created_at_ms,
            expires_at_ms,
            metadata,
        }
    }
}

/// Parameters of a new or updated focus.
#[derive(Debug, Clone)]
struct FocusRequest<'a> {
    context: &'a str,
    target: &'a str,
    share: f64,
    priority: Priority,
    importance: f64,
    urgency: f64,
}

/// Allocator for the attention budget.
pub struct AttentionManager {
    config: AttentionConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AttentionState>,
}

impl AttentionManager {
    /// Create a manager. Fails fast on invalid configuration.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn new(config: AttentionConfig, clock: Arc<dyn Clock>) -> Result<Self, ResourceError> {
        config.validate().map_err(ResourceError::InvalidConfig)?;
        Ok(Self {
            state: Mutex::new(AttentionState {
                lifecycle: Lifecycle::Uninitialized,
                ledger: AllocationLedger::new(ResourceKind::Attention, config.total_attention),
                foci: HashMap::new(),
                displaced: HashMap::new(),
                contexts: BTreeMap::new(),
                active_context: DEFAULT_CONTEXT.to_string(),
                context_since_ms: 0,
                last_decay_ms: 0,
                last_refresh_ms: 0,
                last_dynamics_ms: 0,
                last_distraction_ms: 0,
                history: UtilizationHistory::new(config.history_size),
                stats: AttentionStats::default(),
            }),
            config,
            clock,
        })
    }

    /// Create the default context. Idempotent.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            return;
        }
        state.ensure_context(DEFAULT_CONTEXT, Priority::Medium);
        state.active_context = DEFAULT_CONTEXT.to_string();
        state.lifecycle = Lifecycle::Initialized;
    }

    /// Focus on `target` within the active context.
    ///
    /// # Errors
    /// See [`Self::focus_attention_in_context`].
    pub fn focus_attention(
        &self,
        target: &str,
        priority: Priority,
        importance: f64,
        urgency: f64,
    ) -> Result<AttentionFocus, ResourceError> {
        let context = self.active_context();
        self.focus_attention_in_context(&context, target, priority, importance, urgency)
    }

    /// Create or update the focus on `target` and place it in `context`,
    /// creating the context if needed.
    ///
    /// # Errors
    /// `CapacityExceeded` or `NotRunning`.
    pub fn focus_attention_in_context(
        &self,
        context: &str,
        target: &str,
        priority: Priority,
        importance: f64,
        urgency: f64,
    ) -> Result<AttentionFocus, ResourceError> {
        let importance = importance.clamp(0.0, 1.0);
        let urgency = urgency.clamp(0.0, 1.0);
        let share = focus_share(priority, importance, urgency) * self.config.total_attention;
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let id = self.upsert_focus(
            &mut state,
            &FocusRequest {
                context,
                target,
                share,
                priority,
                importance,
                urgency,
            },
        )?;
        state
            .foci
            .get(&id)
            .cloned()
            .ok_or_else(|| ResourceError::not_found("focus", id))
    }

    fn upsert_focus(&self, state: &mut AttentionState, request: &FocusRequest<'_>) -> Result<AllocationId, ResourceError> {
        let now = self.clock.now_ms();
        state.ensure_context(request.context, request.priority);

        if let Some(id) = state.find_target(request.target) {
            let current = state.foci.get(&id).map_or(0.0, |f| f.allocation);
            let delta = request.share - current;
            if delta > 0.0 && !state.ledger.fits(delta, 0.0) {
                state.stats.failures += 1;
                return Err(capacity_error(ResourceKind::Attention, delta, state.ledger.available(0.0)));
            }
            state.set_allocation(&id, request.share);
            if let Some(entry) = state.ledger.get_mut(&id) {
                entry.priority = request.priority;
            }
            if let Some(focus) = state.foci.get_mut(&id) {
                focus.base_allocation = request.share;
                focus.priority = request.priority;
                focus.urgency = request.urgency;
                focus.set_importance(request.importance);
                focus.active = true;
                focus.touch(now, self.config.access_history_size);
            }
            state.attach(&id, request.context);
            state.record_sample(now);
            debug!(focus_target = %request.target, share = request.share, context = %request.context, "focus updated");
            return Ok(id);
        }

        let (victims, displaced) = Self::make_room(state, request.share, request.priority)?;
        let req = ResourceRequirements::new(request.priority).with_metadata(FOCUS_TARGET_KEY, request.target);
        let live = LiveAllocation::new(request.share, &req, now);
        let id = live.id.clone();
        self.insert_focus(state, live, request, now);
        Self::remember_displaced(state, &id, victims, displaced);
        Ok(id)
    }

    /// Make room for `share`, preempting for CRITICAL requests.
    ///
    /// Returns the released ledger entries and their foci.
    fn make_room(
        state: &mut AttentionState,
        share: f64,
        priority: Priority,
    ) -> Result<(Vec<LiveAllocation>, Vec<AttentionFocus>), ResourceError> {
        if state.ledger.fits(share, 0.0) {
            return Ok((Vec::new(), Vec::new()));
        }
        let victims = if priority == Priority::Critical {
            state.ledger.preempt_for(share, 0.0)
        } else {
            None
        };
        let Some(victims) = victims else {
            state.stats.failures += 1;
            let available = state.ledger.available(0.0);
            debug!(requested = share, available, priority = %priority, "attention request rejected");
            return Err(capacity_error(ResourceKind::Attention, share, available));
        };
        let mut displaced = Vec::new();
        for victim in &victims {
            if let Some(focus) = state.foci.remove(&victim.id) {
                state.detach(&focus);
                displaced.push(focus);
            }
        }
        state.stats.preemptions += victims.len() as u64;
        Ok((victims, displaced))
    }

    fn remember_displaced(
        state: &mut AttentionState,
        id: &str,
        victims: Vec<LiveAllocation>,
        displaced: Vec<AttentionFocus>,
    ) {
        state.ledger.record_displacement(id, victims);
        if !displaced.is_empty() {
            state.displaced.insert(id.to_string(), displaced);
        }
    }

    fn insert_focus(&self, state: &mut AttentionState, mut live: LiveAllocation, request: &FocusRequest<'_>, now: u128) {
        state.ensure_context(request.context, request.priority);
        live.tag = Some(request.target.to_string());
        let id = live.id.clone();
        let mut focus = AttentionFocus {
            allocation_id: id.clone(),
            target: request.target.to_string(),
            allocation: request.share,
            base_allocation: request.share,
            priority: request.priority,
            importance: 0.0,
            urgency: request.urgency,
            distraction_resistance: 0.5,
            access_history: VecDeque::new(),
            last_access_ms: now,
            created_at_ms: now,
            context: None,
            active: true,
        };
        focus.set_importance(request.importance);
        focus.touch(now, self.config.access_history_size);
        state.ledger.insert(live);
        state.foci.insert(id.clone(), focus);
        state.attach(&id, request.context);
        state.stats.foci_created += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, focus_target = %request.target, share = request.share, context = %request.context, "focus created");
    }

    /// Remove the oldest focus on `target`. Returns whether one existed.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn remove_focus(&self, target: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(id) = state.find_target(target) else {
            return Ok(false);
        };
        let removed = state.remove_focus(&id).is_some();
        state.record_sample(now);
        Ok(removed)
    }

    /// Snapshot of the oldest focus on `target`.
    #[must_use]
    pub fn focus(&self, target: &str) -> Option<AttentionFocus> {
        let state = self.state.lock();
        state.find_target(target).and_then(|id| state.foci.get(&id).cloned())
    }

    /// Every focus.
    #[must_use]
    pub fn foci(&self) -> Vec<AttentionFocus> {
        self.state.lock().foci.values().cloned().collect()
    }

    /// Create an empty context. Returns `false` if it already existed.
    pub fn create_context(&self, name: &str, priority: Priority) -> bool {
        let mut state = self.state.lock();
        if state.contexts.contains_key(name) {
            return false;
        }
        state.ensure_context(name, priority);
        debug!(context = %name, priority = %priority, "context created");
        true
    }

    /// Make `name` the active context regardless of scores.
    ///
    /// # Errors
    /// `NotFound` for unknown contexts.
    pub fn switch_context(&self, name: &str) -> Result<(), ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if !state.contexts.contains_key(name) {
            return Err(ResourceError::not_found("context", name));
        }
        if state.active_context != name {
            info!(from = %state.active_context, to = %name, "context switched");
            state.active_context = name.to_string();
            state.context_since_ms = now;
            state.stats.context_switches += 1;
        }
        Ok(())
    }

    /// Name of the active context.
    #[must_use]
    pub fn active_context(&self) -> String {
        self.state.lock().active_context.clone()
    }

    /// Every context with its current score.
    #[must_use]
    pub fn contexts(&self) -> Vec<ContextSnapshot> {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        state
            .contexts
            .iter()
            .map(|(name, ctx)| ContextSnapshot {
                name: name.clone(),
                priority: ctx.priority,
                foci: ctx.foci.iter().cloned().collect(),
                score: state.context_score(name, now).unwrap_or(0.0),
                active: *name == state.active_context,
            })
            .collect()
    }

    /// Sum of granted shares.
    #[must_use]
    pub fn allocated(&self) -> f64 {
        self.state.lock().ledger.allocated()
    }

    /// Monitoring counters.
    #[must_use]
    pub fn stats(&self) -> AttentionStats {
        self.state.lock().stats.clone()
    }

    /// Whether the ledger and foci agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let focus_sum: f64 = state.foci.values().map(|f| f.allocation).sum();
        state.ledger.is_consistent(0.0)
            && state.ledger.len() == state.foci.len()
            && (focus_sum - state.ledger.allocated()).abs() <= 1e-6
    }

    fn decay(&self, state: &mut AttentionState, now: u128) -> usize {
        let previous = state.last_decay_ms;
        state.last_decay_ms = now;
        let elapsed = secs_between(previous, now);
        let factor = (-self.config.decay_rate * elapsed).exp();
        let floor = self.config.min_focus * self.config.total_attention;

        let untouched: Vec<AllocationId> = state
            .foci
            .values()
            .filter(|f| f.active && f.last_access_ms <= previous)
            .map(|f| f.allocation_id.clone())
            .collect();
        for id in &untouched {
            let current = state.foci.get(id).map_or(0.0, |f| f.allocation);
            let decayed = current * factor;
            state.set_allocation(id, decayed);
            if decayed < floor {
                if let Some(focus) = state.foci.get_mut(id) {
                    focus.active = false;
                    debug!(focus_target = %focus.target, allocation = decayed, "focus decayed below minimum");
                }
            }
        }
        untouched.len()
    }

    fn refresh(&self, state: &mut AttentionState, now: u128) -> usize {
        let mut candidates: Vec<(f64, AllocationId)> = state
            .foci
            .values()
            .filter(|f| f.active && f.allocation < self.config.refresh_threshold * f.base_allocation)
            .map(|f| (f.effective_priority(now), f.allocation_id.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut refreshed = 0;
        for (_, id) in candidates.into_iter().take(self.config.refresh_top_n) {
            let Some((current, base)) = state.foci.get(&id).map(|f| (f.allocation, f.base_allocation)) else {
                continue;
            };
            let grant = (base - current).min(state.ledger.available(0.0));
            if grant <= CAPACITY_EPSILON {
                continue;
            }
            state.set_allocation(&id, current + grant);
            state.stats.refreshes += 1;
            refreshed += 1;
        }
        refreshed
    }

    fn expire(state: &mut AttentionState, now: u128) -> usize {
        let mut doomed = state.ledger.expired(now);
        doomed.extend(
            state
                .foci
                .values()
                .filter(|f| !f.active)
                .map(|f| f.allocation_id.clone()),
        );
        doomed.sort();
        doomed.dedup();
        doomed
            .iter()
            .filter(|id| state.remove_focus(id).is_some())
            .count()
    }

    /// Importance decays and protected urgency grows in proportion to the
    /// seconds since the previous pass.
    fn update_dynamics(&self, state: &mut AttentionState, now: u128) -> usize {
        let elapsed = secs_between(state.last_dynamics_ms, now);
        state.last_dynamics_ms = now;
        if elapsed <= 0.0 {
            return 0;
        }
        let importance_loss = self.config.importance_decay_rate * elapsed;
        let urgency_gain = self.config.urgency_growth_rate * elapsed;
        let mut changed = 0;
        for focus in state.foci.values_mut().filter(|f| f.active) {
            let importance = (focus.importance - importance_loss).max(0.0);
            let urgency = if focus.priority.is_protected() {
                (focus.urgency + urgency_gain).min(1.0)
            } else {
                focus.urgency
            };
            if (importance - focus.importance).abs() > f64::EPSILON
                || (urgency - focus.urgency).abs() > f64::EPSILON
            {
                changed += 1;
            }
            focus.set_importance(importance);
            focus.urgency = urgency;
        }
        changed
    }

    fn optimize_context(&self, state: &mut AttentionState, now: u128) -> Result<usize, String> {
        if now.saturating_sub(state.context_since_ms) < secs_to_ms(self.config.min_context_duration_secs) {
            return Err("minimum context duration not reached".into());
        }
        let active = state.active_context.clone();
        let active_score = state.context_score(&active, now).unwrap_or(0.0);
        let best = state
            .contexts
            .keys()
            .filter_map(|name| state.context_score(name, now).map(|s| (s, name.clone())))
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        match best {
            Some((score, name)) if name != active && score - active_score >= self.config.context_switch_threshold => {
                info!(from = %active, to = %name, score, active_score, "context switched");
                state.active_context = name;
                state.context_since_ms = now;
                state.stats.context_switches += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn filter_distractions(&self, state: &mut AttentionState, now: u128) -> usize {
        let Some(ctx) = state.contexts.get(&state.active_context) else {
            return 0;
        };
        let primary = ctx
            .foci
            .iter()
            .filter_map(|id| state.foci.get(id))
            .filter(|f| f.active)
            .max_by(|a, b| a.effective_priority(now).total_cmp(&b.effective_priority(now)));
        let Some(primary) = primary else {
            return 0;
        };
        let primary_priority = primary.effective_priority(now);
        if primary_priority <= 0.0 {
            return 0;
        }
        let limit = self.config.distraction_threshold * primary.distraction_resistance;

        let mut distractions: Vec<(f64, AllocationId)> = state
            .foci
            .values()
            .filter(|f| f.active && !ctx.foci.contains(&f.allocation_id))
            .map(|f| (f.effective_priority(now) / primary_priority, f.allocation_id.clone()))
            .filter(|(ratio, _)| *ratio < limit)
            .collect();
        distractions.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        distractions.truncate(self.config.max_distractions_per_cycle);

        let floor = self.config.min_focus * self.config.total_attention;
        let strength = self.config.distraction_filter_strength;
        for (ratio, id) in &distractions {
            let current = state.foci.get(id).map_or(0.0, |f| f.allocation);
            let damped = current * strength.mul_add(-(1.0 - ratio / limit), 1.0);
            state.set_allocation(id, damped);
            if damped < floor {
                if let Some(focus) = state.foci.get_mut(id) {
                    focus.active = false;
                }
            }
            state.stats.distractions_filtered += 1;
        }
        distractions.len()
    }
}

impl ResourceAllocator for AttentionManager {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    fn start(&self) -> Result<(), ResourceError> {
        self.initialize();
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Running;
        state.context_since_ms = now;
        state.last_decay_ms = now;
        state.last_refresh_ms = now;
        state.last_dynamics_ms = now;
        state.last_distraction_ms = now;
        info!(total_attention = self.config.total_attention, "attention manager running");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            info!(foci = state.foci.len(), "attention manager stopped");
        }
    }

    /// Every generic allocation is a focus on `metadata["focus_target"]`, or
    /// on `allocation:<id>` when absent. Generic allocations always get their
    /// own focus, even when the target is already focused.
    fn allocate(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let share = req.attention * self.config.total_attention;
        let parse = |key: &str| {
            req.metadata
                .get(key)
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(0.5, |v| v.clamp(0.0, 1.0))
        };
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let context = req
            .metadata
            .get(CONTEXT_KEY)
            .cloned()
            .unwrap_or_else(|| state.active_context.clone());

        let (victims, displaced) = Self::make_room(&mut state, share, req.priority)?;
        let live = LiveAllocation::new(share, req, now);
        let id = live.id.clone();
        let target = req
            .metadata
            .get(FOCUS_TARGET_KEY)
            .cloned()
            .unwrap_or_else(|| format!("allocation:{id}"));
        let request = FocusRequest {
            context: &context,
            target: &target,
            share,
            priority: req.priority,
            importance: parse("importance"),
            urgency: parse("urgency"),
        };
        self.insert_focus(&mut state, live, &request, now);
        Self::remember_displaced(&mut state, &id, victims, displaced);
        Self::allocation_of(&state, &id, req)
    }

    fn release(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(focus) = state.remove_focus(id) else {
            return Ok(false);
        };
        state.record_sample(now);
        debug!(allocation_id = %id, focus_target = %focus.target, "attention released");
        Ok(true)
    }

    fn rollback(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let displaced = state.displaced.remove(id).unwrap_or_default();
        let Some((_, restored)) = state.ledger.rollback(id, 0.0, |_| true) else {
            return Ok(false);
        };
        if let Some(focus) = state.foci.remove(id) {
            state.detach(&focus);
            state.stats.foci_removed += 1;
        }
        for victim in &restored {
            if let Some(focus) = displaced.iter().find(|f| f.allocation_id == victim.id) {
                let context = focus.context.clone();
                state.foci.insert(victim.id.clone(), AttentionFocus { context: None, ..focus.clone() });
                if let Some(context) = context {
                    state.ensure_context(&context, focus.priority);
                    state.attach(&victim.id, &context);
                }
            }
        }
        // Victims with no recorded focus cannot stay in the ledger.
        let orphans: Vec<AllocationId> = restored
            .iter()
            .filter(|v| !state.foci.contains_key(&v.id))
            .map(|v| v.id.clone())
            .collect();
        for orphan in orphans {
            state.ledger.remove(&orphan);
        }
        state.record_sample(now);
        debug!(allocation_id = %id, restored = restored.len(), "attention allocation rolled back");
        Ok(true)
    }

    fn update_allocation(
        &self,
        id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let share = req.attention * self.config.total_attention;
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let current = state
            .foci
            .get(id)
            .map(|f| f.allocation)
            .ok_or_else(|| ResourceError::not_found("attention allocation", id))?;
        let delta = share - current;
        if delta > 0.0 && !state.ledger.fits(delta, 0.0) {
            return Err(capacity_error(ResourceKind::Attention, delta, state.ledger.available(0.0)));
        }
        state.set_allocation(id, share);
        if let Some(entry) = state.ledger.get_mut(id) {
            entry.priority = req.priority;
            entry.expires_at_ms = req.deadline_ms;
        }
        if let Some(focus) = state.foci.get_mut(id) {
            focus.base_allocation = share;
            focus.priority = req.priority;
            focus.active = true;
            focus.touch(now, self.config.access_history_size);
        }
        state.record_sample(now);
        Self::allocation_of(&state, id, req)
    }

    fn get_utilization(&self) -> ResourceUtilization {
        let state = self.state.lock();
        ResourceUtilization {
            attention: state.ledger.utilization(0.0),
            timestamp_ms: self.clock.now_ms(),
            ..ResourceUtilization::default()
        }
    }

    fn optimize(&self) -> Result<OptimizationReport, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let mut report = OptimizationReport::new(COMPONENT, now);

        if now.saturating_sub(state.last_decay_ms) >= secs_to_ms(self.config.decay_interval_secs) {
            let decayed = self.decay(&mut state, now);
            report.ran("decay", decayed, format!("decayed {decayed} untouched foci"));
        } else {
            report.skipped("decay", "decay interval not elapsed");
        }

        if now.saturating_sub(state.last_refresh_ms) >= secs_to_ms(self.config.refresh_interval_secs) {
            state.last_refresh_ms = now;
            let refreshed = self.refresh(&mut state, now);
            report.ran("refresh", refreshed, format!("refreshed {refreshed} foci"));
        } else {
            report.skipped("refresh", "refresh interval not elapsed");
        }

        let removed = Self::expire(&mut state, now);
        report.ran("expire", removed, format!("removed {removed} expired or inactive foci"));

        let changed = self.update_dynamics(&mut state, now);
        report.ran("dynamics", changed, format!("{changed} foci adjusted"));

        match self.optimize_context(&mut state, now) {
            Ok(switched) => report.ran("context", switched, "context scores evaluated"),
            Err(reason) => report.skipped("context", reason),
        }

        // Damping shares the decay cadence so back-to-back passes do not compound.
        if now.saturating_sub(state.last_distraction_ms) >= secs_to_ms(self.config.decay_interval_secs) {
            state.last_distraction_ms = now;
            let filtered = self.filter_distractions(&mut state, now);
            report.ran("distraction", filtered, format!("damped {filtered} distractions"));
        } else {
            report.skipped("distraction", "decay interval not elapsed");
        }

        state.record_sample(now);
        debug!(actions = report.total_actions(), "attention optimization finished");
        Ok(report)
    }
}

impl AttentionManager {
    fn allocation_of(
        state: &AttentionState,
        id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        state
            .foci
            .get(id)
            .map(|f| state.focus_allocation(f, Some(req)))
            .ok_or_else(|| ResourceError::not_found("attention allocation", id))
    }
}
