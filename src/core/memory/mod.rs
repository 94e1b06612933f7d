//! Memory manager: a byte budget split into tiers and purpose pools.
//!
//! Two kinds of claims share the budget. Generic allocations come through the
//! [`ResourceAllocator`] contract and are tracked by an [`AllocationLedger`];
//! named blocks come through [`MemoryManager::allocate_memory_block`] and live
//! in exactly one tier and one pool. Block bytes are passed to the ledger as
//! external usage so that the two never oversubscribe the total.
//!
//! Maintenance passes (GC, defragmentation, cache recomputation, tier
//! migration, pool rebalancing and predictive reservation) run from
//! [`ResourceAllocator::optimize`]; see the `maintenance` module.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

mod block;
mod maintenance;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use block::{MemoryBlock, MemoryPoolKind, MemoryTierKind, PoolSnapshot, Region, TierSnapshot};

use crate::config::MemoryConfig;
use crate::core::allocator::{
    capacity_error, AllocationLedger, LiveAllocation, OptimizationReport, ResourceAllocator,
};
use crate::core::error::ResourceError;
use crate::core::lifecycle::Lifecycle;
use crate::core::model::{
    ResourceAllocation, ResourceRequirements, ResourceUtilization, UtilizationHistory,
};
use crate::util::clock::{secs_to_ms, Clock};
use crate::util::serde::{new_id, Priority, ResourceKind};

const COMPONENT: &str = "memory";

/// Pass names, also used as interval gate keys.
pub(crate) mod pass {
    pub const EXPIRE: &str = "expire";
    pub const GC: &str = "gc";
    pub const DEFRAGMENT: &str = "defragment";
    pub const CACHE: &str = "cache";
    pub const MIGRATE: &str = "migrate";
    pub const REBALANCE: &str = "rebalance";
    pub const PREDICT: &str = "predict";
}

/// Monitoring counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Generic allocations granted.
    pub allocations: u64,
    /// Generic allocations released.
    pub releases: u64,
    /// Generic allocations preempted.
    pub preemptions: u64,
    /// Requests rejected for capacity.
    pub failures: u64,
    /// Blocks created.
    pub blocks_allocated: u64,
    /// Blocks released by callers.
    pub blocks_released: u64,
    /// Blocks released to make room in their pool.
    pub lru_evictions: u64,
    /// Blocks collected by GC.
    pub gc_collected: u64,
    /// Blocks recreated by defragmentation.
    pub defragmented: u64,
    /// Blocks dropped from the cache.
    pub cache_evictions: u64,
    /// Moves to a faster tier.
    pub promotions: u64,
    /// Moves to a slower tier.
    pub demotions: u64,
    /// Capacity transfers between pools.
    pub pool_transfers: u64,
    /// Predictive reserve growth steps.
    pub reserve_growths: u64,
}

#[derive(Debug, Clone)]
struct Tier {
    region: Region,
    access_speed: f64,
    cost_factor: f64,
}

#[derive(Debug)]
struct MemoryState {
    lifecycle: Lifecycle,
    ledger: AllocationLedger,
    blocks: HashMap<String, MemoryBlock>,
    relocations: HashMap<String, String>,
    tiers: BTreeMap<MemoryTierKind, Tier>,
    pools: BTreeMap<MemoryPoolKind, Region>,
    cache_used: u64,
    cache_size: u64,
    next_placement: u64,
    history: UtilizationHistory,
    gates: HashMap<&'static str, u128>,
    stats: MemoryStats,
}

fn share_of(total: u64, fraction: f64) -> u64 {
    (total as f64 * fraction).floor() as u64
}

impl MemoryState {
    fn block_bytes(&self) -> u64 {
        self.tiers.values().map(|t| t.region.used).sum()
    }

    fn external(&self) -> f64 {
        self.block_bytes() as f64
    }

    fn resolve(&self, id: &str) -> Option<String> {
        if self.blocks.contains_key(id) {
            return Some(id.to_string());
        }
        self.relocations
            .get(id)
            .filter(|target| self.blocks.contains_key(*target))
            .cloned()
    }

    fn tier_mut(&mut self, kind: MemoryTierKind) -> &mut Region {
        // Tiers are created for every kind at initialization.
        &mut self
            .tiers
            .entry(kind)
            .or_insert_with(|| Tier {
                region: Region::new(0),
                access_speed: 0.0,
                cost_factor: 0.0,
            })
            .region
    }

    fn tier_free(&self, kind: MemoryTierKind) -> u64 {
        self.tiers.get(&kind).map_or(0, |t| t.region.free())
    }

    fn pool_mut(&mut self, kind: MemoryPoolKind) -> &mut Region {
        self.pools.entry(kind).or_insert_with(|| Region::new(0))
    }

    fn pool(&self, kind: MemoryPoolKind) -> Region {
        self.pools.get(&kind).copied().unwrap_or(Region::new(0))
    }

    fn next_placement(&mut self) -> u64 {
        self.next_placement += 1;
        self.next_placement
    }

    /// Mark every block placed after `placement` in `tier` as fragmented.
    fn open_hole(&mut self, tier: MemoryTierKind, placement: u64) {
        for block in self.blocks.values_mut() {
            if block.tier == tier && block.placement > placement {
                block.fragmented = true;
            }
        }
    }

    fn insert_block(&mut self, mut block: MemoryBlock) {
        block.placement = self.next_placement();
        self.tier_mut(block.tier).used += block.size;
        self.pool_mut(block.pool).used += block.size;
        if block.cached {
            self.cache_used += block.size;
        }
        self.blocks.insert(block.id.clone(), block);
    }

    fn remove_block(&mut self, id: &str) -> Option<MemoryBlock> {
        let block = self.blocks.remove(id)?;
        let tier = self.tier_mut(block.tier);
        tier.used = tier.used.saturating_sub(block.size);
        let pool = self.pool_mut(block.pool);
        pool.used = pool.used.saturating_sub(block.size);
        if block.cached {
            self.cache_used = self.cache_used.saturating_sub(block.size);
        }
        self.relocations.retain(|_, target| target.as_str() != id);
        self.open_hole(block.tier, block.placement);
        Some(block)
    }

    /// Move a block to `to`, leaving a hole in its old tier.
    fn move_block(&mut self, id: &str, to: MemoryTierKind) -> bool {
        let Some(block) = self.blocks.get(id) else {
            return false;
        };
        let (from, size, placement) = (block.tier, block.size, block.placement);
        if from == to || self.tier_free(to) < size {
            return false;
        }
        let old = self.tier_mut(from);
        old.used = old.used.saturating_sub(size);
        self.tier_mut(to).used += size;
        self.open_hole(from, placement);
        let placement = self.next_placement();
        if let Some(block) = self.blocks.get_mut(id) {
            block.tier = to;
            block.placement = placement;
            block.fragmented = false;
        }
        true
    }

    fn fragmentation(&self, tier: MemoryTierKind) -> f64 {
        let used = self.tiers.get(&tier).map_or(0, |t| t.region.used);
        if used == 0 {
            return 0.0;
        }
        let fragmented: u64 = self
            .blocks
            .values()
            .filter(|b| b.tier == tier && b.fragmented)
            .map(|b| b.size)
            .sum();
        fragmented as f64 / used as f64
    }

    /// Least recently used blocks of `pool` whose release leaves `size` free.
    fn plan_pool_eviction(&self, pool: MemoryPoolKind, size: u64) -> Option<Vec<String>> {
        let region = self.pool(pool);
        if region.capacity < size {
            return None;
        }
        let mut candidates: Vec<&MemoryBlock> =
            self.blocks.values().filter(|b| b.pool == pool).collect();
        candidates.sort_by(|a, b| {
            a.last_access_ms
                .cmp(&b.last_access_ms)
                .then_with(|| a.placement.cmp(&b.placement))
        });
        let mut free = region.free();
        let mut victims = Vec::new();
        for candidate in candidates {
            if free >= size {
                break;
            }
            free += candidate.size;
            victims.push(candidate.id.clone());
        }
        (free >= size).then_some(victims)
    }

    fn gate_open(&mut self, pass: &'static str, interval_secs: u64, now_ms: u128) -> bool {
        let last = self.gates.get(pass).copied().unwrap_or(0);
        if now_ms.saturating_sub(last) < secs_to_ms(interval_secs) {
            return false;
        }
        self.gates.insert(pass, now_ms);
        true
    }

    fn record_sample(&mut self, now_ms: u128) {
        let sample = ResourceUtilization {
            memory: self.ledger.utilization(self.external()),
            timestamp_ms: now_ms,
            ..ResourceUtilization::default()
        };
        self.history.push(sample);
    }

    fn snapshot(&self, allocation: &LiveAllocation, req: Option<&ResourceRequirements>) -> ResourceAllocation {
        let mut metadata = allocation.metadata.clone();
        metadata.insert("memory_allocation_id".into(), allocation.id.clone());
        ResourceAllocation {
            id: allocation.id.clone(),
            compute: 0.0,
            memory_bytes: allocation.amount as u64,
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

/// Tiered, pooled memory allocator.
pub struct MemoryManager {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    /// Create a manager. Fails fast on invalid configuration.
    ///
    /// # Errors
    /// [`ResourceError::InvalidConfig`].
    pub fn new(config: MemoryConfig, clock: Arc<dyn Clock>) -> Result<Self, ResourceError> {
        config.validate().map_err(ResourceError::InvalidConfig)?;
        Ok(Self {
            state: Mutex::new(MemoryState {
                lifecycle: Lifecycle::Uninitialized,
                ledger: AllocationLedger::new(ResourceKind::Memory, 0.0),
                blocks: HashMap::new(),
                relocations: HashMap::new(),
                tiers: BTreeMap::new(),
                pools: BTreeMap::new(),
                cache_used: 0,
                cache_size: config.effective_cache_size(),
                next_placement: 0,
                history: UtilizationHistory::new(config.history_size),
                gates: HashMap::new(),
                stats: MemoryStats::default(),
            }),
            config,
            clock,
        })
    }

    /// Carve tiers and pools out of the total. Idempotent.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            return;
        }
        let total = self.config.total_memory;
        state.ledger = AllocationLedger::new(ResourceKind::Memory, total as f64);

        let tiers = &self.config.memory_tiers;
        let fast = share_of(total, tiers.fast.capacity_fraction);
        let standard = share_of(total, tiers.standard.capacity_fraction);
        let slow = total.saturating_sub(fast + standard);
        for (kind, capacity, cfg) in [
            (MemoryTierKind::Fast, fast, &tiers.fast),
            (MemoryTierKind::Standard, standard, &tiers.standard),
            (MemoryTierKind::Slow, slow, &tiers.slow),
        ] {
            state.tiers.insert(
                kind,
                Tier {
                    region: Region::new(capacity),
                    access_speed: cfg.access_speed,
                    cost_factor: cfg.cost_factor,
                },
            );
        }

        let mut assigned = 0;
        for kind in MemoryPoolKind::ALL {
            let capacity = if kind == MemoryPoolKind::Reserve {
                total.saturating_sub(assigned)
            } else {
                share_of(total, kind.initial_share())
            };
            assigned += capacity;
            state.pools.insert(kind, Region::new(capacity));
        }
        state.lifecycle = Lifecycle::Initialized;
        debug!(total_bytes = total, cache_bytes = state.cache_size, "memory manager initialized");
    }

    /// Create a block of `size` bytes in the pool matching `purpose`.
    ///
    /// When the pool is short, its least recently used blocks are released
    /// first; nothing is released if that still would not make room.
    ///
    /// # Errors
    /// `CapacityExceeded` or `NotRunning`.
    pub fn allocate_memory_block(&self, size: u64, purpose: &str) -> Result<MemoryBlock, ResourceError> {
        let now = self.clock.now_ms();
        let pool = MemoryPoolKind::from_purpose(purpose);
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;

        let region = state.pool(pool);
        let victims = if region.free() >= size {
            Vec::new()
        } else if let Some(victims) = state.plan_pool_eviction(pool, size) {
            victims
        } else {
            state.stats.failures += 1;
            debug!(pool = %pool, size, free = region.free(), "memory block rejected");
            return Err(capacity_error(ResourceKind::Memory, size as f64, region.free() as f64));
        };

        let mut freed_per_tier: BTreeMap<MemoryTierKind, u64> = BTreeMap::new();
        let mut freed_total = 0;
        for id in &victims {
            if let Some(b) = state.blocks.get(id) {
                *freed_per_tier.entry(b.tier).or_default() += b.size;
                freed_total += b.size;
            }
        }
        let tier = MemoryTierKind::PLACEMENT_ORDER.into_iter().find(|t| {
            state.tier_free(*t) + freed_per_tier.get(t).copied().unwrap_or(0) >= size
        });
        let external = state.block_bytes().saturating_sub(freed_total) as f64;
        let Some(tier) = tier.filter(|_| state.ledger.fits(size as f64, external)) else {
            state.stats.failures += 1;
            let available = state.ledger.available(state.external());
            debug!(pool = %pool, size, available, "memory block rejected: no tier has room");
            return Err(capacity_error(ResourceKind::Memory, size as f64, available));
        };

        for id in &victims {
            if state.remove_block(id).is_some() {
                state.stats.lru_evictions += 1;
                debug!(block_id = %id, pool = %pool, "least recently used block released");
            }
        }

        let block = MemoryBlock {
            id: new_id(),
            purpose: purpose.to_string(),
            size,
            pool,
            tier,
            created_at_ms: now,
            last_access_ms: now,
            access_count: 0,
            access_history: std::collections::VecDeque::new(),
            cached: false,
            fragmented: false,
            cache_priority: 0.0,
            placement: 0,
        };
        let id = block.id.clone();
        state.insert_block(block);
        state.stats.blocks_allocated += 1;
        state.record_sample(now);
        debug!(block_id = %id, size, pool = %pool, tier = %tier, "memory block allocated");
        state
            .blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| ResourceError::not_found("memory block", id))
    }

    /// Release a block. Old ids of defragmented blocks resolve to their
    /// replacement. Unknown ids return `Ok(false)`.
    ///
    /// # Errors
    /// `NotRunning`.
    pub fn release_memory_block(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(current) = state.resolve(id) else {
            return Ok(false);
        };
        let Some(block) = state.remove_block(&current) else {
            return Ok(false);
        };
        state.stats.blocks_released += 1;
        state.record_sample(now);
        debug!(block_id = %current, size = block.size, tier = %block.tier, "memory block released");
        Ok(true)
    }

    /// Access a block, updating its statistics and cache priority.
    ///
    /// # Errors
    /// `NotFound` or `NotRunning`.
    pub fn retrieve(&self, id: &str) -> Result<MemoryBlock, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let current = state
            .resolve(id)
            .ok_or_else(|| ResourceError::not_found("memory block", id))?;
        let cache_room = state.cache_size.saturating_sub(state.cache_used);
        let Some(block) = state.blocks.get_mut(&current) else {
            return Err(ResourceError::not_found("memory block", id));
        };
        block.touch(now, self.config.access_history_size);
        block.cache_priority =
            block.score_cache(now, self.config.access_window_secs, self.config.hot_access_count);
        let admitted = !block.cached && block.size <= cache_room;
        if admitted {
            block.cached = true;
        }
        let snapshot = block.clone();
        if admitted {
            state.cache_used += snapshot.size;
        }
        Ok(snapshot)
    }

    /// Release least recently used blocks of `pool` until `size` bytes are free.
    ///
    /// Returns how many blocks were released.
    ///
    /// # Errors
    /// `CapacityExceeded` when the pool cannot hold `size` even when emptied;
    /// nothing is released in that case. `NotRunning`.
    pub fn optimize_pool(&self, pool: MemoryPoolKind, size: u64) -> Result<usize, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(victims) = state.plan_pool_eviction(pool, size) else {
            let region = state.pool(pool);
            return Err(capacity_error(ResourceKind::Memory, size as f64, region.capacity as f64));
        };
        for id in &victims {
            if state.remove_block(id).is_some() {
                state.stats.lru_evictions += 1;
            }
        }
        if !victims.is_empty() {
            state.record_sample(now);
        }
        Ok(victims.len())
    }

    /// Block by id without touching its statistics.
    #[must_use]
    pub fn block(&self, id: &str) -> Option<MemoryBlock> {
        let state = self.state.lock();
        state.resolve(id).and_then(|current| state.blocks.get(&current).cloned())
    }

    /// Every live block.
    #[must_use]
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        self.state.lock().blocks.values().cloned().collect()
    }

    /// Tier capacities, usage and fragmentation.
    #[must_use]
    pub fn tiers(&self) -> Vec<TierSnapshot> {
        let state = self.state.lock();
        state
            .tiers
            .iter()
            .map(|(kind, tier)| TierSnapshot {
                kind: *kind,
                region: tier.region,
                access_speed: tier.access_speed,
                cost_factor: tier.cost_factor,
                fragmentation: state.fragmentation(*kind),
            })
            .collect()
    }

    /// Pool capacities and usage.
    #[must_use]
    pub fn pools(&self) -> Vec<PoolSnapshot> {
        self.state
            .lock()
            .pools
            .iter()
            .map(|(kind, region)| PoolSnapshot {
                kind: *kind,
                region: *region,
            })
            .collect()
    }

    /// Fragmented bytes over used bytes in `tier`.
    #[must_use]
    pub fn fragmentation(&self, tier: MemoryTierKind) -> f64 {
        self.state.lock().fragmentation(tier)
    }

    /// Cache bytes in use and cache capacity.
    #[must_use]
    pub fn cache_usage(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.cache_used, state.cache_size)
    }

    /// Bytes held by blocks.
    #[must_use]
    pub fn block_bytes(&self) -> u64 {
        self.state.lock().block_bytes()
    }

    /// Bytes held by generic allocations.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().ledger.allocated() as u64
    }

    /// Monitoring counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    /// Generic allocation by id.
    #[must_use]
    pub fn allocation(&self, id: &str) -> Option<ResourceAllocation> {
        let state = self.state.lock();
        state.ledger.get(id).map(|a| state.snapshot(a, None))
    }

    /// Whether every tier, pool, cache and ledger counter matches the blocks
    /// and allocations it accounts for.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let total = self.config.total_memory;
        let tiers_ok = state.tiers.iter().all(|(kind, tier)| {
            let sum: u64 = state.blocks.values().filter(|b| b.tier == *kind).map(|b| b.size).sum();
            sum == tier.region.used && tier.region.used <= tier.region.capacity
        });
        let pools_ok = state.pools.iter().all(|(kind, region)| {
            let sum: u64 = state.blocks.values().filter(|b| b.pool == *kind).map(|b| b.size).sum();
            sum == region.used && region.used <= region.capacity
        });
        let cached: u64 = state.blocks.values().filter(|b| b.cached).map(|b| b.size).sum();
        let tier_total: u64 = state.tiers.values().map(|t| t.region.capacity).sum();
        let pool_total: u64 = state.pools.values().map(|p| p.capacity).sum();
        tiers_ok
            && pools_ok
            && cached == state.cache_used
            && state.cache_used <= state.cache_size
            && tier_total == total
            && pool_total == total
            && state.ledger.is_consistent(state.external())
    }

    fn bytes_for(&self, req: &ResourceRequirements) -> f64 {
        (req.memory * self.config.total_memory as f64).floor()
    }
}

impl ResourceAllocator for MemoryManager {
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
        for gate in [pass::GC, pass::DEFRAGMENT, pass::MIGRATE, pass::REBALANCE, pass::PREDICT] {
            state.gates.insert(gate, now);
        }
        info!(total_bytes = self.config.total_memory, "memory manager running");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            info!(blocks = state.blocks.len(), "memory manager stopped");
        }
    }

    fn allocate(&self, req: &ResourceRequirements) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let amount = self.bytes_for(req);
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let external = state.external();

        let mut displaced = Vec::new();
        if !state.ledger.fits(amount, external) {
            let victims = if req.priority == Priority::Critical {
                state.ledger.preempt_for(amount, external)
            } else {
                None
            };
            let Some(victims) = victims else {
                state.stats.failures += 1;
                let available = state.ledger.available(external);
                debug!(requested = amount, available, priority = %req.priority, "memory request rejected");
                return Err(capacity_error(ResourceKind::Memory, amount, available));
            };
            state.stats.preemptions += victims.len() as u64;
            displaced = victims;
        }

        let live = LiveAllocation::new(amount, req, now);
        let id = live.id.clone();
        state.ledger.insert(live);
        state.ledger.record_displacement(&id, displaced);
        state.stats.allocations += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, bytes = amount, priority = %req.priority, "memory allocated");
        state
            .ledger
            .get(&id)
            .map(|a| state.snapshot(a, Some(req)))
            .ok_or_else(|| ResourceError::not_found("memory allocation", id.clone()))
    }

    fn release(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let Some(removed) = state.ledger.remove(id) else {
            return Ok(false);
        };
        state.stats.releases += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, bytes = removed.amount, "memory released");
        Ok(true)
    }

    fn rollback(&self, id: &str) -> Result<bool, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let external = state.external();
        let Some((_, restored)) = state.ledger.rollback(id, external, |_| true) else {
            return Ok(false);
        };
        state.stats.releases += 1;
        state.record_sample(now);
        debug!(allocation_id = %id, restored = restored.len(), "memory allocation rolled back");
        Ok(true)
    }

    fn update_allocation(
        &self,
        id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation, ResourceError> {
        let now = self.clock.now_ms();
        let amount = self.bytes_for(req);
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let current = state
            .ledger
            .get(id)
            .map(|a| a.amount)
            .ok_or_else(|| ResourceError::not_found("memory allocation", id))?;
        let delta = amount - current;
        let external = state.external();
        if delta > 0.0 && !state.ledger.fits(delta, external) {
            return Err(capacity_error(ResourceKind::Memory, delta, state.ledger.available(external)));
        }
        state.ledger.resize(id, amount);
        if let Some(entry) = state.ledger.get_mut(id) {
            entry.priority = req.priority;
            entry.expires_at_ms = req.deadline_ms;
            entry.metadata.extend(req.metadata.clone());
        }
        state.record_sample(now);
        debug!(allocation_id = %id, bytes = amount, delta, "memory allocation updated");
        state
            .ledger
            .get(id)
            .map(|a| state.snapshot(a, Some(req)))
            .ok_or_else(|| ResourceError::not_found("memory allocation", id))
    }

    fn get_utilization(&self) -> ResourceUtilization {
        let state = self.state.lock();
        ResourceUtilization {
            memory: state.ledger.utilization(state.external()),
            timestamp_ms: self.clock.now_ms(),
            ..ResourceUtilization::default()
        }
    }

    fn optimize(&self) -> Result<OptimizationReport, ResourceError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.lifecycle.ensure_running(COMPONENT)?;
        let report = state.run_maintenance(&self.config, now);
        debug_assert!(state.ledger.is_consistent(state.external()));
        debug!(actions = report.total_actions(), "memory optimization finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    const MIB: u64 = 1 << 20;

    fn manager(total: u64) -> MemoryManager {
        let config = MemoryConfig {
            total_memory: total,
            ..MemoryConfig::default()
        };
        let clock = Arc::new(ManualClock::new(1_000_000));
        let manager = MemoryManager::new(config, clock).unwrap();
        manager.start().unwrap();
        manager
    }

    #[test]
    fn pools_and_tiers_partition_total() {
        let m = manager(100 * MIB);
        let pools = m.pools();
        let working = pools.iter().find(|p| p.kind == MemoryPoolKind::Working).unwrap();
        assert_eq!(working.region.capacity, 40 * MIB);
        let standard = m
            .tiers()
            .into_iter()
            .find(|t| t.kind == MemoryTierKind::Standard)
            .unwrap();
        assert_eq!(standard.region.capacity, 50 * MIB);
        assert!(m.is_consistent());
    }

    #[test]
    fn blocks_land_in_standard_then_slow() {
        let m = manager(100 * MIB);
        let first = m.allocate_memory_block(40 * MIB, "working").unwrap();
        assert_eq!(first.tier, MemoryTierKind::Standard);
        let second = m.allocate_memory_block(20 * MIB, "long_term").unwrap();
        assert_eq!(second.tier, MemoryTierKind::Slow);
        assert!(m.is_consistent());
    }

    #[test]
    fn full_pool_releases_least_recently_used() {
        let m = manager(100 * MIB);
        let old = m.allocate_memory_block(20 * MIB, "working").unwrap();
        let recent = m.allocate_memory_block(20 * MIB, "working").unwrap();
        m.retrieve(&recent.id).unwrap();
        let third = m.allocate_memory_block(10 * MIB, "working").unwrap();
        assert!(m.block(&old.id).is_none());
        assert!(m.block(&recent.id).is_some());
        assert_eq!(third.pool, MemoryPoolKind::Working);
        assert_eq!(m.stats().lru_evictions, 1);
        assert!(m.is_consistent());
    }

    #[test]
    fn oversized_block_releases_nothing() {
        let m = manager(100 * MIB);
        let kept = m.allocate_memory_block(10 * MIB, "system").unwrap();
        let err = m.allocate_memory_block(30 * MIB, "system").unwrap_err();
        assert!(err.is_capacity());
        assert!(m.block(&kept.id).is_some());
    }

    #[test]
    fn release_marks_later_blocks_fragmented() {
        let m = manager(100 * MIB);
        let a = m.allocate_memory_block(MIB, "working").unwrap();
        let b = m.allocate_memory_block(MIB, "working").unwrap();
        assert!(m.release_memory_block(&a.id).unwrap());
        assert!(!m.release_memory_block(&a.id).unwrap());
        assert!(m.block(&b.id).unwrap().fragmented);
        assert!((m.fragmentation(MemoryTierKind::Standard) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retrieve_admits_to_cache() {
        let m = manager(100 * MIB);
        let b = m.allocate_memory_block(MIB, "working").unwrap();
        let seen = m.retrieve(&b.id).unwrap();
        assert_eq!(seen.access_count, 1);
        assert!(seen.cached);
        assert!(seen.cache_priority > 0.0);
        assert_eq!(m.cache_usage().0, MIB);
    }

    #[test]
    fn generic_and_block_bytes_share_total() {
        let m = manager(100 * MIB);
        let generic = m
            .allocate(&ResourceRequirements::new(Priority::Medium).with_memory(0.7))
            .unwrap();
        assert_eq!(generic.memory_bytes, 70 * MIB);
        let err = m.allocate_memory_block(35 * MIB, "working").unwrap_err();
        assert!(err.is_capacity());
        assert!(m.allocate_memory_block(30 * MIB, "working").is_ok());
        assert!((m.get_utilization().memory - 1.0).abs() < 1e-9);
        assert!(m.is_consistent());
    }
}
