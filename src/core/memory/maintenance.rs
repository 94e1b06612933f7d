//! Memory maintenance passes, run in order by `optimize()`.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use tracing::{debug, info};

use super::{pass, share_of, MemoryPoolKind, MemoryState, MemoryTierKind};
use crate::config::MemoryConfig;
use crate::core::allocator::OptimizationReport;
use crate::util::clock::secs_between;
use crate::util::serde::new_id;
use crate::util::stats::linear_regression;

/// Demotion looks at a window this many times longer than promotion.
const DEMOTION_WINDOW_FACTOR: u64 = 12;
const PROMOTION_SCORE: f64 = 0.7;
const POOL_UNDERUSED: f64 = 0.5;
const POOL_OVERUSED: f64 = 0.9;
const POOL_TRANSFER_SHARE: f64 = 0.1;
const PREDICTION_HORIZON: f64 = 5.0;
const PREDICTION_CONFIDENCE: f64 = 0.6;
const PREDICTION_TRIGGER: f64 = 0.2;
const RESERVE_LEND_CAP: f64 = 0.2;

impl MemoryState {
    pub(super) fn run_maintenance(&mut self, config: &MemoryConfig, now: u128) -> OptimizationReport {
        let mut report = OptimizationReport::new("memory", now);

        let expired = self.ledger.expired(now);
        for id in &expired {
            if self.ledger.remove(id).is_some() {
                self.stats.releases += 1;
            }
        }
        report.ran(pass::EXPIRE, expired.len(), format!("released {} expired allocations", expired.len()));

        if self.gate_open(pass::GC, config.gc_interval_secs, now) {
            let collected = self.collect_garbage(config, now);
            report.ran(pass::GC, collected, format!("collected {collected} idle blocks"));
        } else {
            report.skipped(pass::GC, "gc interval not elapsed");
        }

        if self.gate_open(pass::DEFRAGMENT, config.defrag_interval_secs, now) {
            let moved = self.defragment(config.fragmentation_threshold);
            report.ran(pass::DEFRAGMENT, moved, format!("recreated {moved} fragmented blocks"));
        } else {
            report.skipped(pass::DEFRAGMENT, "defrag interval not elapsed");
        }

        let changed = self.recompute_cache(config, now);
        report.ran(pass::CACHE, changed, format!("{changed} cache membership changes"));

        if self.gate_open(pass::MIGRATE, config.migration_interval_secs, now) {
            let moves = self.migrate_tiers(config, now);
            report.ran(pass::MIGRATE, moves, format!("{moves} tier moves"));
        } else {
            report.skipped(pass::MIGRATE, "migration interval not elapsed");
        }

        if self.gate_open(pass::REBALANCE, config.rebalance_interval_secs, now) {
            let transfers = self.rebalance_pools();
            report.ran(pass::REBALANCE, transfers, format!("{transfers} pool transfers"));
        } else {
            report.skipped(pass::REBALANCE, "rebalance interval not elapsed");
        }

        if self.gate_open(pass::PREDICT, config.prediction_interval_secs, now) {
            match self.predict_and_reserve(config.total_memory) {
                Ok((actions, detail)) => report.ran(pass::PREDICT, actions, detail),
                Err(error) => report.failed(pass::PREDICT, error),
            }
        } else {
            report.skipped(pass::PREDICT, "prediction interval not elapsed");
        }

        if report.total_actions() > 0 {
            self.record_sample(now);
        }
        report
    }

    /// Release blocks idle longer than their pool's threshold.
    fn collect_garbage(&mut self, config: &MemoryConfig, now: u128) -> usize {
        let base = config.gc_age_threshold_secs as f64;
        let idle: Vec<String> = self
            .blocks
            .values()
            .filter(|b| secs_between(b.last_access_ms, now) > base * b.pool.gc_factor())
            .map(|b| b.id.clone())
            .collect();
        for id in &idle {
            if let Some(block) = self.remove_block(id) {
                self.stats.gc_collected += 1;
                debug!(block_id = %id, pool = %block.pool, size = block.size, "idle block collected");
            }
        }
        idle.len()
    }

    /// Recreate the fragmented blocks of every tier at or above `threshold`.
    ///
    /// Each block gets a fresh id and placement and keeps its statistics; the
    /// old id keeps resolving through the relocation map.
    fn defragment(&mut self, threshold: f64) -> usize {
        let mut moved = 0;
        for tier in MemoryTierKind::ALL {
            let fragmentation = self.fragmentation(tier);
            if fragmentation < threshold || fragmentation <= 0.0 {
                continue;
            }
            let mut fragmented: Vec<(u64, String)> = self
                .blocks
                .values()
                .filter(|b| b.tier == tier && b.fragmented)
                .map(|b| (b.placement, b.id.clone()))
                .collect();
            fragmented.sort();

            for (_, old_id) in fragmented {
                let Some(mut block) = self.blocks.remove(&old_id) else {
                    continue;
                };
                let new_id = new_id();
                block.id.clone_from(&new_id);
                block.fragmented = false;
                block.placement = self.next_placement();
                self.blocks.insert(new_id.clone(), block);
                for target in self.relocations.values_mut() {
                    if *target == old_id {
                        target.clone_from(&new_id);
                    }
                }
                self.relocations.insert(old_id, new_id);
                moved += 1;
            }
            info!(tier = %tier, fragmentation, "tier defragmented");
        }
        self.stats.defragmented += moved as u64;
        moved
    }

    /// Refresh every cache priority and refill the cache best first.
    ///
    /// Only blocks that have been retrieved at least once are cache
    /// candidates. Returns the number of admissions plus evictions.
    fn recompute_cache(&mut self, config: &MemoryConfig, now: u128) -> usize {
        for block in self.blocks.values_mut() {
            block.cache_priority =
                block.score_cache(now, config.access_window_secs, config.hot_access_count);
        }
        let mut ranked: Vec<(f64, String, u64)> = self
            .blocks
            .values()
            .filter(|b| b.access_count > 0)
            .map(|b| (b.cache_priority, b.id.clone(), b.size))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut budget = self.cache_size;
        let mut keep = std::collections::HashSet::new();
        for (_, id, size) in ranked {
            if size <= budget {
                budget -= size;
                keep.insert(id);
            }
        }

        let mut changed = 0;
        let mut used = 0;
        for block in self.blocks.values_mut() {
            let cached = keep.contains(&block.id);
            if block.cached != cached {
                changed += 1;
                if block.cached {
                    self.stats.cache_evictions += 1;
                }
                block.cached = cached;
            }
            if cached {
                used += block.size;
            }
        }
        self.cache_used = used;
        changed
    }

    /// Promote hot blocks and demote cold ones, one tier per pass.
    fn migrate_tiers(&mut self, config: &MemoryConfig, now: u128) -> usize {
        let window = config.access_window_secs;
        let long_window = window * DEMOTION_WINDOW_FACTOR;
        let hot = config.hot_access_count;

        let mut plan: Vec<(String, MemoryTierKind, bool)> = Vec::new();
        let mut ids: Vec<&String> = self.blocks.keys().collect();
        ids.sort();
        for id in ids {
            let block = &self.blocks[id];
            if let Some(faster) = block.tier.faster() {
                if block.score_migration(now, window, hot) > PROMOTION_SCORE {
                    plan.push((id.clone(), faster, true));
                    continue;
                }
            }
            // Blocks younger than the demotion window have no usage record to judge.
            let settled = secs_between(block.created_at_ms, now) >= long_window as f64;
            if let (Some(slower), true) = (block.tier.slower(), settled) {
                if block.score_migration(now, long_window, hot) < 1.0 - PROMOTION_SCORE {
                    plan.push((id.clone(), slower, false));
                }
            }
        }

        let mut moves = 0;
        for (id, to, promote) in plan {
            if !self.move_block(&id, to) {
                continue;
            }
            moves += 1;
            if promote {
                self.stats.promotions += 1;
            } else {
                self.stats.demotions += 1;
            }
            debug!(block_id = %id, tier = %to, promote, "block migrated");
        }
        moves
    }

    /// Move capacity from an under-used pool into each over-used pool.
    fn rebalance_pools(&mut self) -> usize {
        let mut over: Vec<MemoryPoolKind> = self
            .pools
            .iter()
            .filter(|(_, r)| r.utilization() > POOL_OVERUSED)
            .map(|(k, _)| *k)
            .collect();
        over.sort_by(|a, b| self.pool(*b).utilization().total_cmp(&self.pool(*a).utilization()));

        let mut transfers = 0;
        for target in over {
            let donor = self
                .pools
                .iter()
                .filter(|(k, r)| **k != target && r.utilization() < POOL_UNDERUSED)
                .min_by(|a, b| a.1.utilization().total_cmp(&b.1.utilization()))
                .map(|(k, r)| (*k, *r));
            let Some((donor, region)) = donor else {
                break;
            };
            let amount = share_of(region.capacity, POOL_TRANSFER_SHARE).min(region.free());
            if amount == 0 {
                continue;
            }
            self.pool_mut(donor).capacity -= amount;
            self.pool_mut(target).capacity += amount;
            self.stats.pool_transfers += 1;
            transfers += 1;
            info!(from = %donor, to = %target, bytes = amount, "pool capacity transferred");
        }
        transfers
    }

    /// Fit the memory utilization history and grow the reserve pool when a
    /// confident prediction shows a large increase.
    fn predict_and_reserve(&mut self, total: u64) -> Result<(usize, String), String> {
        let series = self.history.series(|s| s.memory);
        if series.len() < 3 {
            return Err(format!("insufficient history ({} samples)", series.len()));
        }
        let fit = linear_regression(&series).ok_or("regression failed")?;
        let latest = series.last().copied().unwrap_or(0.0);
        let predicted = fit.predict(series.len() as f64 - 1.0 + PREDICTION_HORIZON);
        let increase = predicted - latest;
        if fit.r_squared < PREDICTION_CONFIDENCE || increase <= PREDICTION_TRIGGER {
            return Ok((
                0,
                format!("increase {increase:.3} at confidence {:.2}", fit.r_squared),
            ));
        }

        let mut needed = (increase * total as f64).floor() as u64;
        let mut lenders = 0;
        for lender in MemoryPoolKind::RESERVE_LENDERS {
            if needed == 0 {
                break;
            }
            let region = self.pool(lender);
            let amount = share_of(region.capacity, RESERVE_LEND_CAP)
                .min(region.free())
                .min(needed);
            if amount == 0 {
                continue;
            }
            self.pool_mut(lender).capacity -= amount;
            self.pool_mut(MemoryPoolKind::Reserve).capacity += amount;
            needed -= amount;
            lenders += 1;
            info!(from = %lender, bytes = amount, "reserve pool grown");
        }
        if lenders > 0 {
            self.stats.reserve_growths += 1;
        }
        Ok((lenders, format!("predicted increase {increase:.3}, borrowed from {lenders} pools")))
    }
}
