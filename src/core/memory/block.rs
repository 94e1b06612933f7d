//! Memory blocks and the tiers and pools that hold them.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::clock::secs_between;

/// Storage tier, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTierKind {
    /// Small, fast, expensive.
    Fast,
    /// General purpose.
    Standard,
    /// Large, slow, cheap.
    Slow,
}

impl MemoryTierKind {
    /// Every tier, fastest first.
    pub const ALL: [Self; 3] = [Self::Fast, Self::Standard, Self::Slow];

    /// Placement preference for new blocks.
    pub const PLACEMENT_ORDER: [Self; 3] = [Self::Standard, Self::Slow, Self::Fast];

    /// The next faster tier.
    #[must_use]
    pub const fn faster(self) -> Option<Self> {
        match self {
            Self::Fast => None,
            Self::Standard => Some(Self::Fast),
            Self::Slow => Some(Self::Standard),
        }
    }

    /// The next slower tier.
    #[must_use]
    pub const fn slower(self) -> Option<Self> {
        match self {
            Self::Fast => Some(Self::Standard),
            Self::Standard => Some(Self::Slow),
            Self::Slow => None,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Slow => "slow",
        }
    }
}

impl fmt::Display for MemoryTierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purpose pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPoolKind {
    /// Short-lived scratch data.
    Working,
    /// Data kept across sessions.
    LongTerm,
    /// Core system structures.
    System,
    /// Headroom grown by prediction.
    Reserve,
}

impl MemoryPoolKind {
    /// Every pool in declaration order.
    pub const ALL: [Self; 4] = [Self::Working, Self::LongTerm, Self::System, Self::Reserve];

    /// Pools the reserve may borrow from, in order.
    pub const RESERVE_LENDERS: [Self; 3] = [Self::Working, Self::LongTerm, Self::System];

    /// Initial share of total memory.
    #[must_use]
    pub const fn initial_share(self) -> f64 {
        match self {
            Self::Working => 0.4,
            Self::LongTerm => 0.3,
            Self::System => 0.2,
            Self::Reserve => 0.1,
        }
    }

    /// Multiplier on the base GC idle threshold.
    #[must_use]
    pub const fn gc_factor(self) -> f64 {
        match self {
            Self::Working => 0.5,
            Self::LongTerm => 3.0,
            Self::System => 2.0,
            Self::Reserve => 1.0,
        }
    }

    /// Map a free-form purpose onto a pool by substring.
    #[must_use]
    pub fn from_purpose(purpose: &str) -> Self {
        let purpose = purpose.to_ascii_lowercase();
        if purpose.contains("working") {
            Self::Working
        } else if purpose.contains("long_term") || purpose.contains("permanent") {
            Self::LongTerm
        } else if purpose.contains("system") || purpose.contains("core") {
            Self::System
        } else {
            Self::Working
        }
    }

    /// Snake case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::LongTerm => "long_term",
            Self::System => "system",
            Self::Reserve => "reserve",
        }
    }
}

impl fmt::Display for MemoryPoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte capacity with a usage counter. Shared shape of tiers and pools.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Capacity in bytes.
    pub capacity: u64,
    /// Bytes held by blocks.
    pub used: u64,
}

impl Region {
    pub(crate) const fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    /// Bytes still free.
    #[must_use]
    pub const fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Used share of capacity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return if self.used == 0 { 0.0 } else { 1.0 };
        }
        self.used as f64 / self.capacity as f64
    }
}

/// A tier with its access characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSnapshot {
    /// Which tier.
    pub kind: MemoryTierKind,
    /// Capacity and usage.
    pub region: Region,
    /// Relative access speed.
    pub access_speed: f64,
    /// Relative cost per byte.
    pub cost_factor: f64,
    /// Fragmented bytes over used bytes.
    pub fragmentation: f64,
}

/// A pool with its capacity and usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Which pool.
    pub kind: MemoryPoolKind,
    /// Capacity and usage.
    pub region: Region,
}

/// A named, purpose-tagged allocation of bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Block id. Changes when the block is defragmented.
    pub id: String,
    /// Caller supplied purpose.
    pub purpose: String,
    /// Size in bytes.
    pub size: u64,
    /// Owning pool.
    pub pool: MemoryPoolKind,
    /// Current tier.
    pub tier: MemoryTierKind,
    /// Creation time of the original block.
    pub created_at_ms: u128,
    /// Last retrieval.
    pub last_access_ms: u128,
    /// Lifetime retrievals.
    pub access_count: u64,
    /// Recent retrieval times, oldest first.
    pub access_history: VecDeque<u128>,
    /// Whether the block is cache resident.
    pub cached: bool,
    /// Whether a hole precedes this block in its tier.
    pub fragmented: bool,
    /// Derived `0.7·frequency + 0.3·recency` score.
    pub cache_priority: f64,
    /// Placement order within the tier.
    #[serde(skip)]
    pub(crate) placement: u64,
}

impl MemoryBlock {
    /// Record a retrieval at `now_ms`.
    pub(crate) fn touch(&mut self, now_ms: u128, history_size: usize) {
        self.last_access_ms = now_ms;
        self.access_count += 1;
        if self.access_history.len() >= history_size.max(1) {
            self.access_history.pop_front();
        }
        self.access_history.push_back(now_ms);
    }

    /// Share of `hot_count` retrievals seen within the window, capped at 1.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frequency(&self, now_ms: u128, window_secs: u64, hot_count: u32) -> f64 {
        let recent = self
            .access_history
            .iter()
            .filter(|at| secs_between(**at, now_ms) <= window_secs as f64)
            .count();
        (recent as f64 / f64::from(hot_count.max(1))).min(1.0)
    }

    /// Hyperbolic recency: 1 when just touched, 0.5 one window later.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recency(&self, now_ms: u128, window_secs: u64) -> f64 {
        let idle = secs_between(self.last_access_ms, now_ms);
        1.0 / (1.0 + idle / (window_secs.max(1) as f64))
    }

    /// Cache score over `window_secs`.
    #[must_use]
    pub fn score_cache(&self, now_ms: u128, window_secs: u64, hot_count: u32) -> f64 {
        0.7f64.mul_add(
            self.frequency(now_ms, window_secs, hot_count),
            0.3 * self.recency(now_ms, window_secs),
        )
    }

    /// Tier migration score over `window_secs`.
    #[must_use]
    pub fn score_migration(&self, now_ms: u128, window_secs: u64, hot_count: u32) -> f64 {
        0.5f64.mul_add(
            self.frequency(now_ms, window_secs, hot_count),
            0.3f64.mul_add(self.recency(now_ms, window_secs), 0.2 * self.cache_priority),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(last_access_ms: u128) -> MemoryBlock {
        MemoryBlock {
            id: "b".into(),
            purpose: "working".into(),
            size: 10,
            pool: MemoryPoolKind::Working,
            tier: MemoryTierKind::Standard,
            created_at_ms: 0,
            last_access_ms,
            access_count: 0,
            access_history: VecDeque::new(),
            cached: false,
            fragmented: false,
            cache_priority: 0.0,
            placement: 0,
        }
    }

    #[test]
    fn purpose_maps_by_substring() {
        assert_eq!(MemoryPoolKind::from_purpose("working_set"), MemoryPoolKind::Working);
        assert_eq!(MemoryPoolKind::from_purpose("permanent facts"), MemoryPoolKind::LongTerm);
        assert_eq!(MemoryPoolKind::from_purpose("core index"), MemoryPoolKind::System);
        assert_eq!(MemoryPoolKind::from_purpose("misc"), MemoryPoolKind::Working);
    }

    #[test]
    fn tiers_step_one_at_a_time() {
        assert_eq!(MemoryTierKind::Slow.faster(), Some(MemoryTierKind::Standard));
        assert_eq!(MemoryTierKind::Fast.faster(), None);
        assert_eq!(MemoryTierKind::Fast.slower(), Some(MemoryTierKind::Standard));
    }

    #[test]
    fn scores_reward_recent_frequent_access() {
        let mut hot = block(0);
        for t in 0..10 {
            hot.touch(1_000 + t, 50);
        }
        let cold = block(0);
        let now = 2_000;
        assert!(hot.score_cache(now, 300, 10) > 0.9);
        assert!(cold.score_cache(now, 300, 10) < hot.score_cache(now, 300, 10));
        assert!((cold.recency(300_000, 300) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded() {
        let mut b = block(0);
        for t in 0..5 {
            b.touch(t, 3);
        }
        assert_eq!(b.access_history.len(), 3);
        assert_eq!(b.access_count, 5);
    }
}
