//! Resource core configuration structures.
//!
//! Every field has a default; durations are whole seconds as in the rest of
//! the platform's configuration files.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// A compute node's static description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeNodeConfig {
    /// Share of the compute pool this node provides.
    pub capacity: f64,
    /// Pre-existing load on the node (not owned by this allocator).
    pub load: f64,
    /// Relative efficiency in (0, 1].
    pub efficiency: f64,
}

impl Default for ComputeNodeConfig {
    fn default() -> Self {
        Self {
            capacity: 1.0,
            load: 0.0,
            efficiency: 1.0,
        }
    }
}

/// Compute allocator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Normalized size of the compute pool.
    pub total_compute_units: f64,
    /// Nodes by name. Empty means one `local` node holding the whole pool.
    pub compute_nodes: BTreeMap<String, ComputeNodeConfig>,
    /// Grow the pool when a rise in usage is predicted.
    pub auto_scale: bool,
    /// Upper bound for auto-scaling.
    pub max_compute_units: f64,
    /// Minimum seconds between scaling decisions.
    pub scale_interval_secs: u64,
    /// Utilization samples kept for trend analysis.
    pub history_size: usize,
    /// Slope magnitude below which a trend is stable.
    pub trend_tolerance: f64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            total_compute_units: 1.0,
            compute_nodes: BTreeMap::new(),
            auto_scale: false,
            max_compute_units: 4.0,
            scale_interval_secs: 300,
            history_size: 100,
            trend_tolerance: 0.01,
        }
    }
}

impl ComputeConfig {
    /// Validate compute configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.total_compute_units <= 0.0 {
            return Err("total_compute_units must be greater than 0".into());
        }
        if self.max_compute_units < self.total_compute_units {
            return Err("max_compute_units must be at least total_compute_units".into());
        }
        if self.history_size < 2 {
            return Err("history_size must be at least 2".into());
        }
        for (name, node) in &self.compute_nodes {
            if node.capacity <= 0.0 {
                return Err(format!("compute node `{name}` capacity must be greater than 0"));
            }
            if node.efficiency <= 0.0 || node.efficiency > 1.0 {
                return Err(format!("compute node `{name}` efficiency must be in (0, 1]"));
            }
            if node.load < 0.0 || node.load > node.capacity {
                return Err(format!("compute node `{name}` load must be within capacity"));
            }
        }
        Ok(())
    }
}

/// One memory tier's description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    /// Share of total memory.
    pub capacity_fraction: f64,
    /// Relative access speed (higher is faster).
    pub access_speed: f64,
    /// Relative cost per byte.
    pub cost_factor: f64,
}

/// The three memory tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTiersConfig {
    /// Fast tier.
    pub fast: MemoryTierConfig,
    /// Standard tier.
    pub standard: MemoryTierConfig,
    /// Slow tier.
    pub slow: MemoryTierConfig,
}

impl Default for MemoryTiersConfig {
    fn default() -> Self {
        Self {
            fast: MemoryTierConfig {
                capacity_fraction: 0.2,
                access_speed: 1.0,
                cost_factor: 3.0,
            },
            standard: MemoryTierConfig {
                capacity_fraction: 0.5,
                access_speed: 0.6,
                cost_factor: 1.0,
            },
            slow: MemoryTierConfig {
                capacity_fraction: 0.3,
                access_speed: 0.2,
                cost_factor: 0.3,
            },
        }
    }
}

/// Memory manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total bytes managed.
    pub total_memory: u64,
    /// Tier layout.
    pub memory_tiers: MemoryTiersConfig,
    /// Cache budget in bytes; defaults to 10% of total memory.
    pub cache_size: Option<u64>,
    /// Minimum seconds between garbage collections.
    pub gc_interval_secs: u64,
    /// Base idle age before a block is collected.
    pub gc_age_threshold_secs: u64,
    /// Minimum seconds between defragmentation passes.
    pub defrag_interval_secs: u64,
    /// Fragmentation ratio that triggers defragmentation.
    pub fragmentation_threshold: f64,
    /// Minimum seconds between tier migration passes.
    pub migration_interval_secs: u64,
    /// Minimum seconds between pool rebalancing passes.
    pub rebalance_interval_secs: u64,
    /// Minimum seconds between predictive reservation passes.
    pub prediction_interval_secs: u64,
    /// Window for "recent" access frequency.
    pub access_window_secs: u64,
    /// Accesses per window that count as fully hot.
    pub hot_access_count: u32,
    /// Access timestamps kept per block.
    pub access_history_size: usize,
    /// Utilization samples kept for prediction.
    pub history_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_memory: GIB,
            memory_tiers: MemoryTiersConfig::default(),
            cache_size: None,
            gc_interval_secs: 300,
            gc_age_threshold_secs: 3600,
            defrag_interval_secs: 3600,
            fragmentation_threshold: 0.3,
            migration_interval_secs: 300,
            rebalance_interval_secs: 300,
            prediction_interval_secs: 300,
            access_window_secs: 300,
            hot_access_count: 10,
            access_history_size: 50,
            history_size: 100,
        }
    }
}

impl MemoryConfig {
    /// Cache budget in bytes.
    #[must_use]
    pub const fn effective_cache_size(&self) -> u64 {
        match self.cache_size {
            Some(size) => size,
            None => self.total_memory / 10,
        }
    }

    /// Validate memory configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.total_memory == 0 {
            return Err("total_memory must be greater than 0".into());
        }
        let tiers = &self.memory_tiers;
        let sum = tiers.fast.capacity_fraction
            + tiers.standard.capacity_fraction
            + tiers.slow.capacity_fraction;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("memory tier fractions must sum to 1.0, got {sum:.3}"));
        }
        for (name, tier) in [
            ("fast", &tiers.fast),
            ("standard", &tiers.standard),
            ("slow", &tiers.slow),
        ] {
            if tier.capacity_fraction <= 0.0 {
                return Err(format!("memory tier `{name}` capacity_fraction must be positive"));
            }
        }
        if self.effective_cache_size() > self.total_memory {
            return Err("cache_size must not exceed total_memory".into());
        }
        if !(0.0..=1.0).contains(&self.fragmentation_threshold) {
            return Err("fragmentation_threshold must be in [0, 1]".into());
        }
        if self.access_window_secs == 0 || self.hot_access_count == 0 {
            return Err("access_window_secs and hot_access_count must be positive".into());
        }
        Ok(())
    }
}

/// Attention manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Total attention budget.
    pub total_attention: f64,
    /// Seconds between decay ticks.
    pub decay_interval_secs: u64,
    /// Exponential decay rate per second.
    pub decay_rate: f64,
    /// Allocation below which a focus goes inactive.
    pub min_focus: f64,
    /// Seconds between refresh passes.
    pub refresh_interval_secs: u64,
    /// Fraction of a focus's base allocation below which it is refreshed.
    pub refresh_threshold: f64,
    /// Foci considered for refresh per pass.
    pub refresh_top_n: usize,
    /// Importance lost per second.
    pub importance_decay_rate: f64,
    /// Urgency gained per second by HIGH and CRITICAL foci.
    pub urgency_growth_rate: f64,
    /// Seconds a context stays active before it may be switched out.
    pub min_context_duration_secs: u64,
    /// Score margin the best context needs over the active one.
    pub context_switch_threshold: f64,
    /// Priority ratio below which a focus counts as a distraction.
    pub distraction_threshold: f64,
    /// Maximum share of a distraction's allocation removed per pass.
    pub distraction_filter_strength: f64,
    /// Distractions filtered per pass.
    pub max_distractions_per_cycle: usize,
    /// Access timestamps kept per focus.
    pub access_history_size: usize,
    /// Utilization samples kept.
    pub history_size: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            total_attention: 1.0,
            decay_interval_secs: 5,
            decay_rate: 0.01,
            min_focus: 0.05,
            refresh_interval_secs: 60,
            refresh_threshold: 0.5,
            refresh_top_n: 3,
            importance_decay_rate: 0.001,
            urgency_growth_rate: 0.002,
            min_context_duration_secs: 30,
            context_switch_threshold: 0.2,
            distraction_threshold: 0.3,
            distraction_filter_strength: 0.5,
            max_distractions_per_cycle: 3,
            access_history_size: 20,
            history_size: 100,
        }
    }
}

impl AttentionConfig {
    /// Validate attention configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.total_attention <= 0.0 {
            return Err("total_attention must be greater than 0".into());
        }
        if self.decay_rate < 0.0 {
            return Err("decay_rate must not be negative".into());
        }
        for (name, value) in [
            ("min_focus", self.min_focus),
            ("refresh_threshold", self.refresh_threshold),
            ("distraction_threshold", self.distraction_threshold),
            ("distraction_filter_strength", self.distraction_filter_strength),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be in [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks allowed in the running set.
    pub max_concurrent_tasks: usize,
    /// Whether HIGH and CRITICAL tasks may preempt running work.
    pub preemption_enabled: bool,
    /// Seconds a task may run before the timeout sweep fails it.
    pub task_timeout_secs: u64,
    /// Wait after which the fairness policy boosts a task.
    pub fairness_wait_threshold_secs: u64,
    /// Pending tasks per user or group above which the group is boosted.
    pub fairness_pending_threshold: usize,
    /// Milliseconds between background scheduling passes.
    pub schedule_interval_ms: u64,
    /// System load above which cheap tasks are favoured.
    pub high_load_threshold: f64,
    /// System load below which expensive tasks are favoured.
    pub low_load_threshold: f64,
    /// Maximum queued tasks.
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            preemption_enabled: true,
            task_timeout_secs: 3600,
            fairness_wait_threshold_secs: 600,
            fairness_pending_threshold: 3,
            schedule_interval_ms: 1000,
            high_load_threshold: 0.8,
            low_load_threshold: 0.3,
            max_queue_depth: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be greater than 0".into());
        }
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than 0".into());
        }
        if self.schedule_interval_ms == 0 {
            return Err("schedule_interval_ms must be greater than 0".into());
        }
        if self.low_load_threshold >= self.high_load_threshold {
            return Err("low_load_threshold must be below high_load_threshold".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root configuration for the unified manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Compute allocator section.
    pub compute: ComputeConfig,
    /// Memory manager section.
    pub memory: MemoryConfig,
    /// Attention manager section.
    pub attention: AttentionConfig,
    /// Scheduler section.
    pub scheduler: SchedulerConfig,
    /// Seconds between manager-wide optimization passes.
    pub optimization_interval_secs: u64,
    /// Allocation events retained by the in-memory audit sink.
    pub audit_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            compute: ComputeConfig::default(),
            memory: MemoryConfig::default(),
            attention: AttentionConfig::default(),
            scheduler: SchedulerConfig::default(),
            optimization_interval_secs: 300,
            audit_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.compute
            .validate()
            .map_err(|e| format!("compute invalid: {e}"))?;
        self.memory
            .validate()
            .map_err(|e| format!("memory invalid: {e}"))?;
        self.attention
            .validate()
            .map_err(|e| format!("attention invalid: {e}"))?;
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        if self.optimization_interval_secs == 0 {
            return Err("optimization_interval_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `RESOURCE_CORE_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Recognized variables: `RESOURCE_CORE_CONFIG` (path to a JSON file used
    /// as the base), `RESOURCE_CORE_TOTAL_COMPUTE_UNITS`,
    /// `RESOURCE_CORE_TOTAL_MEMORY`, `RESOURCE_CORE_MAX_CONCURRENT_TASKS`,
    /// `RESOURCE_CORE_PREEMPTION_ENABLED`, `RESOURCE_CORE_TASK_TIMEOUT_SECS`,
    /// `RESOURCE_CORE_OPTIMIZATION_INTERVAL_SECS`.
    ///
    /// # Errors
    /// Unreadable config file, unparsable values, or failed validation.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = match std::env::var("RESOURCE_CORE_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Some(v) = env_parse::<f64>("RESOURCE_CORE_TOTAL_COMPUTE_UNITS")? {
            cfg.compute.total_compute_units = v;
            cfg.compute.max_compute_units = cfg.compute.max_compute_units.max(v);
        }
        if let Some(v) = env_parse::<u64>("RESOURCE_CORE_TOTAL_MEMORY")? {
            cfg.memory.total_memory = v;
        }
        if let Some(v) = env_parse::<usize>("RESOURCE_CORE_MAX_CONCURRENT_TASKS")? {
            cfg.scheduler.max_concurrent_tasks = v;
        }
        if let Some(v) = env_parse::<bool>("RESOURCE_CORE_PREEMPTION_ENABLED")? {
            cfg.scheduler.preemption_enabled = v;
        }
        if let Some(v) = env_parse::<u64>("RESOURCE_CORE_TASK_TIMEOUT_SECS")? {
            cfg.scheduler.task_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("RESOURCE_CORE_OPTIMIZATION_INTERVAL_SECS")? {
            cfg.optimization_interval_secs = v;
        }

        cfg.validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("validating resource core configuration")?;
        Ok(cfg)
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}
