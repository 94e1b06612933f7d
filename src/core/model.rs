//! Request, allocation and utilization records exchanged with callers.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::util::serde::{AllocationId, Priority};

/// Free-form provenance attached to requests and allocations.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key set on synthesized fallback allocations.
pub const DUMMY_MARKER: &str = "dummy";

/// Clamp a share into [0, 1]. NaN requests nothing.
fn clamp_share(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Resources requested by a caller. Every share is a fraction in [0, 1],
/// whether built in code or deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(from = "RequirementsWire")]
pub struct ResourceRequirements {
    /// Share of compute capacity.
    pub compute: f64,
    /// Share of total memory.
    pub memory: f64,
    /// Share of the attention budget.
    pub attention: f64,
    /// Share of network capacity (not enforced).
    pub network: f64,
    /// Share of storage capacity (not enforced).
    pub storage: f64,
    /// Ordering and preemption class.
    pub priority: Priority,
    /// Absolute deadline in milliseconds since epoch.
    pub deadline_ms: Option<u128>,
    /// Caller-supplied provenance.
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Deserialize)]
struct RequirementsWire {
    compute: f64,
    memory: f64,
    attention: f64,
    network: f64,
    storage: f64,
    priority: Priority,
    deadline_ms: Option<u128>,
    #[serde(default)]
    metadata: Metadata,
}

impl From<RequirementsWire> for ResourceRequirements {
    fn from(wire: RequirementsWire) -> Self {
        Self {
            compute: clamp_share(wire.compute),
            memory: clamp_share(wire.memory),
            attention: clamp_share(wire.attention),
            network: clamp_share(wire.network),
            storage: clamp_share(wire.storage),
            priority: wire.priority,
            deadline_ms: wire.deadline_ms,
            metadata: wire.metadata,
        }
    }
}

impl ResourceRequirements {
    /// Empty requirements at `priority`.
    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// The same share of every resource kind.
    #[must_use]
    pub fn uniform(share: f64, priority: Priority) -> Self {
        let share = clamp_share(share);
        Self {
            compute: share,
            memory: share,
            attention: share,
            network: share,
            storage: share,
            priority,
            deadline_ms: None,
            metadata: Metadata::new(),
        }
    }

    /// Set the compute share.
    #[must_use]
    pub fn with_compute(mut self, share: f64) -> Self {
        self.compute = clamp_share(share);
        self
    }

    /// Set the memory share.
    #[must_use]
    pub fn with_memory(mut self, share: f64) -> Self {
        self.memory = clamp_share(share);
        self
    }

    /// Set the attention share.
    #[must_use]
    pub fn with_attention(mut self, share: f64) -> Self {
        self.attention = clamp_share(share);
        self
    }

    /// Set the network share.
    #[must_use]
    pub fn with_network(mut self, share: f64) -> Self {
        self.network = clamp_share(share);
        self
    }

    /// Set the storage share.
    #[must_use]
    pub fn with_storage(mut self, share: f64) -> Self {
        self.storage = clamp_share(share);
        self
    }

    /// Set an absolute deadline.
    #[must_use]
    pub const fn with_deadline_ms(mut self, deadline_ms: u128) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A granted claim. Released exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Unique id.
    pub id: AllocationId,
    /// Granted compute units.
    pub compute: f64,
    /// Granted memory in bytes.
    pub memory_bytes: u64,
    /// Granted attention share.
    pub attention: f64,
    /// Network share, passed through.
    pub network: f64,
    /// Storage share, passed through.
    pub storage: f64,
    /// Priority of the request.
    pub priority: Priority,
    /// Grant time in milliseconds since epoch.
    pub allocated_at_ms: u128,
    /// Expiry, taken from the request deadline.
    pub expires_at_ms: Option<u128>,
    /// Links to sub-allocations and caller provenance.
    pub metadata: Metadata,
}

impl ResourceAllocation {
    /// An allocation with no resources granted yet.
    #[must_use]
    pub fn empty(id: AllocationId, req: &ResourceRequirements, now_ms: u128) -> Self {
        Self {
            id,
            compute: 0.0,
            memory_bytes: 0,
            attention: 0.0,
            network: req.network,
            storage: req.storage,
            priority: req.priority,
            allocated_at_ms: now_ms,
            expires_at_ms: req.deadline_ms,
            metadata: req.metadata.clone(),
        }
    }

    /// Whether this is a synthesized fallback.
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.metadata.get(DUMMY_MARKER).is_some_and(|v| v == "true")
    }

    /// Whether the allocation has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now_ms: u128) -> bool {
        self.expires_at_ms.is_some_and(|at| at < now_ms)
    }
}

/// Point-in-time usage, each share in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUtilization {
    /// Compute usage.
    pub compute: f64,
    /// Memory usage.
    pub memory: f64,
    /// Attention usage.
    pub attention: f64,
    /// Network usage.
    pub network: f64,
    /// Storage usage.
    pub storage: f64,
    /// Sample time.
    pub timestamp_ms: u128,
}

/// Bounded ring of utilization samples used for trend analysis.
#[derive(Debug, Clone)]
pub struct UtilizationHistory {
    samples: VecDeque<ResourceUtilization>,
    capacity: usize,
}

impl UtilizationHistory {
    /// Ring holding at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, dropping the oldest when full.
    pub fn push(&mut self, sample: ResourceUtilization) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Number of samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Project one field of every sample, oldest first.
    pub fn series(&self, field: impl Fn(&ResourceUtilization) -> f64) -> Vec<f64> {
        self.samples.iter().map(field).collect()
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<&ResourceUtilization> {
        self.samples.back()
    }
}
