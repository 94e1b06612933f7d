//! Serializable value types shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a scheduled task.
pub type TaskId = String;

/// Identifier of a live allocation.
pub type AllocationId = String;

/// Generate a fresh random identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Request priority. Ordering is ascending, so `Critical` is the greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Opportunistic work.
    Background,
    /// Below normal.
    Low,
    /// Normal work.
    #[default]
    Medium,
    /// Latency sensitive.
    High,
    /// Must run; may preempt lower priorities.
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Background,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Critical,
    ];

    /// Base scheduling value (CRITICAL=100 … BACKGROUND=20).
    #[must_use]
    pub const fn value(self) -> f64 {
        match self {
            Self::Critical => 100.0,
            Self::High => 80.0,
            Self::Medium => 60.0,
            Self::Low => 40.0,
            Self::Background => 20.0,
        }
    }

    /// Normalized weight in (0, 1].
    #[must_use]
    pub fn weight(self) -> f64 {
        self.value() / 100.0
    }

    /// Whether allocations at this priority are shielded from preemption.
    #[must_use]
    pub const fn is_protected(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    /// Parse a case-insensitive priority name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" | "normal" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Background => "BACKGROUND",
        };
        f.write_str(name)
    }
}

/// Kind of resource being accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Normalized compute units.
    Compute,
    /// Bytes of memory.
    Memory,
    /// Attention budget.
    Attention,
    /// Network share (pass-through).
    Network,
    /// Storage share (pass-through).
    Storage,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compute => "compute",
            Self::Memory => "memory",
            Self::Attention => "attention",
            Self::Network => "network",
            Self::Storage => "storage",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_and_values() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low > Priority::Background);
        assert!((Priority::High.value() - Priority::Low.value() - 40.0).abs() < f64::EPSILON);
        assert!(Priority::High.is_protected());
        assert!(!Priority::Medium.is_protected());
    }

    #[test]
    fn priority_serde_names() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let parsed: Priority = serde_json::from_str("\"BACKGROUND\"").unwrap();
        assert_eq!(parsed, Priority::Background);
        assert_eq!(Priority::parse("Normal"), Some(Priority::Medium));
    }
}
