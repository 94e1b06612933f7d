//! Error types for allocator, scheduler and manager operations.

use thiserror::Error;

use crate::core::lifecycle::Lifecycle;
use crate::util::serde::{Priority, ResourceKind};

/// Errors produced by the resource core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    /// The pool lacks room for the request, even after preemption.
    #[error("capacity exceeded for {resource}: requested {requested:.4}, available {available:.4}")]
    CapacityExceeded {
        /// Resource that ran out.
        resource: ResourceKind,
        /// Amount requested in the allocator's own unit.
        requested: f64,
        /// Amount available at the time of the request.
        available: f64,
    },
    /// An allocation, block, task, focus or context id is unknown.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity looked up.
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },
    /// The component has not been started, or has been stopped.
    #[error("{component} is not running (state: {state})")]
    NotRunning {
        /// Component name.
        component: &'static str,
        /// Observed lifecycle state.
        state: Lifecycle,
    },
    /// Only HIGH and CRITICAL requests may preempt.
    #[error("preemption requires HIGH or CRITICAL priority, got {0}")]
    PreemptionIneligible(Priority),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A dependency edge is malformed (self edge or unknown target).
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),
    /// The pending queue is at its configured depth.
    #[error("task queue full ({0} pending)")]
    QueueFull(usize),
}

impl ResourceError {
    /// Shorthand for [`ResourceError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller can recover by retrying, shrinking the request or
    /// falling back.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::NotFound { .. } | Self::QueueFull(_)
        )
    }

    /// Whether this is a capacity failure.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
