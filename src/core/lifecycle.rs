//! Component lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::ResourceError;

/// Lifecycle of an allocator, the scheduler or the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Constructed; internal structures not built.
    #[default]
    Uninitialized,
    /// Structures built; not yet accepting work.
    Initialized,
    /// Accepting work.
    Running,
    /// Shut down; may be started again.
    Stopped,
}

impl Lifecycle {
    /// Fail with [`ResourceError::NotRunning`] unless running.
    pub fn ensure_running(self, component: &'static str) -> Result<(), ResourceError> {
        match self {
            Self::Running => Ok(()),
            state @ (Self::Uninitialized | Self::Initialized | Self::Stopped) => {
                Err(ResourceError::NotRunning { component, state })
            }
        }
    }

    /// Whether the component is accepting work.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
