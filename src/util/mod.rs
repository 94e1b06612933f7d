//! Shared utilities.

pub mod clock;
pub mod serde;
pub mod stats;
pub mod telemetry;

pub use clock::*;
pub use serde::*;
pub use telemetry::*;
