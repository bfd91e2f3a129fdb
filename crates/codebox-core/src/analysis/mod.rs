//! Optional post-execution analysis.
//!
//! Failures here never fail an execution; the orchestrator leaves the
//! corresponding response fields empty instead.

pub mod performance;
pub mod quality;

pub use performance::{aggregate, check_thresholds};
pub use quality::{analyze, score};
