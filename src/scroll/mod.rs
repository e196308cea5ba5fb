//! Scroll-driven extraction of lazily loaded lists.

pub mod convergence;
pub mod driver;

pub use convergence::{ConvergenceDetector, ConvergenceReason, ConvergenceSettings, Verdict};
pub use driver::{ScrollDriver, ScrollOutcome, ScrollSettings, ScrollState};
