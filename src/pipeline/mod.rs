// src/pipeline/mod.rs

//! Decision and cycle orchestration.

pub mod cycle;
pub mod decision;

pub use cycle::CycleRunner;
pub use decision::{DecisionEngine, decide};
