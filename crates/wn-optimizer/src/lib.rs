//! # wn-optimizer
//!
//! Sampling and narrowing for Winnow.
//!
//! Provides the hierarchical config sampler, constraint rules backed by a
//! complexity estimator, objective strategies, and the analyzer that turns
//! trial history into removals from the search space.

mod analyzer;
mod complexity;
mod constraint;
mod objective;
mod sampler;
mod status;

pub use analyzer::{
    analyze, narrow, AnalysisRow, AnalysisTable, Candidate, MarginMode, NarrowOutcome,
    NarrowingConfig, NarrowingMode,
};
pub use complexity::{estimate, Complexity, InputShape};
pub use constraint::{Constraint, ConstraintSet, Rule};
pub use objective::{ObjectiveDirection, ObjectiveStrategy};
pub use sampler::{canonicalize, ConfigSampler, SamplerStats};
pub use status::{BestTrial, SearchState, SearchStatus};
