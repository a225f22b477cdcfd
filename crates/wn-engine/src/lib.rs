//! # wn-engine
//!
//! The round controller that drives a Winnow search, the trainer interface it
//! calls out to, and a deterministic surrogate trainer for dry runs.

pub mod controller;
pub mod surrogate;
pub mod trainer;

pub use controller::*;
pub use surrogate::*;
pub use trainer::*;
