//! Condition expressions
//!
//! Conditions are boolean CEL expressions over the request attributes in an
//! [`EvalContext`]. The runtime only depends on the [`ConditionEngine`] and
//! [`CompiledCondition`] traits; [`CelConditionEngine`] is the default
//! implementation.

pub mod context;
pub mod convert;
pub mod engine;
pub mod error;
pub mod functions;

pub use context::EvalContext;
pub use engine::{CelCondition, CelConditionEngine, CompiledCondition, ConditionEngine};
pub use error::{CelError, Result};
