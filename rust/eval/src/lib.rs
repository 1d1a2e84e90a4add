#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

//! Distributed evaluation metrics.
//!
//! Accumulates top-1 / top-5 correctness counts over a local evaluation pass
//! and combines them across ranks with one sum-reduction.

pub mod accumulator;
pub mod evaluator;
pub mod reduce;

pub use accumulator::EvalAccumulator;
pub use evaluator::{EvalOutcome, Evaluator, InferenceModel, InferenceOutput};
pub use reduce::{LocalReducer, ReduceError, Reducer, ThreadGroup, ThreadRank};

/// Errors that can occur during an evaluation pass.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("evaluation set is empty: no samples were evaluated on any rank")]
    EmptyEvaluationSet,
    #[error("metric reduction failed: {0}")]
    Reduce(#[from] ReduceError),
}
