pub mod calibration;
pub mod engine;

pub use engine::{EvaluationError, FinalizeOutcome, finalize_attempt};
