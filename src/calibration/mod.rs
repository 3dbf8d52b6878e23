// =============================================================================
// Calibration Module
// =============================================================================

pub mod evaluator;

pub use evaluator::{CalibrationEvaluator, CalibrationReport};
