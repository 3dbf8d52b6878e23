// =============================================================================
// Engine Errors
// =============================================================================
//
// Read-path errors are synchronous and caller-visible; every variant carries a
// stable machine-readable kind. Write-path (reinforcement) errors use the same
// type but are absorbed by the updater and only logged.
// =============================================================================

use thiserror::Error;

/// All domain errors produced by the scoring engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid signal `{key}`: {reason}")]
    InvalidSignal { key: String, reason: String },

    #[error("invalid scenario field `{field}`: {reason}")]
    InvalidScenario { field: String, reason: String },

    #[error("invalid observation field `{field}`: {reason}")]
    InvalidObservation { field: String, reason: String },

    #[error("invalid weight set: {0}")]
    InvalidWeights(String),

    #[error("parameter `{param}` = {value} is outside [{min}, {max}]")]
    InvalidRange {
        param: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("insufficient data: need at least {required} points, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("weight update aborted: {0}")]
    WeightUpdateAborted(String),

    #[error("weight writer for tenant `{tenant}` is busy")]
    WriterBusy { tenant: String },

    #[error("observation gathering for tenant `{tenant}` stalled after {after_secs}s")]
    ObservationTimeout { tenant: String, after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("weight ledger error: {0}")]
    Ledger(String),
}

impl EngineError {
    /// Stable machine-readable error kind for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignal { .. } => "invalid_signal",
            Self::InvalidScenario { .. } => "invalid_scenario",
            Self::InvalidObservation { .. } => "invalid_observation",
            Self::InvalidWeights(_) => "invalid_weights",
            Self::InvalidRange { .. } => "invalid_range",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::WeightUpdateAborted(_) => "weight_update_aborted",
            Self::WriterBusy { .. } => "writer_busy",
            Self::ObservationTimeout { .. } => "observation_timeout",
            Self::NotFound(_) => "not_found",
            Self::Ledger(_) => "ledger",
        }
    }

    /// Whether the error stems from caller input rather than engine state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignal { .. }
                | Self::InvalidScenario { .. }
                | Self::InvalidObservation { .. }
                | Self::InvalidWeights(_)
                | Self::InvalidRange { .. }
        )
    }

    pub(crate) fn scenario(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidScenario {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn observation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidObservation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Validate an integer query parameter against an inclusive range.
pub fn check_range(param: &str, value: i64, min: i64, max: i64) -> Result<i64, EngineError> {
    if value < min || value > max {
        return Err(EngineError::InvalidRange {
            param: param.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}
