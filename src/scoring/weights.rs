// =============================================================================
// WeightSet: versioned, validated scoring coefficients
// =============================================================================
//
// Invariants enforced on every construction path (including deserialisation):
//   - at least one coefficient
//   - every coefficient finite and within [0, 1]
//   - coefficients sum to 1 within WEIGHT_SUM_TOLERANCE
//
// A WeightSet is never mutated. The reinforcement updater derives a successor
// with `version + 1`; the store keeps every version.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::runtime_config::WeightDefaults;
use crate::types::SignalKey;

/// Allowed deviation of the coefficient sum from 1.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WeightSetFields")]
pub struct WeightSet {
    version: u64,
    coefficients: BTreeMap<SignalKey, f64>,
    last_update: DateTime<Utc>,
    update_cycle_days: u32,
    learning_rate: f64,
    /// Consecutive cycles whose largest step stayed below the material-change
    /// threshold. Drives step-size decay.
    stable_cycles: u32,
}

/// Unvalidated wire shape; converted through `WeightSet::new`.
#[derive(Deserialize)]
struct WeightSetFields {
    version: u64,
    coefficients: BTreeMap<SignalKey, f64>,
    last_update: DateTime<Utc>,
    update_cycle_days: u32,
    learning_rate: f64,
    #[serde(default)]
    stable_cycles: u32,
}

impl TryFrom<WeightSetFields> for WeightSet {
    type Error = EngineError;

    fn try_from(f: WeightSetFields) -> Result<Self, Self::Error> {
        let mut ws = WeightSet::new(
            f.version,
            f.coefficients,
            f.last_update,
            f.update_cycle_days,
            f.learning_rate,
        )?;
        ws.stable_cycles = f.stable_cycles;
        Ok(ws)
    }
}

impl WeightSet {
    pub fn new(
        version: u64,
        coefficients: BTreeMap<SignalKey, f64>,
        last_update: DateTime<Utc>,
        update_cycle_days: u32,
        learning_rate: f64,
    ) -> Result<Self, EngineError> {
        validate_coefficients(&coefficients)?;
        if !learning_rate.is_finite() || learning_rate < 0.0 {
            return Err(EngineError::InvalidWeights(format!(
                "learning_rate must be a non-negative number, got {learning_rate}"
            )));
        }
        Ok(Self {
            version,
            coefficients,
            last_update,
            update_cycle_days,
            learning_rate,
            stable_cycles: 0,
        })
    }

    /// Version 1 for a tenant with no history.
    pub fn initial(defaults: &WeightDefaults, now: DateTime<Utc>) -> Result<Self, EngineError> {
        Self::new(
            1,
            defaults.coefficients.clone(),
            now,
            defaults.update_cycle_days,
            defaults.learning_rate,
        )
    }

    /// Derive the next version. Carries cycle length and learning rate.
    pub fn successor(
        &self,
        coefficients: BTreeMap<SignalKey, f64>,
        now: DateTime<Utc>,
        stable_cycles: u32,
    ) -> Result<Self, EngineError> {
        let mut next = Self::new(
            self.version + 1,
            coefficients,
            now,
            self.update_cycle_days,
            self.learning_rate,
        )?;
        next.stable_cycles = stable_cycles;
        Ok(next)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn coefficients(&self) -> &BTreeMap<SignalKey, f64> {
        &self.coefficients
    }

    pub fn get(&self, key: SignalKey) -> Option<f64> {
        self.coefficients.get(&key).copied()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn update_cycle_days(&self) -> u32 {
        self.update_cycle_days
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn stable_cycles(&self) -> u32 {
        self.stable_cycles
    }

    /// Whether a full update cycle has elapsed since this version was written.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now - self.last_update >= Duration::days(self.update_cycle_days as i64)
    }
}

fn validate_coefficients(coefficients: &BTreeMap<SignalKey, f64>) -> Result<(), EngineError> {
    if coefficients.is_empty() {
        return Err(EngineError::InvalidWeights("no coefficients".into()));
    }
    for (key, w) in coefficients {
        if !w.is_finite() || !(0.0..=1.0).contains(w) {
            return Err(EngineError::InvalidWeights(format!(
                "coefficient for {key} must be within [0, 1], got {w}"
            )));
        }
    }
    let sum: f64 = coefficients.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::InvalidWeights(format!(
            "coefficients must sum to 1, got {sum:.9}"
        )));
    }
    Ok(())
}
