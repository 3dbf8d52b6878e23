// =============================================================================
// Reinforcement Cycle State Machine
// =============================================================================
//
//   Idle → Observing → Evaluating → Adapting → Reinforcing → Idle
//
// Each transition is one method on `CycleMachine`; calling a step in the
// wrong phase is an error and leaves the machine untouched. The full
// intermediate state lives in a serde-serialisable `CycleCheckpoint`, so a
// cycle interrupted between steps can be resumed from its last checkpoint.
//
// Evaluating:   e_k     = Σ share_k·(actual − predicted) / Σ share_k
//               share_k = mean contribution share of signal k
// Adapting:     Δw_k    = lr · decay(stable_cycles) · e_k · share_k,
//               clipped to ±max_step
// Reinforcing:  w' = normalise(w + Δw); aborts on NaN/Inf or w + Δw < 0
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::reinforcement::observation::OutcomeObservation;
use crate::runtime_config::ReinforcementParams;
use crate::scoring::WeightSet;
use crate::types::{SignalKey, TenantId};

/// Relative-error thresholds of the recalibration classes.
const MINOR_RELATIVE_ERROR: f64 = 0.05;
const MODERATE_RELATIVE_ERROR: f64 = 0.15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Observing,
    Evaluating,
    Adapting,
    Reinforcing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Observing => "observing",
            Self::Evaluating => "evaluating",
            Self::Adapting => "adapting",
            Self::Reinforcing => "reinforcing",
        };
        f.write_str(s)
    }
}

/// How far each observation's prediction missed, bucketed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalibrationCounts {
    pub minor: usize,
    pub moderate: usize,
    pub major: usize,
}

impl RecalibrationCounts {
    pub fn record(&mut self, observation: &OutcomeObservation) {
        let err = observation.error().abs();
        let scale = observation.predicted_roi.abs();
        let relative = if scale > f64::EPSILON {
            err / scale
        } else if err == 0.0 {
            0.0
        } else {
            f64::INFINITY
        };
        if relative < MINOR_RELATIVE_ERROR {
            self.minor += 1;
        } else if relative < MODERATE_RELATIVE_ERROR {
            self.moderate += 1;
        } else {
            self.major += 1;
        }
    }
}

/// Everything a cycle has computed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCheckpoint {
    pub tenant: TenantId,
    pub phase: Phase,
    /// Version the cycle reads from; the commit must be `base_version + 1`.
    pub base_version: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub observations: Vec<OutcomeObservation>,
    #[serde(default)]
    pub recalibration: RecalibrationCounts,
    /// Share-weighted mean error per signal.
    #[serde(default)]
    pub errors: BTreeMap<SignalKey, f64>,
    /// Mean contribution share per signal.
    #[serde(default)]
    pub shares: BTreeMap<SignalKey, f64>,
    #[serde(default)]
    pub decay: f64,
    /// Clipped per-signal step.
    #[serde(default)]
    pub deltas: BTreeMap<SignalKey, f64>,
}

pub struct CycleMachine {
    checkpoint: CycleCheckpoint,
    params: ReinforcementParams,
}

impl CycleMachine {
    /// A fresh machine in Idle, bound to the version it will update.
    pub fn new(
        tenant: impl Into<TenantId>,
        current: &WeightSet,
        params: ReinforcementParams,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            checkpoint: CycleCheckpoint {
                tenant: tenant.into(),
                phase: Phase::Idle,
                base_version: current.version(),
                started_at: now,
                observations: Vec::new(),
                recalibration: RecalibrationCounts::default(),
                errors: BTreeMap::new(),
                shares: BTreeMap::new(),
                decay: 0.0,
                deltas: BTreeMap::new(),
            },
            params,
        }
    }

    pub fn resume(checkpoint: CycleCheckpoint, params: ReinforcementParams) -> Self {
        Self { checkpoint, params }
    }

    pub fn phase(&self) -> Phase {
        self.checkpoint.phase
    }

    pub fn checkpoint(&self) -> &CycleCheckpoint {
        &self.checkpoint
    }

    // ── Idle ────────────────────────────────────────────────────────────

    /// Leave Idle when the cycle is due or forced. Returns whether the
    /// machine moved on to Observing.
    pub fn wake(&mut self, current: &WeightSet, now: DateTime<Utc>, forced: bool) -> Result<bool, EngineError> {
        self.expect(Phase::Idle)?;
        self.expect_base(current)?;
        if forced || current.is_due(now) {
            self.checkpoint.phase = Phase::Observing;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Observing ───────────────────────────────────────────────────────

    /// Take the gathered observations. An empty batch returns the machine to
    /// Idle and yields `false`.
    pub fn observe(&mut self, observations: Vec<OutcomeObservation>) -> Result<bool, EngineError> {
        self.expect(Phase::Observing)?;
        if observations.is_empty() {
            self.checkpoint.phase = Phase::Idle;
            return Ok(false);
        }
        let mut counts = RecalibrationCounts::default();
        for o in &observations {
            counts.record(o);
        }
        self.checkpoint.recalibration = counts;
        self.checkpoint.observations = observations;
        self.checkpoint.phase = Phase::Evaluating;
        Ok(true)
    }

    // ── Evaluating ──────────────────────────────────────────────────────

    pub fn evaluate(&mut self, current: &WeightSet) -> Result<(), EngineError> {
        self.expect(Phase::Evaluating)?;
        self.expect_base(current)?;

        let n = self.checkpoint.observations.len() as f64;
        let mut errors = BTreeMap::new();
        let mut shares = BTreeMap::new();

        for (&key, &weight) in current.coefficients() {
            let mut share_sum = 0.0;
            let mut weighted_error = 0.0;
            for o in &self.checkpoint.observations {
                let share = if o.contribution_shares.is_empty() {
                    weight
                } else {
                    o.contribution_shares.get(&key).copied().unwrap_or(0.0)
                };
                share_sum += share;
                weighted_error += share * o.error();
            }
            let error = if share_sum > 0.0 {
                weighted_error / share_sum
            } else {
                0.0
            };
            errors.insert(key, error);
            shares.insert(key, share_sum / n);
        }

        self.checkpoint.errors = errors;
        self.checkpoint.shares = shares;
        self.checkpoint.phase = Phase::Adapting;
        Ok(())
    }

    // ── Adapting ────────────────────────────────────────────────────────

    pub fn adapt(&mut self, current: &WeightSet) -> Result<(), EngineError> {
        self.expect(Phase::Adapting)?;
        self.expect_base(current)?;

        let decay = self.params.decay_curve.factor(current.stable_cycles());
        let lr = current.learning_rate();
        let max_step = self.params.max_step.abs();

        let mut deltas = BTreeMap::new();
        for (&key, &error) in &self.checkpoint.errors {
            let share = self.checkpoint.shares.get(&key).copied().unwrap_or(0.0);
            let raw = lr * decay * error * share;
            if !raw.is_finite() {
                return Err(EngineError::WeightUpdateAborted(format!(
                    "non-finite step for `{key}`"
                )));
            }
            deltas.insert(key, raw.clamp(-max_step, max_step));
        }

        self.checkpoint.decay = decay;
        self.checkpoint.deltas = deltas;
        self.checkpoint.phase = Phase::Reinforcing;
        Ok(())
    }

    // ── Reinforcing ─────────────────────────────────────────────────────

    /// Build the successor WeightSet. The machine returns to Idle; persisting
    /// the result is the caller's job.
    pub fn reinforce(&mut self, current: &WeightSet, now: DateTime<Utc>) -> Result<WeightSet, EngineError> {
        self.expect(Phase::Reinforcing)?;
        self.expect_base(current)?;

        let unchanged = self.checkpoint.deltas.values().all(|d| *d == 0.0);
        let coefficients = if unchanged {
            current.coefficients().clone()
        } else {
            let mut shifted = BTreeMap::new();
            for (&key, &w) in current.coefficients() {
                let next = w + self.checkpoint.deltas.get(&key).copied().unwrap_or(0.0);
                if !next.is_finite() {
                    return Err(EngineError::WeightUpdateAborted(format!(
                        "non-finite weight for `{key}`"
                    )));
                }
                if next < 0.0 {
                    return Err(EngineError::WeightUpdateAborted(format!(
                        "update would drive `{key}` negative ({next:.4})"
                    )));
                }
                shifted.insert(key, next);
            }
            let total: f64 = shifted.values().sum();
            if !total.is_finite() || total <= 0.0 {
                return Err(EngineError::WeightUpdateAborted(
                    "updated weights have no mass".into(),
                ));
            }
            shifted.into_iter().map(|(k, w)| (k, w / total)).collect()
        };

        let largest_change = current
            .coefficients()
            .iter()
            .map(|(k, w)| (coefficients.get(k).copied().unwrap_or(0.0) - w).abs())
            .fold(0.0_f64, f64::max);
        let stable_cycles = if largest_change < self.params.material_change {
            current.stable_cycles().saturating_add(1)
        } else {
            0
        };

        let next = current
            .successor(coefficients, now, stable_cycles)
            .map_err(|e| EngineError::WeightUpdateAborted(e.to_string()))?;
        self.checkpoint.phase = Phase::Idle;
        Ok(next)
    }

    /// Largest absolute clipped step of this cycle.
    pub fn max_step(&self) -> f64 {
        self.checkpoint
            .deltas
            .values()
            .fold(0.0_f64, |m, d| m.max(d.abs()))
    }

    fn expect(&self, phase: Phase) -> Result<(), EngineError> {
        if self.checkpoint.phase != phase {
            return Err(EngineError::WeightUpdateAborted(format!(
                "{phase} step called while {}",
                self.checkpoint.phase
            )));
        }
        Ok(())
    }

    fn expect_base(&self, current: &WeightSet) -> Result<(), EngineError> {
        if current.version() != self.checkpoint.base_version {
            return Err(EngineError::WeightUpdateAborted(format!(
                "cycle started from version {} but version {} is current",
                self.checkpoint.base_version,
                current.version()
            )));
        }
        Ok(())
    }
}
