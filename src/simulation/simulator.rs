// =============================================================================
// Scenario Simulator: Monte Carlo what-if over improvement actions
// =============================================================================
//
// Per run, for every action:
//   effect     ~ Normal(magnitude, magnitude·spread / max(confidence, floor))
//                clamped to [0, 100]
//   completion = timeframe · U(0.5, 1.5)
//   applied    = effect · min(1, horizon / completion)
// Effects are summed onto each action's target signal and the adjusted
// vector is re-scored with the composite scorer.
//
// Every run draws from its own PCG stream derived from (seed, run index), so
// a seeded request is reproducible regardless of how runs are scheduled.
// The wall-clock budget is checked every BUDGET_CHECK_EVERY runs; overrun
// returns the runs completed so far with `truncated` set and confidence
// scaled by the completed fraction.
// =============================================================================

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, Normal};
use rand_pcg::Pcg64;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::runtime_config::SimulationParams;
use crate::scoring::{composite_value, WeightSet};
use crate::signals::SignalVector;
use crate::simulation::action::{ActionType, ScenarioAction};
use crate::types::SignalKey;

const BUDGET_CHECK_EVERY: usize = 64;
const RUN_STREAM_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Per-request knobs. `None` falls back to configuration.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    pub threshold: Option<f64>,
    pub horizon_days: Option<f64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeDistribution {
    pub min: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Deterministic lift of one action applied alone at its expected realised
/// fraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSensitivity {
    pub action_type: ActionType,
    pub target: SignalKey,
    pub expected_fraction: f64,
    pub expected_lift: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub baseline_score: f64,
    pub distribution: OutcomeDistribution,
    /// p50 minus the baseline score.
    pub expected_lift: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability_exceeds_threshold: Option<f64>,
    pub runs_requested: usize,
    pub runs_completed: usize,
    pub truncated: bool,
    pub confidence: f64,
    pub horizon_days: f64,
    pub seed: u64,
    pub weight_version: u64,
    pub action_sensitivity: Vec<ActionSensitivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lift_per_thousand_cost: Option<f64>,
}

/// One action with its sampling distribution prepared.
struct PreparedAction<'a> {
    action: &'a ScenarioAction,
    effect: Option<Normal<f64>>,
}

pub struct ScenarioSimulator {
    params: SimulationParams,
}

impl ScenarioSimulator {
    pub fn new(params: SimulationParams) -> Self {
        Self { params }
    }

    /// Requested run count bounded to `[1, max_runs]`; `None` uses the default.
    pub fn resolve_runs(&self, requested: Option<usize>) -> Result<usize, EngineError> {
        match requested {
            Some(0) => Err(EngineError::scenario("simulations", "must be at least 1")),
            Some(n) => Ok(n.min(self.params.max_runs.max(1))),
            None => Ok(self.params.default_runs.clamp(1, self.params.max_runs.max(1))),
        }
    }

    pub fn simulate(
        &self,
        baseline: &SignalVector,
        actions: &[ScenarioAction],
        weights: &WeightSet,
        n_simulations: usize,
        options: &SimulationOptions,
    ) -> Result<ScenarioResult, EngineError> {
        if actions.is_empty() {
            return Err(EngineError::scenario("actions", "at least one action is required"));
        }
        let runs = self.resolve_runs(Some(n_simulations))?;

        if let Some(t) = options.threshold {
            if !t.is_finite() || !(0.0..=100.0).contains(&t) {
                return Err(EngineError::scenario("threshold", format!("{t} is outside [0, 100]")));
            }
        }
        let horizon = options.horizon_days.unwrap_or(self.params.default_horizon_days);
        if !horizon.is_finite() || horizon <= 0.0 {
            return Err(EngineError::scenario("horizon_days", "must be a positive number of days"));
        }

        let seed = options.seed.unwrap_or_else(rand::random);
        let prepared: Vec<PreparedAction<'_>> = actions.iter().map(|a| self.prepare(a)).collect();
        let baseline_score = composite_value(baseline, weights);

        let budget = Duration::from_millis(self.params.wall_clock_budget_ms);
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(runs);
        let mut deltas: BTreeMap<SignalKey, f64> = BTreeMap::new();

        for run in 0..runs {
            if run > 0 && run % BUDGET_CHECK_EVERY == 0 && started.elapsed() > budget {
                break;
            }
            let mut rng = Pcg64::seed_from_u64(seed ^ (run as u64).wrapping_mul(RUN_STREAM_MIX));
            deltas.clear();
            for p in &prepared {
                let applied = sample_effect(p, horizon, &mut rng);
                *deltas.entry(p.action.action_type().target()).or_insert(0.0) += applied;
            }
            outcomes.push(composite_value(&baseline.adjusted(&deltas), weights));
        }

        let completed = outcomes.len();
        let truncated = completed < runs;
        if truncated {
            warn!(
                requested = runs,
                completed,
                budget_ms = self.params.wall_clock_budget_ms,
                "scenario simulation truncated by wall-clock budget"
            );
        }

        outcomes.sort_by(|a, b| a.total_cmp(b));
        let distribution = summarize(&outcomes);
        let expected_lift = distribution.p50 - baseline_score;

        let probability_exceeds_threshold = options.threshold.map(|t| {
            outcomes.iter().filter(|&&s| s > t).count() as f64 / completed as f64
        });

        let mean_confidence =
            actions.iter().map(|a| a.confidence()).sum::<f64>() / actions.len() as f64;
        let confidence = (mean_confidence * completed as f64 / runs as f64).clamp(0.0, 1.0);

        let action_sensitivity = actions
            .iter()
            .map(|a| sensitivity(a, baseline, weights, baseline_score, horizon))
            .collect();

        let costs: Vec<f64> = actions.iter().filter_map(|a| a.cost()).collect();
        let total_cost = (!costs.is_empty()).then(|| costs.iter().sum::<f64>());
        let lift_per_thousand_cost = total_cost
            .filter(|&c| c > 0.0)
            .map(|c| expected_lift / (c / 1000.0));

        debug!(
            runs = completed,
            seed,
            baseline = baseline_score,
            p50 = distribution.p50,
            "scenario simulated"
        );

        Ok(ScenarioResult {
            baseline_score,
            distribution,
            expected_lift,
            threshold: options.threshold,
            probability_exceeds_threshold,
            runs_requested: runs,
            runs_completed: completed,
            truncated,
            confidence,
            horizon_days: horizon,
            seed,
            weight_version: weights.version(),
            action_sensitivity,
            total_cost,
            lift_per_thousand_cost,
        })
    }

    fn prepare<'a>(&self, action: &'a ScenarioAction) -> PreparedAction<'a> {
        let floor = self.params.min_action_confidence.max(f64::EPSILON);
        let sd = action.magnitude() * self.params.relative_spread.max(0.0)
            / action.confidence().max(floor);
        let effect = (sd > 0.0)
            .then(|| Normal::new(action.magnitude(), sd).ok())
            .flatten();
        PreparedAction { action, effect }
    }
}

fn sample_effect(p: &PreparedAction<'_>, horizon: f64, rng: &mut Pcg64) -> f64 {
    let effect = match &p.effect {
        Some(normal) => normal.sample(rng).clamp(0.0, 100.0),
        None => p.action.magnitude(),
    };
    let completion = p.action.timeframe_days() * (0.5 + rng.gen::<f64>());
    effect * (horizon / completion).min(1.0)
}

/// E[min(1, r / u)] for u ~ U(0.5, 1.5), where r = horizon / timeframe.
fn expected_fraction(horizon: f64, timeframe: f64) -> f64 {
    let r = horizon / timeframe;
    if r >= 1.5 {
        1.0
    } else if r <= 0.5 {
        r * 3f64.ln()
    } else {
        (r - 0.5) + r * (1.5 / r).ln()
    }
}

fn sensitivity(
    action: &ScenarioAction,
    baseline: &SignalVector,
    weights: &WeightSet,
    baseline_score: f64,
    horizon: f64,
) -> ActionSensitivity {
    let target = action.action_type().target();
    let fraction = expected_fraction(horizon, action.timeframe_days());
    let deltas = BTreeMap::from([(target, action.magnitude() * fraction)]);
    let lifted = composite_value(&baseline.adjusted(&deltas), weights);
    ActionSensitivity {
        action_type: action.action_type(),
        target,
        expected_fraction: fraction,
        expected_lift: lifted - baseline_score,
    }
}

/// Summary of a sorted, non-empty outcome sample.
fn summarize(sorted: &[f64]) -> OutcomeDistribution {
    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let var = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    OutcomeDistribution {
        min: sorted[0],
        p10: percentile(sorted, 0.10),
        p25: percentile(sorted, 0.25),
        p50: percentile(sorted, 0.50),
        p75: percentile(sorted, 0.75),
        p90: percentile(sorted, 0.90),
        max: sorted[sorted.len() - 1],
        mean,
        std_dev: var.sqrt(),
    }
}

/// Linear-interpolated percentile of a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
