// =============================================================================
// Runtime Configuration: engine tunables with atomic save
// =============================================================================
//
// Every tunable of the scoring engine lives here: default weights, freshness
// window, trend dead-zone, simulation caps, reinforcement step bounds and
// calibration thresholds. Weight tuning never requires a code change.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::SignalKey;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_signal_value() -> f64 {
    50.0
}

fn default_prior_imputation_credit() -> f64 {
    0.6
}

fn default_staleness_window_days() -> f64 {
    14.0
}

fn default_half_life_days() -> f64 {
    7.0
}

fn default_coefficients() -> BTreeMap<SignalKey, f64> {
    BTreeMap::from([
        (SignalKey::Aiv, 0.25),
        (SignalKey::Ati, 0.20),
        (SignalKey::ZeroClick, 0.25),
        (SignalKey::UgcHealth, 0.15),
        (SignalKey::GeoTrust, 0.15),
    ])
}

fn default_update_cycle_days() -> u32 {
    14
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_dead_zone_per_day() -> f64 {
    0.5
}

fn default_base_uncertainty() -> f64 {
    1.0
}

fn default_forecast_horizons() -> Vec<u32> {
    vec![7, 14, 30]
}

fn default_min_days() -> i64 {
    1
}

fn default_max_days() -> i64 {
    365
}

fn default_min_step_hours() -> f64 {
    6.0
}

fn default_runs() -> usize {
    1000
}

fn default_max_runs() -> usize {
    10_000
}

fn default_wall_clock_budget_ms() -> u64 {
    250
}

fn default_horizon_days() -> f64 {
    30.0
}

fn default_relative_spread() -> f64 {
    0.25
}

fn default_min_action_confidence() -> f64 {
    0.05
}

fn default_check_interval_secs() -> u64 {
    3600
}

fn default_max_step() -> f64 {
    0.05
}

fn default_material_change() -> f64 {
    0.005
}

fn default_observation_timeout_secs() -> u64 {
    30
}

fn default_writer_retry_attempts() -> u32 {
    5
}

fn default_writer_retry_base_ms() -> u64 {
    50
}

fn default_ece_threshold() -> f64 {
    0.10
}

fn default_lift_threshold() -> f64 {
    1.2
}

fn default_min_bin_samples() -> usize {
    20
}

fn default_segment_bias_threshold() -> f64 {
    0.05
}

fn default_isotonic_min_samples() -> usize {
    1000
}

fn default_value_per_outcome() -> f64 {
    2500.0
}

fn default_tenants() -> Vec<String> {
    vec!["demo".to_string()]
}

// =============================================================================
// Sections
// =============================================================================

/// Signal normalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerParams {
    /// Value used when a signal is missing and no prior value exists.
    #[serde(default = "default_signal_value")]
    pub default_value: f64,

    /// Confidence credit (0..1) earned by a key imputed from the prior
    /// vector. Default-imputed keys earn no credit.
    #[serde(default = "default_prior_imputation_credit")]
    pub prior_imputation_credit: f64,
}

impl Default for NormalizerParams {
    fn default() -> Self {
        Self {
            default_value: default_signal_value(),
            prior_imputation_credit: default_prior_imputation_credit(),
        }
    }
}

/// Shape of the freshness decay applied to scoring confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessCurve {
    #[default]
    Linear,
    HalfLife,
}

/// Composite scorer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringParams {
    /// Age (days) at which linear freshness reaches zero.
    #[serde(default = "default_staleness_window_days")]
    pub staleness_window_days: f64,

    #[serde(default)]
    pub freshness_curve: FreshnessCurve,

    /// Half-life (days) used by the `half_life` curve.
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            staleness_window_days: default_staleness_window_days(),
            freshness_curve: FreshnessCurve::Linear,
            half_life_days: default_half_life_days(),
        }
    }
}

/// Seed WeightSet used for tenants with no ledger history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightDefaults {
    #[serde(default = "default_coefficients")]
    pub coefficients: BTreeMap<SignalKey, f64>,

    #[serde(default = "default_update_cycle_days")]
    pub update_cycle_days: u32,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for WeightDefaults {
    fn default() -> Self {
        Self {
            coefficients: default_coefficients(),
            update_cycle_days: default_update_cycle_days(),
            learning_rate: default_learning_rate(),
        }
    }
}

/// Trend analyzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendParams {
    /// |velocity| below this (points/day) is labelled stable.
    #[serde(default = "default_dead_zone_per_day")]
    pub dead_zone_per_day: f64,

    /// Forecast band half-width at a one-day horizon. Must be positive.
    #[serde(default = "default_base_uncertainty")]
    pub base_uncertainty: f64,

    #[serde(default = "default_forecast_horizons")]
    pub forecast_horizons_days: Vec<u32>,

    #[serde(default = "default_min_days")]
    pub min_days: i64,

    #[serde(default = "default_max_days")]
    pub max_days: i64,

    /// Points recorded within this many hours of the start of a run are
    /// merged before differencing; the latest score in the run wins.
    #[serde(default = "default_min_step_hours")]
    pub min_step_hours: f64,
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            dead_zone_per_day: default_dead_zone_per_day(),
            base_uncertainty: default_base_uncertainty(),
            forecast_horizons_days: default_forecast_horizons(),
            min_days: default_min_days(),
            max_days: default_max_days(),
            min_step_hours: default_min_step_hours(),
        }
    }
}

/// Scenario simulator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    #[serde(default = "default_runs")]
    pub default_runs: usize,

    /// Hard cap on the number of Monte Carlo runs per request.
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,

    /// Wall-clock budget; exceeding it returns a partial, reduced-confidence
    /// result.
    #[serde(default = "default_wall_clock_budget_ms")]
    pub wall_clock_budget_ms: u64,

    #[serde(default = "default_horizon_days")]
    pub default_horizon_days: f64,

    /// Effect standard deviation as a fraction of magnitude at confidence 1.
    #[serde(default = "default_relative_spread")]
    pub relative_spread: f64,

    /// Floor applied to action confidence before dividing the spread by it.
    #[serde(default = "default_min_action_confidence")]
    pub min_action_confidence: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            default_runs: default_runs(),
            max_runs: default_max_runs(),
            wall_clock_budget_ms: default_wall_clock_budget_ms(),
            default_horizon_days: default_horizon_days(),
            relative_spread: default_relative_spread(),
            min_action_confidence: default_min_action_confidence(),
        }
    }
}

/// Step-size decay curve for the reinforcement updater.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayCurve {
    /// `1 / (1 + n)`
    #[default]
    Reciprocal,
    /// `exp(-rate * n)`
    Exponential { rate: f64 },
}

impl DecayCurve {
    /// Step multiplier after `stable_cycles` consecutive near-unchanged cycles.
    pub fn factor(self, stable_cycles: u32) -> f64 {
        let n = stable_cycles as f64;
        match self {
            Self::Reciprocal => 1.0 / (1.0 + n),
            Self::Exponential { rate } => (-rate.max(0.0) * n).exp(),
        }
    }
}

/// Reinforcement weight updater settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinforcementParams {
    /// How often the background scheduler wakes to check for due cycles.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Largest absolute per-signal weight change in a single cycle.
    #[serde(default = "default_max_step")]
    pub max_step: f64,

    #[serde(default)]
    pub decay_curve: DecayCurve,

    /// Cycles whose largest |Δw| stays below this count as stable.
    #[serde(default = "default_material_change")]
    pub material_change: f64,

    /// Soft timeout for observation gathering.
    #[serde(default = "default_observation_timeout_secs")]
    pub observation_timeout_secs: u64,

    #[serde(default = "default_writer_retry_attempts")]
    pub writer_retry_attempts: u32,

    #[serde(default = "default_writer_retry_base_ms")]
    pub writer_retry_base_ms: u64,
}

impl Default for ReinforcementParams {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_step: default_max_step(),
            decay_curve: DecayCurve::Reciprocal,
            material_change: default_material_change(),
            observation_timeout_secs: default_observation_timeout_secs(),
            writer_retry_attempts: default_writer_retry_attempts(),
            writer_retry_base_ms: default_writer_retry_base_ms(),
        }
    }
}

/// Calibration evaluator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    #[serde(default = "default_ece_threshold")]
    pub ece_threshold: f64,

    /// Minimum acceptable lift@10.
    #[serde(default = "default_lift_threshold")]
    pub lift_threshold: f64,

    /// Bins with fewer samples flag the report as low-confidence.
    #[serde(default = "default_min_bin_samples")]
    pub min_bin_samples: usize,

    #[serde(default = "default_segment_bias_threshold")]
    pub segment_bias_threshold: f64,

    /// Sample count at which isotonic regression is preferred over
    /// temperature scaling.
    #[serde(default = "default_isotonic_min_samples")]
    pub isotonic_min_samples: usize,

    /// Dollar value attached to one unit of outcome, used for the
    /// dollar-impact estimate.
    #[serde(default = "default_value_per_outcome")]
    pub value_per_outcome: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            ece_threshold: default_ece_threshold(),
            lift_threshold: default_lift_threshold(),
            min_bin_samples: default_min_bin_samples(),
            segment_bias_threshold: default_segment_bias_threshold(),
            isotonic_min_samples: default_isotonic_min_samples(),
            value_per_outcome: default_value_per_outcome(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Pulse engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tenants seeded with the default WeightSet at startup.
    #[serde(default = "default_tenants")]
    pub tenants: Vec<String>,

    #[serde(default)]
    pub normalizer: NormalizerParams,

    #[serde(default)]
    pub scoring: ScoringParams,

    #[serde(default)]
    pub default_weights: WeightDefaults,

    #[serde(default)]
    pub trend: TrendParams,

    #[serde(default)]
    pub simulation: SimulationParams,

    #[serde(default)]
    pub reinforcement: ReinforcementParams,

    #[serde(default)]
    pub calibration: CalibrationParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tenants: default_tenants(),
            normalizer: NormalizerParams::default(),
            scoring: ScoringParams::default(),
            default_weights: WeightDefaults::default(),
            trend: TrendParams::default(),
            simulation: SimulationParams::default(),
            reinforcement: ReinforcementParams::default(),
            calibration: CalibrationParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            tenants = ?config.tenants,
            update_cycle_days = config.default_weights.update_cycle_days,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
