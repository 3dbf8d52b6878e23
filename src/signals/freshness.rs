// =============================================================================
// Freshness Policy: age-based confidence decay for signal vectors
// =============================================================================

use chrono::Duration;

use crate::runtime_config::{FreshnessCurve, ScoringParams};

const SECS_PER_DAY: f64 = 86_400.0;

/// Maps the age of a signal vector to a freshness factor in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    curve: FreshnessCurve,
    staleness_window_days: f64,
    half_life_days: f64,
}

impl FreshnessPolicy {
    pub fn new(params: &ScoringParams) -> Self {
        Self {
            curve: params.freshness_curve,
            staleness_window_days: params.staleness_window_days,
            half_life_days: params.half_life_days,
        }
    }

    /// Freshness factor for a vector of the given age. Future-dated vectors
    /// count as fresh.
    pub fn factor(&self, age: Duration) -> f64 {
        let age_days = (age.num_milliseconds() as f64 / 1000.0 / SECS_PER_DAY).max(0.0);
        let f = match self.curve {
            FreshnessCurve::Linear => {
                if self.staleness_window_days <= 0.0 {
                    return if age_days == 0.0 { 1.0 } else { 0.0 };
                }
                1.0 - age_days / self.staleness_window_days
            }
            FreshnessCurve::HalfLife => {
                if self.half_life_days <= 0.0 {
                    return if age_days == 0.0 { 1.0 } else { 0.0 };
                }
                (-age_days * std::f64::consts::LN_2 / self.half_life_days).exp()
            }
        };
        f.clamp(0.0, 1.0)
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(&ScoringParams::default())
    }
}
