// =============================================================================
// Composite Scorer: weighted aggregation of normalized signals
// =============================================================================
//
// composite = Σ w[k]·s[k] / Σ w[k]   over keys present in both the weights and
// the signal vector. Keys missing from the vector shrink the denominator and
// the reported confidence by the excluded weight mass.
//
// confidence = Σ w[k]·credit[k] · freshness(age)
//   credit = 1 for observed keys, `prior_imputation_credit` for keys carried
//   from the prior vector, 0 for default-filled keys.
//
// Absence of every weighted signal yields score 0 and confidence 0.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime_config::{NormalizerParams, RuntimeConfig};
use crate::scoring::weights::WeightSet;
use crate::signals::{FreshnessPolicy, SignalVector};
use crate::types::{EntityId, Imputation, SignalKey};

/// The contribution of a single signal to the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub key: SignalKey,
    pub weight: f64,
    pub value: f64,
    /// Points this signal adds to the composite.
    pub contribution: f64,
    /// Fraction of the composite attributable to this signal (sums to 1).
    pub share: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imputed: Option<Imputation>,
}

/// Result of one scoring request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub score: f64,
    pub confidence: f64,
    pub contributions: Vec<SignalContribution>,
    /// Weight mass of the signals that were present.
    pub weight_coverage: f64,
    pub freshness: f64,
    pub weight_version: u64,
    pub signals_recorded_at: DateTime<Utc>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreSnapshot {
    pub fn share_of(&self, key: SignalKey) -> f64 {
        self.contributions
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.share)
            .unwrap_or(0.0)
    }
}

/// The single composite scoring implementation. Coefficients always come from
/// a WeightSet, never from code.
#[derive(Debug, Clone)]
pub struct CompositeScorer {
    freshness: FreshnessPolicy,
    prior_credit: f64,
}

impl CompositeScorer {
    pub fn new(freshness: FreshnessPolicy, prior_credit: f64) -> Self {
        Self {
            freshness,
            prior_credit: prior_credit.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            FreshnessPolicy::new(&config.scoring),
            config.normalizer.prior_imputation_credit,
        )
    }

    /// Score a signal vector under the given weights.
    pub fn score(&self, signals: &SignalVector, weights: &WeightSet, now: DateTime<Utc>) -> ScoreSnapshot {
        let mut present_mass = 0.0;
        let mut credited_mass = 0.0;
        let mut weighted_sum = 0.0;
        let mut present = Vec::with_capacity(weights.coefficients().len());

        for (&key, &weight) in weights.coefficients() {
            let Some(value) = signals.get(key) else {
                continue;
            };
            let imputed = signals.imputation(key);
            let credit = match imputed {
                None => 1.0,
                Some(Imputation::Prior) => self.prior_credit,
                Some(Imputation::Default) => 0.0,
            };
            present_mass += weight;
            credited_mass += weight * credit;
            weighted_sum += weight * value;
            present.push((key, weight, value, imputed));
        }

        let score = if present_mass > 0.0 {
            (weighted_sum / present_mass).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let contributions = present
            .into_iter()
            .map(|(key, weight, value, imputed)| {
                let contribution = if present_mass > 0.0 {
                    weight * value / present_mass
                } else {
                    0.0
                };
                let share = if score > 0.0 {
                    contribution / score
                } else if present_mass > 0.0 {
                    weight / present_mass
                } else {
                    0.0
                };
                SignalContribution {
                    key,
                    weight,
                    value,
                    contribution,
                    share,
                    imputed,
                }
            })
            .collect();

        let freshness = self.freshness.factor(now - signals.recorded_at());
        let confidence = (credited_mass * freshness).clamp(0.0, 1.0);

        ScoreSnapshot {
            id: Uuid::new_v4(),
            entity_id: signals.entity_id().to_string(),
            score,
            confidence,
            contributions,
            weight_coverage: present_mass,
            freshness,
            weight_version: weights.version(),
            signals_recorded_at: signals.recorded_at(),
            scored_at: now,
        }
    }
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self::new(
            FreshnessPolicy::default(),
            NormalizerParams::default().prior_imputation_credit,
        )
    }
}

/// Composite value only, for hot loops that need no breakdown.
pub fn composite_value(signals: &SignalVector, weights: &WeightSet) -> f64 {
    let (sum, mass) = weights
        .coefficients()
        .iter()
        .filter_map(|(&k, &w)| signals.get(k).map(|v| (w * v, w)))
        .fold((0.0, 0.0), |(s, m), (wv, w)| (s + wv, m + w));
    if mass > 0.0 {
        (sum / mass).clamp(0.0, 100.0)
    } else {
        0.0
    }
}
