// =============================================================================
// SignalVector: the canonical, validated signal snapshot for one entity
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Imputation, SignalKey};

/// Lower bound of every normalized signal.
pub const SIGNAL_MIN: f64 = 0.0;
/// Upper bound of every normalized signal.
pub const SIGNAL_MAX: f64 = 100.0;

/// Immutable mapping of signal key to a value in [0, 100].
///
/// Values are clamped on construction. Keys that were filled in rather than
/// observed carry an [`Imputation`] marker so the scorer can discount them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalVector {
    entity_id: EntityId,
    recorded_at: DateTime<Utc>,
    values: BTreeMap<SignalKey, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    imputed: BTreeMap<SignalKey, Imputation>,
}

impl SignalVector {
    /// Build a fully observed vector. Non-finite values are dropped and the
    /// rest are clamped to [0, 100].
    pub fn new(
        entity_id: impl Into<EntityId>,
        recorded_at: DateTime<Utc>,
        values: impl IntoIterator<Item = (SignalKey, f64)>,
    ) -> Self {
        Self::with_imputations(entity_id, recorded_at, values, BTreeMap::new())
    }

    pub(crate) fn with_imputations(
        entity_id: impl Into<EntityId>,
        recorded_at: DateTime<Utc>,
        values: impl IntoIterator<Item = (SignalKey, f64)>,
        imputed: BTreeMap<SignalKey, Imputation>,
    ) -> Self {
        let values: BTreeMap<SignalKey, f64> = values
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k, clamp_signal(v)))
            .collect();
        let imputed = imputed
            .into_iter()
            .filter(|(k, _)| values.contains_key(k))
            .collect();
        Self {
            entity_id: entity_id.into(),
            recorded_at,
            values,
            imputed,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn get(&self, key: SignalKey) -> Option<f64> {
        self.values.get(&key).copied()
    }

    pub fn values(&self) -> &BTreeMap<SignalKey, f64> {
        &self.values
    }

    pub fn imputation(&self, key: SignalKey) -> Option<Imputation> {
        self.imputed.get(&key).copied()
    }

    pub fn imputed(&self) -> &BTreeMap<SignalKey, Imputation> {
        &self.imputed
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Derive a new vector with `deltas` added to the matching signals.
    /// Signals absent from `self` are left absent. Imputation markers carry
    /// over unchanged.
    pub fn adjusted(&self, deltas: &BTreeMap<SignalKey, f64>) -> Self {
        let values = self.values.iter().map(|(k, v)| {
            let delta = deltas.get(k).copied().unwrap_or(0.0);
            (*k, v + delta)
        });
        Self::with_imputations(
            self.entity_id.clone(),
            self.recorded_at,
            values,
            self.imputed.clone(),
        )
    }
}

/// Clamp a raw value to the signal range.
pub fn clamp_signal(value: f64) -> f64 {
    value.clamp(SIGNAL_MIN, SIGNAL_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_clamped_and_non_finite_dropped() {
        let v = SignalVector::new(
            "store-1",
            Utc::now(),
            [
                (SignalKey::Aiv, 140.0),
                (SignalKey::Ati, -3.0),
                (SignalKey::ZeroClick, f64::NAN),
            ],
        );
        assert_eq!(v.get(SignalKey::Aiv), Some(100.0));
        assert_eq!(v.get(SignalKey::Ati), Some(0.0));
        assert_eq!(v.get(SignalKey::ZeroClick), None);
    }

    #[test]
    fn adjusted_leaves_original_untouched() {
        let base = SignalVector::new("store-1", Utc::now(), [(SignalKey::Aiv, 90.0)]);
        let deltas = BTreeMap::from([(SignalKey::Aiv, 25.0), (SignalKey::GeoTrust, 10.0)]);
        let next = base.adjusted(&deltas);
        assert_eq!(base.get(SignalKey::Aiv), Some(90.0));
        assert_eq!(next.get(SignalKey::Aiv), Some(100.0));
        assert_eq!(next.get(SignalKey::GeoTrust), None);
    }
}
