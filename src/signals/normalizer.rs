// =============================================================================
// Signal Normalizer: raw collector payloads into canonical SignalVectors
// =============================================================================
//
// Every expected key is present on the output. Missing values are imputed
// from the entity's most recent prior vector when one exists, otherwise from
// the configured default. Imputed keys are marked so the scorer lowers its
// confidence. Unknown keys never reach the scorer.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::runtime_config::NormalizerParams;
use crate::signals::vector::SignalVector;
use crate::types::{Imputation, SignalKey};

/// A raw signal payload as supplied by the collectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSignalPayload {
    /// Observation time; defaults to the ingestion time.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,

    /// Signal name to raw value (number, numeric string, or null).
    #[serde(default)]
    pub signals: serde_json::Map<String, Value>,
}

pub struct SignalNormalizer {
    params: NormalizerParams,
}

impl SignalNormalizer {
    pub fn new(params: NormalizerParams) -> Self {
        Self { params }
    }

    /// Validate, impute and clamp a raw payload.
    ///
    /// `prior` is the entity's most recent recorded vector, if any.
    pub fn normalize(
        &self,
        entity_id: &str,
        payload: &RawSignalPayload,
        prior: Option<&SignalVector>,
        now: DateTime<Utc>,
    ) -> Result<SignalVector, EngineError> {
        let mut observed: BTreeMap<SignalKey, f64> = BTreeMap::new();

        for (name, raw) in &payload.signals {
            let Ok(key) = name.parse::<SignalKey>() else {
                debug!(entity = %entity_id, signal = %name, "ignoring unknown signal key");
                continue;
            };
            if let Some(value) = coerce(name, raw)? {
                observed.insert(key, value);
            }
        }

        let mut values = BTreeMap::new();
        let mut imputed = BTreeMap::new();

        for key in SignalKey::ALL {
            if let Some(v) = observed.get(&key) {
                values.insert(key, *v);
                continue;
            }
            match prior.and_then(|p| p.get(key).map(|v| (v, p.imputation(key)))) {
                Some((v, prior_imputation)) => {
                    values.insert(key, v);
                    // A default carried forward is still a default.
                    imputed.insert(key, prior_imputation.unwrap_or(Imputation::Prior));
                }
                None => {
                    values.insert(key, self.params.default_value);
                    imputed.insert(key, Imputation::Default);
                }
            }
        }

        if !imputed.is_empty() {
            debug!(
                entity = %entity_id,
                imputed = imputed.len(),
                "imputed missing signals"
            );
        }

        Ok(SignalVector::with_imputations(
            entity_id,
            payload.recorded_at.unwrap_or(now),
            values,
            imputed,
        ))
    }
}

/// Coerce a raw JSON value to a finite number. `null` means missing.
fn coerce(name: &str, raw: &Value) -> Result<Option<f64>, EngineError> {
    let invalid = |reason: &str| EngineError::InvalidSignal {
        key: name.to_string(),
        reason: reason.to_string(),
    };

    let value = match raw {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid("number out of range"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid("string is not numeric"))?,
        _ => return Err(invalid("expected a number")),
    };

    if !value.is_finite() {
        return Err(invalid("value is not finite"));
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> RawSignalPayload {
        RawSignalPayload {
            recorded_at: None,
            signals: v.as_object().cloned().unwrap_or_default(),
        }
    }

    fn normalizer() -> SignalNormalizer {
        SignalNormalizer::new(NormalizerParams::default())
    }

    #[test]
    fn complete_payload_has_no_imputations() {
        let p = payload(json!({
            "aiv": 80, "ati": "75", "zero_click": 60.5, "ugc_health": 70, "geo_trust": 65
        }));
        let v = normalizer().normalize("store-1", &p, None, Utc::now()).unwrap();
        assert_eq!(v.values().len(), 5);
        assert!(v.imputed().is_empty());
        assert_eq!(v.get(SignalKey::Ati), Some(75.0));
        assert_eq!(v.get(SignalKey::ZeroClick), Some(60.5));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let p = payload(json!({ "aiv": 180, "ati": -4 }));
        let v = normalizer().normalize("store-1", &p, None, Utc::now()).unwrap();
        assert_eq!(v.get(SignalKey::Aiv), Some(100.0));
        assert_eq!(v.get(SignalKey::Ati), Some(0.0));
    }

    #[test]
    fn missing_values_use_default_without_prior() {
        let p = payload(json!({ "aiv": 80, "ati": null }));
        let v = normalizer().normalize("store-1", &p, None, Utc::now()).unwrap();
        assert_eq!(v.get(SignalKey::Ati), Some(50.0));
        assert_eq!(v.imputation(SignalKey::Ati), Some(Imputation::Default));
        assert_eq!(v.imputation(SignalKey::Aiv), None);
        assert_eq!(v.imputed().len(), 4);
    }

    #[test]
    fn missing_values_prefer_prior() {
        let n = normalizer();
        let first = n
            .normalize("store-1", &payload(json!({ "aiv": 80, "geo_trust": 91 })), None, Utc::now())
            .unwrap();
        let second = n
            .normalize("store-1", &payload(json!({ "aiv": 82 })), Some(&first), Utc::now())
            .unwrap();
        assert_eq!(second.get(SignalKey::GeoTrust), Some(91.0));
        assert_eq!(second.imputation(SignalKey::GeoTrust), Some(Imputation::Prior));
        // ati was a default on the first vector and stays a default.
        assert_eq!(second.imputation(SignalKey::Ati), Some(Imputation::Default));
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let err = normalizer()
            .normalize("store-1", &payload(json!({ "aiv": "high" })), None, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_signal");
        assert!(err.to_string().contains("aiv"));

        let err = normalizer()
            .normalize("store-1", &payload(json!({ "ati": [1, 2] })), None, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_signal");

        let err = normalizer()
            .normalize("store-1", &payload(json!({ "ati": "NaN" })), None, Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_signal");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let p = payload(json!({ "aiv": 70, "domain_authority": "abc" }));
        let v = normalizer().normalize("store-1", &p, None, Utc::now()).unwrap();
        assert_eq!(v.values().len(), 5);
    }
}
