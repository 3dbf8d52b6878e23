// =============================================================================
// Outcome observations and the per-tenant intake buffer
// =============================================================================

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{EntityId, SignalKey};

/// One predicted-vs-realised ROI record from the outcome feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeObservation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub entity_id: EntityId,
    pub predicted_roi: f64,
    pub actual_roi: f64,
    /// Contribution shares of the ScoreSnapshot behind the prediction. Empty
    /// means "attribute by the weights in force".
    #[serde(default)]
    pub contribution_shares: BTreeMap<SignalKey, f64>,
    /// Declared segment tags, e.g. `price_band = "premium"`.
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

impl OutcomeObservation {
    /// `actual - predicted`.
    pub fn error(&self) -> f64 {
        self.actual_roi - self.predicted_roi
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.predicted_roi.is_finite() {
            return Err(EngineError::observation("predicted_roi", "must be a finite number"));
        }
        if !self.actual_roi.is_finite() {
            return Err(EngineError::observation("actual_roi", "must be a finite number"));
        }
        for (key, share) in &self.contribution_shares {
            if !share.is_finite() || !(0.0..=1.0).contains(share) {
                return Err(EngineError::observation(
                    format!("contribution_shares.{key}"),
                    format!("{share} is outside [0, 1]"),
                ));
            }
        }
        Ok(())
    }
}

/// Observations in arrival order, each stamped with when it was received.
///
/// The updater reads by arrival ("since the last cycle"); calibration reads
/// by `observed_at` ("the last N days"). An entry is kept until the updater
/// has consumed it and its outcome has left the calibration window.
#[derive(Debug, Default)]
pub struct OutcomeBuffer {
    entries: Vec<(DateTime<Utc>, OutcomeObservation)>,
}

impl OutcomeBuffer {
    pub fn push(&mut self, received_at: DateTime<Utc>, observation: OutcomeObservation) {
        let idx = self.entries.partition_point(|(at, _)| *at <= received_at);
        self.entries.insert(idx, (received_at, observation));
    }

    /// Observations received in `(after, until]`.
    pub fn received_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<OutcomeObservation> {
        let start = self.entries.partition_point(|(at, _)| *at <= after);
        let end = self.entries.partition_point(|(at, _)| *at <= until).max(start);
        self.entries[start..end].iter().map(|(_, o)| o.clone()).collect()
    }

    /// Observations whose outcome happened at or after `since`.
    pub fn observed_since(&self, since: DateTime<Utc>) -> Vec<OutcomeObservation> {
        self.entries
            .iter()
            .filter(|(_, o)| o.observed_at >= since)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Drop entries received at or before `consumed_through` whose outcome
    /// happened before `observed_cutoff`. Returns how many were dropped.
    pub fn prune(&mut self, consumed_through: DateTime<Utc>, observed_cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(at, o)| *at > consumed_through || o.observed_at >= observed_cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the updater gathers observations during the Observing phase.
pub trait OutcomeSource: Send + Sync {
    /// Observations received in `(after, until]` for `tenant`.
    fn gather(
        &self,
        tenant: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Future<Output = Vec<OutcomeObservation>> + Send;
}
