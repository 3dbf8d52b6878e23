// =============================================================================
// TrendSeries: chronologically ordered score history for one entity
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scoring::ScoreSnapshot;
use crate::types::EntityId;

/// Ordered sequence of snapshots keyed by the time their signals were
/// recorded. Snapshots with equal timestamps keep insertion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrendSeries {
    entity_id: EntityId,
    snapshots: Vec<ScoreSnapshot>,
}

impl TrendSeries {
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            snapshots: Vec::new(),
        }
    }

    pub fn from_snapshots(entity_id: impl Into<EntityId>, snapshots: impl IntoIterator<Item = ScoreSnapshot>) -> Self {
        let mut series = Self::new(entity_id);
        for s in snapshots {
            series.push(s);
        }
        series
    }

    /// Insert keeping chronological order; ties go after existing entries.
    pub fn push(&mut self, snapshot: ScoreSnapshot) {
        let at = snapshot.signals_recorded_at;
        let idx = self
            .snapshots
            .partition_point(|s| s.signals_recorded_at <= at);
        self.snapshots.insert(idx, snapshot);
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn snapshots(&self) -> &[ScoreSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&ScoreSnapshot> {
        self.snapshots.last()
    }

    /// Drop the oldest points beyond `max`.
    pub fn retain_latest(&mut self, max: usize) {
        if self.snapshots.len() > max {
            self.snapshots.drain(..self.snapshots.len() - max);
        }
    }

    /// Points recorded at or after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> TrendSeries {
        let start = self.snapshots.partition_point(|s| s.signals_recorded_at < since);
        TrendSeries {
            entity_id: self.entity_id.clone(),
            snapshots: self.snapshots[start..].to_vec(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::point;
    use super::*;
    use chrono::Duration;

    #[test]
    fn push_keeps_chronological_order() {
        let t0 = Utc::now();
        let mut s = TrendSeries::new("store-1");
        s.push(point(t0 + Duration::days(2), 3.0));
        s.push(point(t0, 1.0));
        s.push(point(t0 + Duration::days(1), 2.0));
        let scores: Vec<f64> = s.snapshots().iter().map(|p| p.score).collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let t0 = Utc::now();
        let mut s = TrendSeries::new("store-1");
        s.push(point(t0, 1.0));
        s.push(point(t0, 2.0));
        assert_eq!(s.latest().map(|p| p.score), Some(2.0));
    }

    #[test]
    fn since_filters_window() {
        let t0 = Utc::now();
        let s = TrendSeries::from_snapshots(
            "store-1",
            (0..10).map(|d| point(t0 + Duration::days(d), d as f64)),
        );
        let w = s.since(t0 + Duration::days(7));
        assert_eq!(w.len(), 3);
        assert_eq!(w.snapshots()[0].score, 7.0);
    }

    #[test]
    fn retain_latest_evicts_oldest() {
        let t0 = Utc::now();
        let mut s = TrendSeries::from_snapshots(
            "store-1",
            (0..10).map(|d| point(t0 + Duration::days(d), d as f64)),
        );
        s.retain_latest(4);
        assert_eq!(s.len(), 4);
        assert_eq!(s.snapshots()[0].score, 6.0);
    }
}
