// =============================================================================
// Trend Analyzer: direction, velocity, acceleration and forecast band
// =============================================================================
//
// Points closer together than `min_step_hours` are first merged into one
// (time of the first, score of the last), so bursts of near-simultaneous
// ingests never turn a small change into a huge per-day rate.
//
// velocity      first finite difference of the last two points, pts/day
// acceleration  second finite difference of the last three points, pts/day²
// direction     up / down outside a dead zone around zero velocity, else
//               stable
// forecast(H)   last + velocity·H, with half-width base·sqrt(H); the band is
//               the point estimate at H = 0 and widens strictly with H
//
// `base` is the configured uncertainty plus the spread of the series' own
// step velocities when at least three points exist.
// =============================================================================

use serde::Serialize;

use crate::error::EngineError;
use crate::runtime_config::TrendParams;
use crate::trend::series::TrendSeries;
use crate::types::TrendDirection;

/// Floor for the merge window and every finite difference (one minute).
const MIN_ELAPSED_DAYS: f64 = 1.0 / 1440.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastBand {
    pub horizon_days: f64,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
    pub half_width: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub entity_id: String,
    pub points: usize,
    pub latest_score: f64,
    pub direction: TrendDirection,
    pub velocity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
    pub base_uncertainty: f64,
    pub forecast: Vec<ForecastBand>,
}

pub struct TrendAnalyzer {
    params: TrendParams,
}

impl TrendAnalyzer {
    pub fn new(params: TrendParams) -> Self {
        Self { params }
    }

    /// Analyze with the configured forecast horizons.
    pub fn analyze(&self, series: &TrendSeries) -> Result<TrendReport, EngineError> {
        let horizons: Vec<f64> = self
            .params
            .forecast_horizons_days
            .iter()
            .map(|&h| h as f64)
            .collect();
        self.analyze_with_horizons(series, &horizons)
    }

    pub fn analyze_with_horizons(
        &self,
        series: &TrendSeries,
        horizons: &[f64],
    ) -> Result<TrendReport, EngineError> {
        let points: Vec<(f64, f64)> = series
            .snapshots()
            .iter()
            .map(|s| (s.signals_recorded_at.timestamp_millis() as f64 / MILLIS_PER_DAY, s.score))
            .collect();

        let min_step = (self.params.min_step_hours / 24.0).max(MIN_ELAPSED_DAYS);
        let raw_points = points.len();
        let points = collapse(&points, min_step);

        if points.len() < 2 {
            return Err(EngineError::InsufficientData {
                required: 2,
                available: points.len(),
            });
        }

        let velocities: Vec<f64> = points
            .windows(2)
            .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0).max(min_step))
            .collect();

        let n = points.len();
        let velocity = velocities[velocities.len() - 1];

        let acceleration = (n >= 3).then(|| {
            let v_prev = velocities[velocities.len() - 2];
            let span = ((points[n - 1].0 - points[n - 3].0) / 2.0).max(min_step);
            (velocity - v_prev) / span
        });

        let base = self.base_uncertainty(&velocities);
        let latest = points[n - 1].1;
        let forecast = horizons
            .iter()
            .map(|&h| forecast_band(latest, velocity, base, h))
            .collect();

        Ok(TrendReport {
            entity_id: series.entity_id().to_string(),
            points: raw_points,
            latest_score: latest,
            direction: self.classify(velocity),
            velocity,
            acceleration,
            base_uncertainty: base,
            forecast,
        })
    }

    /// Dead-zone classification of a velocity.
    pub fn classify(&self, velocity: f64) -> TrendDirection {
        if velocity.abs() < self.params.dead_zone_per_day {
            TrendDirection::Stable
        } else if velocity > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        }
    }

    fn base_uncertainty(&self, velocities: &[f64]) -> f64 {
        let configured = self.params.base_uncertainty.max(f64::EPSILON);
        if velocities.len() < 2 {
            return configured;
        }
        let mean = velocities.iter().sum::<f64>() / velocities.len() as f64;
        let var = velocities.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (velocities.len() - 1) as f64;
        configured + var.sqrt()
    }
}

/// Merge runs of points less than `min_step` days apart, measured from the
/// first point of the run.
fn collapse(points: &[(f64, f64)], min_step: f64) -> Vec<(f64, f64)> {
    let mut out: Vec<(f64, f64)> = Vec::with_capacity(points.len());
    for &(at, score) in points {
        match out.last_mut() {
            Some(last) if at - last.0 < min_step => last.1 = score,
            _ => out.push((at, score)),
        }
    }
    out
}

/// Linear extrapolation with a band widening as `base·sqrt(H)`. The point
/// and band edges are clamped to the score range; `half_width` is not.
pub fn forecast_band(latest: f64, velocity: f64, base: f64, horizon_days: f64) -> ForecastBand {
    let h = horizon_days.max(0.0);
    let point = latest + velocity * h;
    let half_width = base * h.sqrt();
    ForecastBand {
        horizon_days: h,
        point: point.clamp(0.0, 100.0),
        lower: (point - half_width).clamp(0.0, 100.0),
        upper: (point + half_width).clamp(0.0, 100.0),
        half_width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trend::series::fixtures::point;
    use chrono::{Duration, Utc};

    fn series(scores: &[f64]) -> TrendSeries {
        let t0 = Utc::now() - Duration::days(scores.len() as i64);
        TrendSeries::from_snapshots(
            "store-1",
            scores
                .iter()
                .enumerate()
                .map(|(i, &s)| point(t0 + Duration::days(i as i64), s)),
        )
    }

    fn analyzer() -> TrendAnalyzer {
        TrendAnalyzer::new(TrendParams::default())
    }

    #[test]
    fn increasing_series_is_up() {
        let report = analyzer().analyze(&series(&[50.0, 52.0, 54.5, 57.0])).unwrap();
        assert_eq!(report.direction, TrendDirection::Up);
        assert!(report.velocity > 0.0);
        assert!((report.velocity - 2.5).abs() < 1e-9);
    }

    #[test]
    fn decreasing_series_is_down() {
        let report = analyzer().analyze(&series(&[70.0, 66.0, 61.0])).unwrap();
        assert_eq!(report.direction, TrendDirection::Down);
        assert!(report.velocity < 0.0);
    }

    #[test]
    fn noise_inside_dead_zone_is_stable() {
        let report = analyzer().analyze(&series(&[60.0, 60.3, 60.1])).unwrap();
        assert_eq!(report.direction, TrendDirection::Stable);
    }

    #[test]
    fn acceleration_needs_three_points() {
        let two = analyzer().analyze(&series(&[50.0, 52.0])).unwrap();
        assert!(two.acceleration.is_none());

        let three = analyzer().analyze(&series(&[50.0, 51.0, 54.0])).unwrap();
        // velocities 1 then 3 over one-day steps
        assert!((three.acceleration.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn fewer_than_two_points_is_insufficient() {
        let err = analyzer().analyze(&series(&[50.0])).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientData {
                required: 2,
                available: 1
            }
        );
        assert!(analyzer().analyze(&TrendSeries::new("store-1")).is_err());
    }

    #[test]
    fn near_simultaneous_points_are_merged() {
        let t0 = Utc::now() - Duration::days(2);
        let s = TrendSeries::from_snapshots(
            "store-1",
            vec![
                point(t0, 60.0),
                point(t0 + Duration::days(1), 60.0),
                point(t0 + Duration::days(1) + Duration::seconds(10), 60.3),
            ],
        );
        let report = analyzer().analyze(&s).unwrap();
        assert_eq!(report.points, 3);
        assert!((report.velocity - 0.3).abs() < 1e-9);
        assert_eq!(report.direction, TrendDirection::Stable);
        assert!(report.acceleration.is_none());
        assert!((report.latest_score - 60.3).abs() < 1e-12);
    }

    #[test]
    fn a_single_burst_is_insufficient() {
        let t0 = Utc::now();
        let s = TrendSeries::from_snapshots(
            "store-1",
            vec![point(t0, 60.0), point(t0 + Duration::seconds(5), 61.0)],
        );
        let err = analyzer().analyze(&s).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientData {
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn band_collapses_at_zero_and_widens_strictly() {
        let at_zero = forecast_band(60.0, 1.0, 1.5, 0.0);
        assert_eq!(at_zero.half_width, 0.0);
        assert_eq!(at_zero.lower, at_zero.point);
        assert_eq!(at_zero.upper, at_zero.point);

        let mut prev = at_zero.half_width;
        for h in 1..=60 {
            let band = forecast_band(60.0, 1.0, 1.5, h as f64 * 0.5);
            assert!(band.half_width > prev);
            prev = band.half_width;
        }
    }

    #[test]
    fn forecast_extrapolates_last_velocity() {
        let report = analyzer()
            .analyze_with_horizons(&series(&[50.0, 52.0]), &[0.0, 5.0])
            .unwrap();
        assert!((report.forecast[0].point - 52.0).abs() < 1e-9);
        assert!((report.forecast[1].point - 62.0).abs() < 1e-9);
        assert!((report.forecast[1].half_width - 5.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn forecast_is_clamped_to_score_range() {
        let band = forecast_band(98.0, 3.0, 1.0, 10.0);
        assert_eq!(band.point, 100.0);
        assert_eq!(band.upper, 100.0);
    }
}
