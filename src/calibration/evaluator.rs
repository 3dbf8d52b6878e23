// =============================================================================
// Calibration Evaluator: how well predicted ROI tracks realised ROI
// =============================================================================
//
// Bins     equal-count deciles of observations sorted by prediction
// ECE      Σ (count_i / total) · |predicted_avg_i − actual_rate_i|
// Lift@K   mean actual among the top K% predictions / overall mean actual
// Bias     predicted_avg − actual_rate per declared segment tag
//
// Sparse data never fails: any decile with fewer than `min_bin_samples`
// observations sets `low_confidence` and the report is still produced.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::reinforcement::OutcomeObservation;
use crate::runtime_config::CalibrationParams;

const DECILES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationBin {
    /// 1 = lowest predictions.
    pub decile: usize,
    pub count: usize,
    pub predicted_min: f64,
    pub predicted_max: f64,
    pub predicted_avg: f64,
    pub actual_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentBias {
    pub tag: String,
    pub value: String,
    pub count: usize,
    pub predicted_avg: f64,
    pub actual_rate: f64,
    /// Positive means the segment is over-predicted.
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r_squared: f64,
    /// Mean of `actual − predicted`.
    pub mean_residual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    TemperatureScaling,
    IsotonicRecalibration,
    FeatureWeightReview,
    SegmentReview,
    CollectMoreData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub kind: RecommendationKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub total: usize,
    pub bins: Vec<CalibrationBin>,
    pub ece: f64,
    pub lift_at_10: f64,
    pub lift_at_20: f64,
    pub dollar_impact: f64,
    pub bias_by_segment: Vec<SegmentBias>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitMetrics>,
    pub recommendations: Vec<Recommendation>,
    pub low_confidence: bool,
    /// Set when the report asks for a forced reinforcement cycle.
    pub retune_requested: bool,
    pub generated_at: DateTime<Utc>,
}

impl CalibrationReport {
    pub fn recommends(&self, kind: RecommendationKind) -> bool {
        self.recommendations.iter().any(|r| r.kind == kind)
    }
}

pub struct CalibrationEvaluator {
    params: CalibrationParams,
}

impl CalibrationEvaluator {
    pub fn new(params: CalibrationParams) -> Self {
        Self { params }
    }

    pub fn evaluate(&self, observations: &[OutcomeObservation], now: DateTime<Utc>) -> CalibrationReport {
        let mut pairs: Vec<(f64, f64)> = observations
            .iter()
            .map(|o| (o.predicted_roi, o.actual_roi))
            .filter(|(p, a)| p.is_finite() && a.is_finite())
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let total = pairs.len();

        let bins = decile_bins(&pairs);
        let ece = bins
            .iter()
            .map(|b| b.count as f64 / total as f64 * (b.predicted_avg - b.actual_rate).abs())
            .sum::<f64>();
        let low_confidence = bins.len() < DECILES
            || bins.iter().any(|b| b.count < self.params.min_bin_samples);

        let lift_at_10 = lift_at(&pairs, 10.0);
        let lift_at_20 = lift_at(&pairs, 20.0);
        let bias_by_segment = segment_bias(observations);
        let fit = fit_metrics(&pairs);
        let dollar_impact = ece * total as f64 * self.params.value_per_outcome;

        let mut report = CalibrationReport {
            total,
            bins,
            ece,
            lift_at_10,
            lift_at_20,
            dollar_impact,
            bias_by_segment,
            fit,
            recommendations: Vec::new(),
            low_confidence,
            retune_requested: false,
            generated_at: now,
        };
        self.recommend(&mut report);

        if report.low_confidence {
            debug!(total, bins = report.bins.len(), "calibration report is low-confidence");
        }
        report
    }

    fn recommend(&self, report: &mut CalibrationReport) {
        let p = &self.params;
        let mut recs = Vec::new();

        if report.total > 0 && report.ece > p.ece_threshold {
            let (kind, method) = if report.total >= p.isotonic_min_samples {
                (RecommendationKind::IsotonicRecalibration, "isotonic regression")
            } else {
                (RecommendationKind::TemperatureScaling, "temperature scaling")
            };
            recs.push(Recommendation {
                priority: Priority::High,
                kind,
                message: format!(
                    "ECE {:.3} exceeds {:.3}; recalibrate predictions with {method}",
                    report.ece, p.ece_threshold
                ),
            });
        }

        if report.total > 0 && report.lift_at_10 < p.lift_threshold {
            recs.push(Recommendation {
                priority: if report.lift_at_10 < 1.0 {
                    Priority::High
                } else {
                    Priority::Medium
                },
                kind: RecommendationKind::FeatureWeightReview,
                message: format!(
                    "lift@10 {:.2} is below {:.2}; review signal features and weights",
                    report.lift_at_10, p.lift_threshold
                ),
            });
            report.retune_requested = !report.low_confidence;
        }

        for seg in &report.bias_by_segment {
            if seg.bias.abs() > p.segment_bias_threshold {
                let direction = if seg.bias > 0.0 { "over" } else { "under" };
                recs.push(Recommendation {
                    priority: if seg.count >= p.min_bin_samples {
                        Priority::Medium
                    } else {
                        Priority::Low
                    },
                    kind: RecommendationKind::SegmentReview,
                    message: format!(
                        "{}={} is {direction}-predicted by {:.3} across {} outcomes",
                        seg.tag,
                        seg.value,
                        seg.bias.abs(),
                        seg.count
                    ),
                });
            }
        }

        if report.low_confidence {
            recs.push(Recommendation {
                priority: Priority::Low,
                kind: RecommendationKind::CollectMoreData,
                message: format!(
                    "fewer than {} outcomes in some decile; collect more data before acting",
                    p.min_bin_samples
                ),
            });
        }

        recs.sort_by_key(|r| r.priority);
        report.recommendations = recs;
    }
}

/// Equal-count deciles over pairs sorted by prediction. Empty deciles are
/// omitted.
fn decile_bins(sorted: &[(f64, f64)]) -> Vec<CalibrationBin> {
    let n = sorted.len();
    (0..DECILES)
        .filter_map(|i| {
            let bin = &sorted[i * n / DECILES..(i + 1) * n / DECILES];
            if bin.is_empty() {
                return None;
            }
            let count = bin.len();
            Some(CalibrationBin {
                decile: i + 1,
                count,
                predicted_min: bin[0].0,
                predicted_max: bin[count - 1].0,
                predicted_avg: bin.iter().map(|p| p.0).sum::<f64>() / count as f64,
                actual_rate: bin.iter().map(|p| p.1).sum::<f64>() / count as f64,
            })
        })
        .collect()
}

fn lift_at(sorted: &[(f64, f64)], top_pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let overall = sorted.iter().map(|p| p.1).sum::<f64>() / sorted.len() as f64;
    if overall.abs() < f64::EPSILON {
        return 0.0;
    }
    let k = ((sorted.len() as f64 * top_pct / 100.0).ceil() as usize).clamp(1, sorted.len());
    let top = &sorted[sorted.len() - k..];
    let top_rate = top.iter().map(|p| p.1).sum::<f64>() / k as f64;
    top_rate / overall
}

fn segment_bias(observations: &[OutcomeObservation]) -> Vec<SegmentBias> {
    let mut groups: BTreeMap<(&str, &str), (usize, f64, f64)> = BTreeMap::new();
    for o in observations {
        if !o.predicted_roi.is_finite() || !o.actual_roi.is_finite() {
            continue;
        }
        for (tag, value) in &o.segments {
            let g = groups.entry((tag.as_str(), value.as_str())).or_insert((0, 0.0, 0.0));
            g.0 += 1;
            g.1 += o.predicted_roi;
            g.2 += o.actual_roi;
        }
    }
    let mut out: Vec<SegmentBias> = groups
        .into_iter()
        .map(|((tag, value), (count, pred, act))| {
            let predicted_avg = pred / count as f64;
            let actual_rate = act / count as f64;
            SegmentBias {
                tag: tag.to_string(),
                value: value.to_string(),
                count,
                predicted_avg,
                actual_rate,
                bias: predicted_avg - actual_rate,
            }
        })
        .collect();
    out.sort_by(|a, b| b.bias.abs().total_cmp(&a.bias.abs()));
    out
}

fn fit_metrics(pairs: &[(f64, f64)]) -> Option<FitMetrics> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let residuals: Vec<f64> = pairs.iter().map(|(p, a)| a - p).collect();
    let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
    let mean_actual = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let ss_tot: f64 = pairs.iter().map(|p| (p.1 - mean_actual).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };
    Some(FitMetrics {
        rmse: (ss_res / n).sqrt(),
        mae: residuals.iter().map(|r| r.abs()).sum::<f64>() / n,
        r_squared,
        mean_residual: residuals.iter().sum::<f64>() / n,
    })
}
