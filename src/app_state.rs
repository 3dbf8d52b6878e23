// =============================================================================
// Central Application State — Pulse Engine
// =============================================================================
//
// The single source of truth for the service. Handlers and the reinforcement
// scheduler hold an `Arc<AppState>`; everything mutable lives behind the
// locks below and every meaningful mutation bumps `state_version`.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections; no guard is
//     ever held across an `.await`.
//   - WeightSets live in the `WeightStore`, whose readers never wait on a
//     reinforcement cycle.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::calibration::{CalibrationEvaluator, CalibrationReport};
use crate::error::{check_range, EngineError};
use crate::reinforcement::{
    CycleCheckpoint, CycleOutcome, CycleReport, OutcomeBuffer, OutcomeObservation, OutcomeSource,
};
use crate::runtime_config::RuntimeConfig;
use crate::scoring::{CompositeScorer, ScoreSnapshot, WeightSet, WeightStore};
use crate::signals::{RawSignalPayload, SignalNormalizer, SignalVector};
use crate::simulation::ScenarioSimulator;
use crate::trend::{TrendAnalyzer, TrendReport, TrendSeries};
use crate::types::{EntityId, TenantId};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Machine-readable error kind (e.g. `writer_busy`).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// Entity History
// =============================================================================

/// Latest normalized vector plus every score computed for one entity.
#[derive(Debug, Clone)]
pub struct EntityHistory {
    pub latest: SignalVector,
    pub series: TrendSeries,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of snapshots retained per entity.
const MAX_SERIES_POINTS: usize = 5_000;

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Weights ─────────────────────────────────────────────────────────
    pub weight_store: Arc<WeightStore>,

    // ── Signals & scores ────────────────────────────────────────────────
    pub entities: RwLock<HashMap<TenantId, HashMap<EntityId, EntityHistory>>>,

    // ── Outcomes & reinforcement ────────────────────────────────────────
    pub outcomes: RwLock<HashMap<TenantId, OutcomeBuffer>>,
    /// Tenants whose next scheduler pass runs a forced cycle.
    pub retune_requests: RwLock<HashSet<TenantId>>,
    pub cycle_status: RwLock<HashMap<TenantId, CycleReport>>,
    /// Checkpoints of cycles whose commit failed, resumed by the next cycle.
    pub checkpoints: RwLock<HashMap<TenantId, CycleCheckpoint>>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the state and seed every configured tenant with the default
    /// WeightSet (tenants already present in `store` keep their history).
    pub fn new(config: RuntimeConfig, store: WeightStore) -> Result<Self, EngineError> {
        let now = Utc::now();
        for tenant in &config.tenants {
            store.seed(tenant, WeightSet::initial(&config.default_weights, now)?)?;
        }

        Ok(Self {
            state_version: AtomicU64::new(0),
            runtime_config: Arc::new(RwLock::new(config)),
            weight_store: Arc::new(store),
            entities: RwLock::new(HashMap::new()),
            outcomes: RwLock::new(HashMap::new()),
            retune_requests: RwLock::new(HashSet::new()),
            cycle_status: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Tenants ─────────────────────────────────────────────────────────

    /// Latest weights for `tenant`, seeding the defaults on first contact.
    pub fn ensure_tenant(&self, tenant: &str) -> Result<Arc<WeightSet>, EngineError> {
        if let Some(latest) = self.weight_store.latest(tenant) {
            return Ok(latest);
        }
        let initial = WeightSet::initial(&self.runtime_config.read().default_weights, Utc::now())?;
        self.weight_store.seed(tenant, initial)
    }

    pub fn weights(&self, tenant: &str) -> Result<Arc<WeightSet>, EngineError> {
        self.weight_store
            .latest(tenant)
            .ok_or_else(|| EngineError::NotFound(format!("tenant `{tenant}`")))
    }

    // ── Signals & scoring ───────────────────────────────────────────────

    /// Normalize a raw payload, score it under the tenant's latest weights
    /// and append the snapshot to the entity's series.
    pub fn ingest_signals(
        &self,
        tenant: &str,
        entity: &str,
        payload: &RawSignalPayload,
        now: DateTime<Utc>,
    ) -> Result<ScoreSnapshot, EngineError> {
        let (normalizer, scorer) = {
            let config = self.runtime_config.read();
            (
                SignalNormalizer::new(config.normalizer.clone()),
                CompositeScorer::from_config(&config),
            )
        };
        let weights = self.ensure_tenant(tenant)?;

        let mut entities = self.entities.write();
        let histories = entities.entry(tenant.to_string()).or_default();
        let prior = histories.get(entity).map(|h| &h.latest);
        let vector = normalizer.normalize(entity, payload, prior, now)?;
        let snapshot = scorer.score(&vector, &weights, now);

        match histories.get_mut(entity) {
            Some(history) => {
                if vector.recorded_at() >= history.latest.recorded_at() {
                    history.latest = vector;
                }
                history.series.push(snapshot.clone());
                history.series.retain_latest(MAX_SERIES_POINTS);
            }
            None => {
                let mut series = TrendSeries::new(entity);
                series.push(snapshot.clone());
                histories.insert(
                    entity.to_string(),
                    EntityHistory {
                        latest: vector,
                        series,
                    },
                );
            }
        }
        drop(entities);

        self.increment_version();
        Ok(snapshot)
    }

    pub fn latest_vector(&self, tenant: &str, entity: &str) -> Option<SignalVector> {
        self.entities
            .read()
            .get(tenant)
            .and_then(|m| m.get(entity))
            .map(|h| h.latest.clone())
    }

    fn series(&self, tenant: &str, entity: &str) -> Option<TrendSeries> {
        self.entities
            .read()
            .get(tenant)
            .and_then(|m| m.get(entity))
            .map(|h| h.series.clone())
    }

    /// Re-score the entity's latest vector with today's weights and
    /// freshness.
    pub fn current_score(&self, tenant: &str, entity: &str, now: DateTime<Utc>) -> Result<ScoreSnapshot, EngineError> {
        let vector = self
            .latest_vector(tenant, entity)
            .ok_or_else(|| EngineError::NotFound(format!("entity `{entity}` in tenant `{tenant}`")))?;
        let weights = self.weights(tenant)?;
        let scorer = CompositeScorer::from_config(&self.runtime_config.read());
        Ok(scorer.score(&vector, &weights, now))
    }

    /// Trend over the last `days`. `horizon` replaces the configured
    /// forecast horizons with a single one.
    pub fn trend(
        &self,
        tenant: &str,
        entity: &str,
        days: i64,
        horizon: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<TrendReport, EngineError> {
        let params = self.runtime_config.read().trend.clone();
        let days = check_range("days", days, params.min_days, params.max_days)?;
        let horizon = horizon
            .map(|h| check_range("horizon", h, 0, params.max_days))
            .transpose()?;

        let series = self
            .series(tenant, entity)
            .ok_or_else(|| EngineError::NotFound(format!("entity `{entity}` in tenant `{tenant}`")))?;
        let window = series.since(now - Duration::days(days));

        let analyzer = TrendAnalyzer::new(params);
        match horizon {
            Some(h) => analyzer.analyze_with_horizons(&window, &[h as f64]),
            None => analyzer.analyze(&window),
        }
    }

    /// Baseline for a scenario: `raw` normalized against the entity's latest
    /// vector when given, else the latest vector itself.
    pub fn scenario_inputs(
        &self,
        tenant: &str,
        entity: &str,
        raw: Option<&RawSignalPayload>,
        now: DateTime<Utc>,
    ) -> Result<(SignalVector, Arc<WeightSet>, ScenarioSimulator), EngineError> {
        let weights = self.weights(tenant)?;
        let prior = self.latest_vector(tenant, entity);
        let (normalizer, simulator) = {
            let config = self.runtime_config.read();
            (
                SignalNormalizer::new(config.normalizer.clone()),
                ScenarioSimulator::new(config.simulation.clone()),
            )
        };
        let baseline = match (raw, prior) {
            (Some(raw), prior) => normalizer.normalize(entity, raw, prior.as_ref(), now)?,
            (None, Some(prior)) => prior,
            (None, None) => {
                return Err(EngineError::NotFound(format!(
                    "no signals recorded for entity `{entity}`; supply a baseline"
                )))
            }
        };
        Ok((baseline, weights, simulator))
    }

    // ── Outcomes & calibration ──────────────────────────────────────────

    /// Validate and buffer a batch. Nothing is stored unless every
    /// observation is valid.
    pub fn record_outcomes(
        &self,
        tenant: &str,
        observations: Vec<OutcomeObservation>,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        for (i, o) in observations.iter().enumerate() {
            o.validate().map_err(|e| match e {
                EngineError::InvalidObservation { field, reason } => {
                    EngineError::observation(format!("outcomes[{i}].{field}"), reason)
                }
                other => other,
            })?;
        }
        self.ensure_tenant(tenant)?;

        let count = observations.len();
        let mut outcomes = self.outcomes.write();
        let buffer = outcomes.entry(tenant.to_string()).or_default();
        for o in observations {
            buffer.push(now, o);
        }
        drop(outcomes);

        self.prune_outcomes(tenant, now);
        self.increment_version();
        Ok(count)
    }

    /// Evict outcomes the updater has already consumed (received at or
    /// before the latest `last_update`) that have also left the longest
    /// calibration window.
    pub fn prune_outcomes(&self, tenant: &str, now: DateTime<Utc>) -> usize {
        let Some(latest) = self.weight_store.latest(tenant) else {
            return 0;
        };
        let max_days = self.runtime_config.read().trend.max_days;
        let mut outcomes = self.outcomes.write();
        let Some(buffer) = outcomes.get_mut(tenant) else {
            return 0;
        };
        let dropped = buffer.prune(latest.last_update(), now - Duration::days(max_days));
        if buffer.is_empty() {
            outcomes.remove(tenant);
        }
        if dropped > 0 {
            debug!(tenant = %tenant, dropped, "expired outcomes evicted");
        }
        dropped
    }

    /// Calibration over outcomes observed in the last `days`. A report that
    /// asks for a retune queues a forced reinforcement cycle.
    pub fn calibration(&self, tenant: &str, days: i64, now: DateTime<Utc>) -> Result<CalibrationReport, EngineError> {
        let (min, max, params) = {
            let config = self.runtime_config.read();
            (config.trend.min_days, config.trend.max_days, config.calibration.clone())
        };
        let days = check_range("days", days, min, max)?;
        self.weights(tenant)?;

        let observations = self
            .outcomes
            .read()
            .get(tenant)
            .map(|b| b.observed_since(now - Duration::days(days)))
            .unwrap_or_default();

        let report = CalibrationEvaluator::new(params).evaluate(&observations, now);
        if report.retune_requested {
            info!(tenant = %tenant, lift_at_10 = report.lift_at_10, "calibration requested a retune");
            self.request_retune(tenant);
        }
        Ok(report)
    }

    // ── Reinforcement bookkeeping ───────────────────────────────────────

    pub fn request_retune(&self, tenant: &str) {
        self.retune_requests.write().insert(tenant.to_string());
    }

    /// Consume a pending retune request.
    pub fn take_retune(&self, tenant: &str) -> bool {
        self.retune_requests.write().remove(tenant)
    }

    /// Store a cycle's report. A commit clears any pending checkpoint and
    /// frees consumed outcomes; a failed commit leaves its checkpoint for
    /// the next cycle.
    pub fn record_cycle(&self, report: CycleReport) {
        match &report.outcome {
            CycleOutcome::Aborted { kind, reason } => {
                self.push_error_with_code(
                    format!("reinforcement cycle for `{}` aborted: {reason}", report.tenant),
                    Some(kind.clone()),
                );
                if let Some(checkpoint) = &report.checkpoint {
                    self.checkpoints
                        .write()
                        .insert(report.tenant.clone(), checkpoint.clone());
                }
            }
            CycleOutcome::Committed { .. } => {
                self.checkpoints.write().remove(&report.tenant);
                self.prune_outcomes(&report.tenant, report.finished_at);
            }
            CycleOutcome::NotDue { .. } | CycleOutcome::NoObservations => {}
        }
        self.cycle_status.write().insert(report.tenant.clone(), report);
        self.increment_version();
    }

    pub fn checkpoint(&self, tenant: &str) -> Option<CycleCheckpoint> {
        self.checkpoints.read().get(tenant).cloned()
    }

    pub fn cycle_status(&self, tenant: &str) -> Option<CycleReport> {
        self.cycle_status.read().get(tenant).cloned()
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn build_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            tenants: self.weight_store.tenants(),
            pending_retunes: self.retune_requests.read().len(),
            buffered_outcomes: self.outcomes.read().values().map(OutcomeBuffer::len).sum(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

impl OutcomeSource for AppState {
    async fn gather(&self, tenant: &str, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<OutcomeObservation> {
        self.outcomes
            .read()
            .get(tenant)
            .map(|b| b.received_between(after, until))
            .unwrap_or_default()
    }
}

/// Service status for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub tenants: Vec<TenantId>,
    pub pending_retunes: usize,
    pub buffered_outcomes: usize,
    pub recent_errors: Vec<ErrorRecord>,
}
