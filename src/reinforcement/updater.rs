// =============================================================================
// Reinforcement Weight Updater: one cycle per tenant under its writer lock
// =============================================================================
//
// POLICY: update-cycle faults never propagate. A cycle that cannot finish
// (writer contention, stalled observation gather, NaN or negative weights)
// is logged, reported as `CycleOutcome::Aborted`, and the previous WeightSet
// stays authoritative. Observations are not consumed by an aborted cycle, so
// the next one retries them.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::reinforcement::cycle::{CycleCheckpoint, CycleMachine, Phase, RecalibrationCounts};
use crate::reinforcement::observation::OutcomeSource;
use crate::runtime_config::ReinforcementParams;
use crate::scoring::{WeightStore, WriterRetry};
use crate::types::TenantId;

// ---------------------------------------------------------------------------
// Cycle results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// Periodic wake-up; runs only when the update cycle is due.
    Scheduled,
    /// Operator or calibration request; skips the due check.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    NotDue {
        next_due: DateTime<Utc>,
    },
    NoObservations,
    Committed {
        version: u64,
        max_step: f64,
        observations: usize,
        recalibration: RecalibrationCounts,
    },
    Aborted {
        kind: String,
        reason: String,
    },
}

/// Summary of one cycle attempt, kept per tenant for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub tenant: TenantId,
    pub trigger: CycleTrigger,
    /// Phase the machine was in when the cycle ended.
    pub last_phase: Phase,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Computed but uncommitted step, left behind when the commit failed.
    /// Passing it to the next `run_cycle` finishes the cycle without
    /// gathering again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CycleCheckpoint>,
}

impl CycleReport {
    pub fn committed_version(&self) -> Option<u64> {
        match self.outcome {
            CycleOutcome::Committed { version, .. } => Some(version),
            _ => None,
        }
    }
}

/// How far a cycle got; survives an early `?` return.
#[derive(Default)]
struct Progress {
    phase: Phase,
    checkpoint: Option<CycleCheckpoint>,
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

pub struct ReinforcementUpdater {
    params: ReinforcementParams,
}

impl ReinforcementUpdater {
    pub fn new(params: ReinforcementParams) -> Self {
        Self { params }
    }

    pub fn retry(&self) -> WriterRetry {
        WriterRetry {
            attempts: self.params.writer_retry_attempts,
            base_delay_ms: self.params.writer_retry_base_ms,
        }
    }

    /// Run one reinforcement cycle for `tenant`.
    ///
    /// # Arguments
    /// * `store`   — weight store; the tenant's writer lock is held for the
    ///   whole cycle.
    /// * `source`  — outcome feed, read for observations received after the
    ///   current version's `last_update` and no later than `now`.
    /// * `trigger` — `Forced` bypasses the Idle due check.
    /// * `now`     — cycle clock; upper bound of the gather window and the new
    ///   version's `last_update`.
    /// * `resume`  — checkpoint from an earlier failed commit. Used only while
    ///   its base version is still the latest; its own clock then replaces
    ///   `now`.
    pub async fn run_cycle<S: OutcomeSource>(
        &self,
        store: &WeightStore,
        source: &S,
        tenant: &str,
        trigger: CycleTrigger,
        now: DateTime<Utc>,
        resume: Option<CycleCheckpoint>,
    ) -> CycleReport {
        let started_at = Utc::now();
        let mut progress = Progress::default();

        let outcome = match self
            .drive(store, source, tenant, trigger, now, resume, &mut progress)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    phase = %progress.phase,
                    kind = e.kind(),
                    resumable = progress.checkpoint.is_some(),
                    error = %e,
                    "reinforcement cycle aborted"
                );
                CycleOutcome::Aborted {
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                }
            }
        };

        CycleReport {
            tenant: tenant.to_string(),
            trigger,
            last_phase: progress.phase,
            outcome,
            started_at,
            finished_at: Utc::now(),
            checkpoint: progress.checkpoint,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<S: OutcomeSource>(
        &self,
        store: &WeightStore,
        source: &S,
        tenant: &str,
        trigger: CycleTrigger,
        now: DateTime<Utc>,
        resume: Option<CycleCheckpoint>,
        progress: &mut Progress,
    ) -> Result<CycleOutcome, EngineError> {
        let writer = store.writer(tenant, self.retry()).await?;
        let current = writer.current();

        let resumable = resume.filter(|cp| {
            cp.tenant == tenant && cp.base_version == current.version() && cp.phase == Phase::Reinforcing
        });

        let mut machine = match resumable {
            Some(checkpoint) => {
                info!(
                    tenant = %tenant,
                    base_version = checkpoint.base_version,
                    observations = checkpoint.observations.len(),
                    "resuming reinforcement cycle from checkpoint"
                );
                CycleMachine::resume(checkpoint, self.params.clone())
            }
            None => {
                let mut machine = CycleMachine::new(tenant, &current, self.params.clone(), now);

                // ── Idle ──
                if !machine.wake(&current, now, trigger == CycleTrigger::Forced)? {
                    let next_due =
                        current.last_update() + Duration::days(current.update_cycle_days() as i64);
                    debug!(tenant = %tenant, next_due = %next_due, "reinforcement cycle not due");
                    return Ok(CycleOutcome::NotDue { next_due });
                }

                // ── Observing: (last_update, now] ──
                progress.phase = machine.phase();
                let after_secs = self.params.observation_timeout_secs;
                let observations = tokio::time::timeout(
                    std::time::Duration::from_secs(after_secs),
                    source.gather(tenant, current.last_update(), now),
                )
                .await
                .map_err(|_| EngineError::ObservationTimeout {
                    tenant: tenant.to_string(),
                    after_secs,
                })?;

                if !machine.observe(observations)? {
                    debug!(tenant = %tenant, "no new observations since last cycle");
                    progress.phase = machine.phase();
                    return Ok(CycleOutcome::NoObservations);
                }

                // ── Evaluating / Adapting ──
                progress.phase = machine.phase();
                machine.evaluate(&current)?;
                progress.phase = machine.phase();
                machine.adapt(&current)?;
                machine
            }
        };

        // ── Reinforcing ──
        progress.phase = machine.phase();
        let pending = machine.checkpoint().clone();
        let cutoff = pending.started_at;
        let count = pending.observations.len();
        let next = machine.reinforce(&current, cutoff)?;

        let committed = match writer.commit(next) {
            Ok(committed) => committed,
            Err(e) => {
                progress.checkpoint = Some(pending);
                return Err(e);
            }
        };
        progress.phase = machine.phase();

        let max_step = machine.max_step();
        let recalibration = machine.checkpoint().recalibration;
        info!(
            tenant = %tenant,
            version = committed.version(),
            max_step,
            observations = count,
            minor = recalibration.minor,
            moderate = recalibration.moderate,
            major = recalibration.major,
            "reinforcement cycle committed"
        );

        Ok(CycleOutcome::Committed {
            version: committed.version(),
            max_step,
            observations: count,
            recalibration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reinforcement::observation::fixtures::observation;
    use crate::reinforcement::observation::{OutcomeBuffer, OutcomeObservation};
    use crate::scoring::WeightLedger;
    use crate::runtime_config::WeightDefaults;
    use crate::scoring::WeightSet;
    use crate::types::SignalKey;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};

    /// Hands out one queued batch per gather, after an optional delay.
    struct Batches {
        queue: Mutex<VecDeque<Vec<OutcomeObservation>>>,
        delay_ms: u64,
    }

    impl Batches {
        fn new(batches: Vec<Vec<OutcomeObservation>>, delay_ms: u64) -> Self {
            Self {
                queue: Mutex::new(batches.into()),
                delay_ms,
            }
        }
    }

    impl OutcomeSource for Batches {
        async fn gather(
            &self,
            _tenant: &str,
            _after: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Vec<OutcomeObservation> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            self.queue.lock().pop_front().unwrap_or_default()
        }
    }

    /// Reads a shared intake buffer through the arrival window.
    struct Buffered(Mutex<OutcomeBuffer>);

    impl OutcomeSource for Buffered {
        async fn gather(
            &self,
            _tenant: &str,
            after: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Vec<OutcomeObservation> {
            self.0.lock().received_between(after, until)
        }
    }

    struct Stalled;

    impl OutcomeSource for Stalled {
        async fn gather(
            &self,
            _tenant: &str,
            _after: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Vec<OutcomeObservation> {
            std::future::pending().await
        }
    }

    fn params() -> ReinforcementParams {
        ReinforcementParams {
            writer_retry_attempts: 12,
            writer_retry_base_ms: 1,
            ..ReinforcementParams::default()
        }
    }

    fn due_weights() -> WeightSet {
        WeightSet::initial(&WeightDefaults::default(), Utc::now() - Duration::days(30)).unwrap()
    }

    fn seeded_store() -> WeightStore {
        let store = WeightStore::in_memory();
        store.seed("north", due_weights()).unwrap();
        store
    }

    fn batch(shares: &[(SignalKey, f64)], predicted: f64, actual: f64) -> Vec<OutcomeObservation> {
        let mut o = observation(predicted, actual);
        o.contribution_shares = shares.iter().copied().collect();
        vec![o]
    }

    /// Apply batches one after another without the store or any locking.
    fn serial(start: &WeightSet, batches: &[Vec<OutcomeObservation>]) -> WeightSet {
        let mut current = start.clone();
        for b in batches {
            let mut m = CycleMachine::new("north", &current, params(), Utc::now());
            m.wake(&current, Utc::now(), true).unwrap();
            m.observe(b.clone()).unwrap();
            m.evaluate(&current).unwrap();
            m.adapt(&current).unwrap();
            current = m.reinforce(&current, Utc::now()).unwrap();
        }
        current
    }

    fn close(a: &WeightSet, b: &WeightSet) -> bool {
        a.coefficients()
            .iter()
            .all(|(k, w)| (b.get(*k).unwrap_or(f64::NAN) - w).abs() < 1e-12)
    }

    #[tokio::test]
    async fn scheduled_cycle_commits_when_due() {
        let store = seeded_store();
        let source = Batches::new(vec![batch(&[(SignalKey::Aiv, 1.0)], 1.0, 1.5)], 0);
        let updater = ReinforcementUpdater::new(params());

        let report = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Scheduled, Utc::now(), None)
            .await;
        assert_eq!(report.committed_version(), Some(2));
        assert_eq!(report.last_phase, Phase::Idle);
        assert_eq!(store.latest("north").unwrap().version(), 2);
    }

    #[tokio::test]
    async fn scheduled_cycle_waits_until_due() {
        let store = WeightStore::in_memory();
        store
            .seed("north", WeightSet::initial(&WeightDefaults::default(), Utc::now()).unwrap())
            .unwrap();
        let source = Batches::new(vec![batch(&[], 1.0, 2.0)], 0);
        let updater = ReinforcementUpdater::new(params());

        let report = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Scheduled, Utc::now(), None)
            .await;
        assert!(matches!(report.outcome, CycleOutcome::NotDue { .. }));

        let report = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Forced, Utc::now(), None)
            .await;
        assert_eq!(report.committed_version(), Some(2));
    }

    #[tokio::test]
    async fn empty_gather_commits_nothing() {
        let store = seeded_store();
        let updater = ReinforcementUpdater::new(params());
        let report = updater
            .run_cycle(&store, &Batches::new(vec![], 0), "north", CycleTrigger::Forced, Utc::now(), None)
            .await;
        assert_eq!(report.outcome, CycleOutcome::NoObservations);
        assert_eq!(store.latest("north").unwrap().version(), 1);
    }

    #[tokio::test]
    async fn stalled_gather_times_out_and_keeps_weights() {
        let store = seeded_store();
        let updater = ReinforcementUpdater::new(ReinforcementParams {
            observation_timeout_secs: 0,
            ..params()
        });
        let report = updater
            .run_cycle(&store, &Stalled, "north", CycleTrigger::Forced, Utc::now(), None)
            .await;
        match &report.outcome {
            CycleOutcome::Aborted { kind, .. } => assert_eq!(kind, "observation_timeout"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(report.last_phase, Phase::Observing);
        assert_eq!(store.latest("north").unwrap().version(), 1);
    }

    #[tokio::test]
    async fn negative_weight_aborts_and_previous_version_stays() {
        let store = WeightStore::in_memory();
        let lopsided = WeightSet::new(
            1,
            BTreeMap::from([(SignalKey::Aiv, 0.98), (SignalKey::Ati, 0.02)]),
            Utc::now() - Duration::days(30),
            14,
            0.1,
        )
        .unwrap();
        store.seed("north", lopsided).unwrap();
        let source = Batches::new(
            vec![batch(&[(SignalKey::Aiv, 0.5), (SignalKey::Ati, 0.5)], 500.0, 0.0)],
            0,
        );
        let report = ReinforcementUpdater::new(params())
            .run_cycle(&store, &source, "north", CycleTrigger::Scheduled, Utc::now(), None)
            .await;
        match &report.outcome {
            CycleOutcome::Aborted { kind, .. } => assert_eq!(kind, "weight_update_aborted"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(report.last_phase, Phase::Reinforcing);
        let latest = store.latest("north").unwrap();
        assert_eq!(latest.version(), 1);
        assert_eq!(latest.get(SignalKey::Ati), Some(0.02));
    }

    #[tokio::test]
    async fn contended_writer_is_reported_not_raised() {
        let store = seeded_store();
        let _held = store.writer("north", params_retry()).await.unwrap();
        let updater = ReinforcementUpdater::new(ReinforcementParams {
            writer_retry_attempts: 2,
            ..params()
        });
        let report = updater
            .run_cycle(&store, &Batches::new(vec![], 0), "north", CycleTrigger::Forced, Utc::now(), None)
            .await;
        match &report.outcome {
            CycleOutcome::Aborted { kind, .. } => assert_eq!(kind, "writer_busy"),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn params_retry() -> WriterRetry {
        ReinforcementUpdater::new(params()).retry()
    }

    #[tokio::test]
    async fn concurrent_cycles_serialize_without_lost_update() {
        let store = seeded_store();
        let start = store.latest("north").unwrap();
        let a = batch(&[(SignalKey::Aiv, 0.7), (SignalKey::Ati, 0.3)], 1.0, 1.4);
        let b = batch(&[(SignalKey::ZeroClick, 0.6), (SignalKey::GeoTrust, 0.4)], 2.0, 1.7);
        let source = Batches::new(vec![a.clone(), b.clone()], 10);
        let updater = ReinforcementUpdater::new(params());
        let now = Utc::now();

        let (first, second) = tokio::join!(
            updater.run_cycle(&store, &source, "north", CycleTrigger::Forced, now, None),
            updater.run_cycle(&store, &source, "north", CycleTrigger::Forced, now, None),
        );

        let mut versions = vec![first.committed_version(), second.committed_version()];
        versions.sort();
        assert_eq!(versions, vec![Some(2), Some(3)]);

        let latest = store.latest("north").unwrap();
        assert_eq!(latest.version(), 3);
        let ab = serial(&start, &[a.clone(), b.clone()]);
        let ba = serial(&start, &[b, a]);
        assert!(close(&latest, &ab) || close(&latest, &ba));
        assert_eq!(store.history("north").len(), 3);
    }

    fn committed_observations(report: &CycleReport) -> usize {
        match &report.outcome {
            CycleOutcome::Committed { observations, .. } => *observations,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn outcomes_arriving_after_the_cycle_clock_wait_for_the_next_cycle() {
        let store = seeded_store();
        let updater = ReinforcementUpdater::new(params());
        let t0 = Utc::now();

        let mut buffer = OutcomeBuffer::default();
        buffer.push(t0 - Duration::hours(1), observation(1.0, 1.3));
        buffer.push(t0 + Duration::milliseconds(5), observation(2.0, 2.2));
        let source = Buffered(Mutex::new(buffer));

        let first = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Forced, t0, None)
            .await;
        assert_eq!(first.committed_version(), Some(2));
        assert_eq!(committed_observations(&first), 1);
        assert_eq!(store.latest("north").unwrap().last_update(), t0);

        let t1 = t0 + Duration::milliseconds(10);
        let second = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Forced, t1, None)
            .await;
        assert_eq!(second.committed_version(), Some(3));
        assert_eq!(committed_observations(&second), 1);

        let third = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Forced, t1 + Duration::milliseconds(10), None)
            .await;
        assert_eq!(third.outcome, CycleOutcome::NoObservations);
        assert_eq!(store.latest("north").unwrap().version(), 3);
    }

    #[tokio::test]
    async fn failed_commit_leaves_a_resumable_checkpoint() {
        let dir = std::env::temp_dir().join(format!("pulse-updater-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = WeightStore::open(WeightLedger::new(dir.join("weights.jsonl"))).unwrap();
        store.seed("north", due_weights()).unwrap();
        let updater = ReinforcementUpdater::new(params());

        // ledger directory gone: the append fails at commit time
        std::fs::remove_dir_all(&dir).unwrap();
        let source = Batches::new(vec![batch(&[(SignalKey::Aiv, 1.0)], 1.0, 1.5)], 0);
        let t0 = Utc::now();
        let failed = updater
            .run_cycle(&store, &source, "north", CycleTrigger::Forced, t0, None)
            .await;
        match &failed.outcome {
            CycleOutcome::Aborted { kind, .. } => assert_eq!(kind, "ledger"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(failed.last_phase, Phase::Reinforcing);
        assert_eq!(store.latest("north").unwrap().version(), 1);
        let checkpoint = failed.checkpoint.clone().unwrap();
        assert_eq!(checkpoint.phase, Phase::Reinforcing);
        assert_eq!(checkpoint.started_at, t0);

        // the source has nothing left; the resumed cycle does not gather
        std::fs::create_dir_all(&dir).unwrap();
        let resumed = updater
            .run_cycle(
                &store,
                &source,
                "north",
                CycleTrigger::Scheduled,
                t0 + Duration::minutes(5),
                Some(checkpoint),
            )
            .await;
        assert_eq!(resumed.committed_version(), Some(2));
        assert_eq!(committed_observations(&resumed), 1);
        assert!(resumed.checkpoint.is_none());
        assert_eq!(store.latest("north").unwrap().last_update(), t0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn stale_checkpoint_is_ignored() {
        let store = seeded_store();
        let updater = ReinforcementUpdater::new(params());
        let mut stale = CycleMachine::new("north", &store.latest("north").unwrap(), params(), Utc::now())
            .checkpoint()
            .clone();
        stale.phase = Phase::Reinforcing;
        stale.base_version = 7;

        let report = updater
            .run_cycle(&store, &Batches::new(vec![], 0), "north", CycleTrigger::Forced, Utc::now(), Some(stale))
            .await;
        assert_eq!(report.outcome, CycleOutcome::NoObservations);
        assert_eq!(store.latest("north").unwrap().version(), 1);
    }
}
