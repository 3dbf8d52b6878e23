// =============================================================================
// Reinforcement Scheduler
// =============================================================================
//
// Time-triggered: every `check_interval_secs` each known tenant gets one
// cycle. Tenants with a pending retune request (from calibration or the
// retune endpoint) get a forced cycle; the rest a scheduled one that only
// runs when due. Tenants are processed one after another; each cycle holds
// only its own tenant's writer lock.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::reinforcement::updater::{CycleOutcome, CycleReport, CycleTrigger, ReinforcementUpdater};

/// Background loop. Never returns.
pub async fn run_scheduler(state: Arc<AppState>) {
    let secs = state.runtime_config.read().reinforcement.check_interval_secs.max(1);
    info!(interval_secs = secs, "reinforcement scheduler starting");

    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
    loop {
        interval.tick().await;
        let reports = run_due_cycles(&state, Utc::now()).await;
        debug!(tenants = reports.len(), "reinforcement pass complete");
    }
}

/// One pass over every tenant in the weight store.
pub async fn run_due_cycles(state: &AppState, now: DateTime<Utc>) -> Vec<CycleReport> {
    let updater = ReinforcementUpdater::new(state.runtime_config.read().reinforcement.clone());
    let mut reports = Vec::new();

    for tenant in state.weight_store.tenants() {
        let trigger = if state.take_retune(&tenant) {
            CycleTrigger::Forced
        } else {
            CycleTrigger::Scheduled
        };
        reports.push(run_one(state, &updater, &tenant, trigger, now).await);
    }
    reports
}

/// Run a forced cycle for one tenant now.
pub async fn trigger_cycle(state: &AppState, tenant: &str) -> Result<CycleReport, EngineError> {
    state.weights(tenant)?;
    let updater = ReinforcementUpdater::new(state.runtime_config.read().reinforcement.clone());
    Ok(run_one(state, &updater, tenant, CycleTrigger::Forced, Utc::now()).await)
}

/// Run and record one cycle. A forced cycle that aborts keeps its retune
/// request pending for the next pass.
async fn run_one(
    state: &AppState,
    updater: &ReinforcementUpdater,
    tenant: &str,
    trigger: CycleTrigger,
    now: DateTime<Utc>,
) -> CycleReport {
    let resume = state.checkpoint(tenant);
    let report = updater
        .run_cycle(&state.weight_store, state, tenant, trigger, now, resume)
        .await;
    if trigger == CycleTrigger::Forced && matches!(report.outcome, CycleOutcome::Aborted { .. }) {
        debug!(tenant = %tenant, "forced cycle aborted, retune stays pending");
        state.request_retune(tenant);
    }
    state.record_cycle(report.clone());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::fixtures::state;
    use crate::reinforcement::observation::fixtures::observation;
    use crate::scoring::WriterRetry;
    use chrono::Duration;

    #[tokio::test]
    async fn fresh_tenants_are_not_due() {
        let state = state();
        let reports = run_due_cycles(&state, Utc::now()).await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, CycleOutcome::NotDue { .. }));
        assert!(state.cycle_status("demo").is_some());
    }

    #[tokio::test]
    async fn retune_request_forces_a_cycle() {
        let state = state();
        let seeded_at = state.weights("demo").unwrap().last_update();
        let received = seeded_at + Duration::seconds(1);
        state
            .record_outcomes("demo", vec![observation(1.0, 1.3), observation(2.0, 2.2)], received)
            .unwrap();
        state.request_retune("demo");

        let now = seeded_at + Duration::seconds(2);
        let reports = run_due_cycles(&state, now).await;
        assert_eq!(reports[0].trigger, CycleTrigger::Forced);
        assert_eq!(reports[0].committed_version(), Some(2));
        assert_eq!(state.weights("demo").unwrap().version(), 2);
        assert!(!state.take_retune("demo"));

        // the same outcomes are never applied twice
        state.request_retune("demo");
        let reports = run_due_cycles(&state, now + Duration::seconds(1)).await;
        assert_eq!(reports[0].outcome, CycleOutcome::NoObservations);
        assert_eq!(state.weights("demo").unwrap().version(), 2);
    }

    #[tokio::test]
    async fn aborted_forced_cycle_keeps_the_retune_pending() {
        let state = state();
        state.runtime_config.write().reinforcement.writer_retry_attempts = 1;
        let held = state
            .weight_store
            .writer(
                "demo",
                WriterRetry {
                    attempts: 1,
                    base_delay_ms: 1,
                },
            )
            .await
            .unwrap();
        state.request_retune("demo");

        let reports = run_due_cycles(&state, Utc::now()).await;
        match &reports[0].outcome {
            CycleOutcome::Aborted { kind, .. } => assert_eq!(kind, "writer_busy"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.retune_requests.read().contains("demo"));

        drop(held);
        let reports = run_due_cycles(&state, Utc::now()).await;
        assert_eq!(reports[0].trigger, CycleTrigger::Forced);
        assert_eq!(reports[0].outcome, CycleOutcome::NoObservations);
        assert!(!state.retune_requests.read().contains("demo"));
    }

    #[tokio::test]
    async fn trigger_cycle_rejects_unknown_tenant() {
        let state = state();
        let err = trigger_cycle(&state, "ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
