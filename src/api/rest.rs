// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Read-path errors come back as
// `{"error": kind, "message": text}` with a status derived from the kind.
// Too-little-data is not a failure: trend answers 200 with a degraded body.
//
// CORS is configured permissively; authentication is handled upstream of
// this service.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::reinforcement::{trigger_cycle, CycleReport, OutcomeObservation};
use crate::signals::RawSignalPayload;
use crate::simulation::{validate_actions, ScenarioActionRequest, SimulationOptions};

type ApiError = (StatusCode, Json<serde_json::Value>);

const DEFAULT_WINDOW_DAYS: i64 = 30;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        // ── Entities ────────────────────────────────────────────────
        .route(
            "/api/v1/tenants/:tenant/entities/:entity/signals",
            post(ingest_signals),
        )
        .route("/api/v1/tenants/:tenant/entities/:entity/score", get(current_score))
        .route("/api/v1/tenants/:tenant/entities/:entity/trend", get(trend))
        .route("/api/v1/tenants/:tenant/entities/:entity/scenario", post(scenario))
        // ── Outcomes & calibration ──────────────────────────────────
        .route("/api/v1/tenants/:tenant/outcomes", post(ingest_outcomes))
        .route("/api/v1/tenants/:tenant/calibration", get(calibration))
        // ── Weights & reinforcement ─────────────────────────────────
        .route("/api/v1/tenants/:tenant/weights", get(weights))
        .route("/api/v1/tenants/:tenant/weights/history", get(weight_history))
        .route("/api/v1/tenants/:tenant/weights/retune", post(retune))
        .route("/api/v1/tenants/:tenant/reinforcement", get(reinforcement_status))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Map a domain error onto a status code and the standard error body.
pub fn error_response(err: EngineError) -> ApiError {
    let status = match &err {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InsufficientData { .. } => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": err.kind(),
            "message": err.to_string(),
        })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health())
}

// =============================================================================
// Signals & scores
// =============================================================================

async fn ingest_signals(
    State(state): State<Arc<AppState>>,
    Path((tenant, entity)): Path<(String, String)>,
    Json(payload): Json<RawSignalPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .ingest_signals(&tenant, &entity, &payload, Utc::now())
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

async fn current_score(
    State(state): State<Arc<AppState>>,
    Path((tenant, entity)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .current_score(&tenant, &entity, Utc::now())
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

// =============================================================================
// Trend
// =============================================================================

#[derive(Deserialize)]
struct TrendQuery {
    days: Option<i64>,
    horizon: Option<i64>,
}

async fn trend(
    State(state): State<Arc<AppState>>,
    Path((tenant, entity)): Path<(String, String)>,
    Query(q): Query<TrendQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = q.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    match state.trend(&tenant, &entity, days, q.horizon, Utc::now()) {
        Ok(report) => Ok(Json(json!({ "available": true, "trend": report }))),
        Err(EngineError::InsufficientData { required, available }) => Ok(Json(json!({
            "available": false,
            "degraded": true,
            "message": "not enough data yet for a trend",
            "required_points": required,
            "available_points": available,
        }))),
        Err(e) => Err(error_response(e)),
    }
}

// =============================================================================
// Scenario
// =============================================================================

#[derive(Deserialize)]
struct ScenarioRequest {
    actions: Vec<ScenarioActionRequest>,
    #[serde(default)]
    simulations: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    horizon_days: Option<f64>,
    #[serde(default)]
    seed: Option<u64>,
    /// Raw signals to simulate from instead of the entity's latest vector.
    #[serde(default)]
    baseline: Option<RawSignalPayload>,
}

async fn scenario(
    State(state): State<Arc<AppState>>,
    Path((tenant, entity)): Path<(String, String)>,
    Json(req): Json<ScenarioRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actions = validate_actions(&req.actions).map_err(error_response)?;
    let (baseline, weights, simulator) = state
        .scenario_inputs(&tenant, &entity, req.baseline.as_ref(), Utc::now())
        .map_err(error_response)?;
    let runs = simulator.resolve_runs(req.simulations).map_err(error_response)?;
    let options = SimulationOptions {
        threshold: req.threshold,
        horizon_days: req.horizon_days,
        seed: req.seed,
    };

    let result = tokio::task::spawn_blocking(move || {
        simulator.simulate(&baseline, &actions, &weights, runs, &options)
    })
    .await
    .map_err(|e| {
        warn!(error = %e, "scenario worker failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )
    })?
    .map_err(error_response)?;

    Ok(Json(result))
}

// =============================================================================
// Outcomes & calibration
// =============================================================================

#[derive(Deserialize)]
struct OutcomeBatch {
    outcomes: Vec<OutcomeObservation>,
}

#[derive(Serialize)]
struct OutcomeAck {
    tenant: String,
    accepted: usize,
}

async fn ingest_outcomes(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(batch): Json<OutcomeBatch>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .record_outcomes(&tenant, batch.outcomes, Utc::now())
        .map_err(error_response)?;
    Ok(Json(OutcomeAck { tenant, accepted }))
}

#[derive(Deserialize)]
struct WindowQuery {
    days: Option<i64>,
}

async fn calibration(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Query(q): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .calibration(&tenant, q.days.unwrap_or(DEFAULT_WINDOW_DAYS), Utc::now())
        .map_err(error_response)?;
    Ok(Json(report))
}

// =============================================================================
// Weights & reinforcement
// =============================================================================

async fn weights(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let latest = state.weights(&tenant).map_err(error_response)?;
    Ok(Json(latest))
}

async fn weight_history(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.weights(&tenant).map_err(error_response)?;
    Ok(Json(state.weight_store.history(&tenant)))
}

async fn retune(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!(tenant = %tenant, "forced reinforcement cycle requested via API");
    let report = trigger_cycle(&state, &tenant).await.map_err(error_response)?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct ReinforcementStatus {
    tenant: String,
    weight_version: u64,
    next_due: DateTime<Utc>,
    pending_retune: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_cycle: Option<CycleReport>,
}

async fn reinforcement_status(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let latest = state.weights(&tenant).map_err(error_response)?;
    let pending_retune = state.retune_requests.read().contains(&tenant);
    Ok(Json(ReinforcementStatus {
        weight_version: latest.version(),
        next_due: latest.last_update() + Duration::days(latest.update_cycle_days() as i64),
        pending_retune,
        last_cycle: state.cycle_status(&tenant),
        tenant,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::fixtures::state;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(state()))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn golden() -> Value {
        json!({ "signals": {
            "aiv": 80, "ati": 75, "zero_click": 60, "ugc_health": 70, "geo_trust": 65
        }})
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(&app(), "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tenants"][0], "demo");
    }

    #[tokio::test]
    async fn ingest_then_read_score() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tenants/demo/entities/store-1/signals",
            Some(golden()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["score"].as_f64().unwrap() - 70.25).abs() < 1e-9);
        assert_eq!(body["weight_version"], 1);

        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/entities/store-1/score", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["score"].as_f64().unwrap() - 70.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_signal_is_rejected() {
        let (status, body) = call(
            &app(),
            "POST",
            "/api/v1/tenants/demo/entities/store-1/signals",
            Some(json!({ "signals": { "aiv": "plenty" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_signal");
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let (status, body) = call(&app(), "GET", "/api/v1/tenants/demo/entities/nope/score", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn trend_degrades_instead_of_failing() {
        let app = app();
        call(&app, "POST", "/api/v1/tenants/demo/entities/s/signals", Some(golden())).await;

        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/entities/s/trend?days=30", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], false);
        assert_eq!(body["available_points"], 1);

        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/entities/s/trend?days=400", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_range");
    }

    #[tokio::test]
    async fn scenario_runs_against_latest_signals() {
        let app = app();
        call(&app, "POST", "/api/v1/tenants/demo/entities/s/signals", Some(golden())).await;

        let req = json!({
            "actions": [{ "type": "improve_aiv", "magnitude": 0, "confidence": 0.5, "timeframe_days": 30 }],
            "simulations": 200,
            "seed": 7
        });
        let (status, body) = call(&app, "POST", "/api/v1/tenants/demo/entities/s/scenario", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        let p50 = body["distribution"]["p50"].as_f64().unwrap();
        assert!((p50 - 70.25).abs() < 1e-9);
        assert_eq!(body["runs_completed"], 200);
    }

    #[tokio::test]
    async fn scenario_with_inline_baseline() {
        let req = json!({
            "actions": [{ "type": "improve_ugc", "magnitude": 15, "confidence": 0.85, "timeframe": 90 }],
            "threshold": 72.0,
            "seed": 1,
            "baseline": golden()
        });
        let (status, body) =
            call(&app(), "POST", "/api/v1/tenants/demo/entities/fresh/scenario", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["expected_lift"].as_f64().unwrap() > 0.0);
        assert!(body["probability_exceeds_threshold"].is_number());
    }

    #[tokio::test]
    async fn invalid_scenario_names_the_field() {
        let req = json!({
            "actions": [{ "type": "improve_aiv", "magnitude": 150, "confidence": 0.5, "timeframe_days": 30 }],
            "baseline": golden()
        });
        let (status, body) = call(&app(), "POST", "/api/v1/tenants/demo/entities/s/scenario", Some(req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_scenario");
        assert!(body["message"].as_str().unwrap().contains("actions[0].magnitude"));

        let req = json!({ "actions": [], "baseline": golden() });
        let (status, _) = call(&app(), "POST", "/api/v1/tenants/demo/entities/s/scenario", Some(req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn outcomes_feed_calibration() {
        let app = app();
        let outcomes: Vec<Value> = (1..=40)
            .map(|i| {
                json!({
                    "entity_id": "s",
                    "predicted_roi": i as f64 / 40.0,
                    "actual_roi": i as f64 / 40.0,
                    "segments": { "price_band": "premium" },
                    "observed_at": Utc::now().to_rfc3339(),
                })
            })
            .collect();
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/tenants/demo/outcomes",
            Some(json!({ "outcomes": outcomes })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 40);

        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/calibration?days=30", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 40);
        assert_eq!(body["ece"], 0.0);
        assert_eq!(body["low_confidence"], true);
    }

    #[tokio::test]
    async fn weights_history_and_retune() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/weights", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);

        let (status, body) = call(&app, "POST", "/api/v1/tenants/demo/weights/retune", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "no_observations");
        assert_eq!(body["trigger"], "forced");

        let (status, body) = call(&app, "GET", "/api/v1/tenants/demo/reinforcement", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["weight_version"], 1);
        assert_eq!(body["last_cycle"]["outcome"], "no_observations");

        let (_, body) = call(&app, "GET", "/api/v1/tenants/demo/weights/history", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "GET", "/api/v1/tenants/ghost/weights", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
