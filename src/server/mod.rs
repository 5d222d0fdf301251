//! HTTP surface: status snapshots, the SSE event stream, and the small set of
//! driver/operator controls (boost, departure times, manual SoC, reserve
//! floor mode). Handlers only read `StateStore::snapshot()` plus the shared
//! handles; the decision loop stays the single writer.
//!
//! With critical config issues every route serves the issue list with 503 and
//! the decision loop never starts.

pub mod error;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ConfigIssue;
use crate::domain::ChargeMode;
use crate::engine::EngineHandles;
use crate::overrides::OverrideSource;
use error::ApiError;

#[derive(Clone)]
struct ApiState {
    handles: EngineHandles,
}

/// Router for normal operation.
pub fn router(handles: EngineHandles) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/events", get(events))
        .route("/api/override", get(override_status))
        .route("/api/boost/:vehicle", post(boost))
        .route("/api/boost", delete(cancel_boost))
        .route("/api/departure/:vehicle", post(set_departure))
        .route("/api/soc/:vehicle", post(set_manual_soc))
        .route("/api/vehicles", get(vehicles))
        .route("/api/buffer/events", get(buffer_events))
        .route("/api/buffer/activate-live", post(buffer_activate_live))
        .route("/api/buffer/extend-observation", post(buffer_extend))
        .route("/api/learning", get(learning))
        .with_state(ApiState { handles })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Router served instead when critical config issues block startup.
pub fn error_router(issues: Vec<ConfigIssue>) -> Router {
    let issues = Arc::new(issues);
    Router::new().fallback(move || {
        let issues = Arc::clone(&issues);
        async move {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "Konfigurationsfehler - Dispatcher nicht gestartet",
                    "issues": issues.as_slice(),
                })),
            )
        }
    })
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(app): State<ApiState>) -> impl IntoResponse {
    Json(app.handles.store.snapshot())
}

/// One SSE event per published cycle. Closed connections are pruned by the
/// broadcast path on the next update; there is no replay of missed events.
async fn events(
    State(app): State<ApiState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (_id, rx) = app.handles.store.register_subscriber();
    let stream = ReceiverStream::new(rx).map(|snapshot| {
        let event = Event::default()
            .event("state")
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().event("state").data("{}"));
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn override_status(State(app): State<ApiState>) -> impl IntoResponse {
    Json(app.handles.overrides.status())
}

async fn boost(
    State(app): State<ApiState>,
    Path(vehicle): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if app.handles.registry.get(&vehicle).is_none() {
        return Err(ApiError::NotFound(format!("unbekanntes Fahrzeug: {vehicle}")));
    }
    let result = app.handles.overrides.activate(&vehicle, OverrideSource::Dashboard);
    if result.ok {
        // Flip the loadpoint to full power immediately; the loop keeps it
        // there for the override's lifetime.
        if let Err(e) = app.handles.evcc.set_loadpoint_mode(0, ChargeMode::Now).await {
            tracing::warn!(error = %e, "boost mode push failed");
        }
    }
    Ok(Json(result))
}

async fn cancel_boost(State(app): State<ApiState>) -> impl IntoResponse {
    match app.handles.overrides.cancel() {
        Some(vehicle) => Json(json!({ "ok": true, "cancelled": vehicle })),
        None => Json(json!({ "ok": false, "message": "Kein aktiver Override" })),
    }
}

#[derive(Debug, Deserialize)]
struct DepartureBody {
    departure: String,
}

async fn set_departure(
    State(app): State<ApiState>,
    Path(vehicle): Path<String>,
    Json(body): Json<DepartureBody>,
) -> Result<impl IntoResponse, ApiError> {
    let departure: DateTime<Utc> = DateTime::parse_from_rfc3339(&body.departure)
        .map_err(|e| ApiError::BadRequest(format!("ungueltige Abfahrtszeit: {e}")))?
        .with_timezone(&Utc);
    if departure <= Utc::now() {
        return Err(ApiError::BadRequest("Abfahrtszeit liegt in der Vergangenheit".to_string()));
    }
    app.handles.departures.set_departure(&vehicle, departure);
    Ok(Json(json!({ "ok": true, "vehicle": vehicle, "departure": departure })))
}

#[derive(Debug, Deserialize)]
struct SocBody {
    soc: f64,
}

async fn set_manual_soc(
    State(app): State<ApiState>,
    Path(vehicle): Path<String>,
    Json(body): Json<SocBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !(0.0..=100.0).contains(&body.soc) {
        return Err(ApiError::BadRequest(format!("SoC ausserhalb 0-100: {}", body.soc)));
    }
    if !app.handles.registry.set_manual_soc(&vehicle, body.soc) {
        return Err(ApiError::NotFound(format!("unbekanntes Fahrzeug: {vehicle}")));
    }
    Ok(Json(json!({ "ok": true, "vehicle": vehicle, "soc": body.soc })))
}

async fn vehicles(State(app): State<ApiState>) -> impl IntoResponse {
    let now = Utc::now();
    let vehicles: Vec<serde_json::Value> = app
        .handles
        .registry
        .all()
        .into_iter()
        .map(|v| {
            let stale = v.is_stale(now);
            json!({
                "name": v.name,
                "provider": v.provider_type,
                "capacity_kwh": v.capacity_kwh,
                "soc": v.effective_soc(),
                "manual_soc": v.manual_soc,
                "connected": v.connected,
                "charging": v.charging,
                "stale": stale,
                "last_update": v.last_update,
            })
        })
        .collect();
    Json(vehicles)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_count")]
    count: usize,
}

fn default_event_count() -> usize {
    100
}

async fn buffer_events(
    State(app): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    Json(app.handles.buffer.recent_events(query.count.min(700)))
}

async fn buffer_activate_live(State(app): State<ApiState>) -> impl IntoResponse {
    app.handles.buffer.activate_live();
    Json(json!({ "ok": true, "mode": "live" }))
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    #[serde(default = "default_extend_days")]
    days: i64,
}

fn default_extend_days() -> i64 {
    14
}

async fn buffer_extend(
    State(app): State<ApiState>,
    Json(body): Json<ExtendBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=90).contains(&body.days) {
        return Err(ApiError::BadRequest(format!("days ausserhalb 1-90: {}", body.days)));
    }
    app.handles.buffer.extend_observation(body.days);
    Ok(Json(json!({ "ok": true, "extended_days": body.days })))
}

async fn learning(State(app): State<ApiState>) -> impl IntoResponse {
    let audit = app.handles.learner.run_audit();
    Json(json!({
        "reaction": app.handles.reaction.stats(),
        "seasonal_cells_populated": app.handles.seasonal.populated_cell_count(),
        "learner": {
            "mode": format!("{:?}", app.handles.learner.mode()).to_lowercase(),
            "epsilon": app.handles.learner.epsilon(),
            "total_steps": app.handles.learner.total_steps(),
            "audit": audit,
        },
    }))
}
