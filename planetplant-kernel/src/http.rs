/**
 * API REST PLANETPLANT - Surface HTTP du noyau
 *
 * RÔLE :
 * Expose la surface de requête du noyau (santé, capteurs, arrosage manuel,
 * arrêt de pompe, politique, historiques) aux outils externes : dashboard, CLI, scripts.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, état unique `AppState` (façade + horloge)
 * - Sérialisation JSON automatique des réponses
 * - Refus d'arrosage -> 409 avec la raison structurée, 503 si le broker
 *   est injoignable, 404 capteur inconnu, 400 politique invalide
 *
 * Pas d'authentification : l'API vit derrière le réseau local.
 */

use crate::clock::SharedClock;
use crate::engine::GateReason;
use crate::health::{HealthSnapshot, HealthSummary};
use crate::models::{rfc3339, Device, IrrigationEvent, PolicyPatch, Reading, ValidationError};
use crate::service::SharedPlantService;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct AppState {
    pub service: SharedPlantService,
    pub clock: SharedClock,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(code: StatusCode, error: &str, detail: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": error, "detail": detail.into() })))
}

#[derive(Debug, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub last_seen: Option<String>, // RFC3339 pour l'API
    pub stale_for_seconds: Option<i64>,
    pub moisture_deficient: bool,
}

fn to_view(device: Device, now: OffsetDateTime) -> DeviceView {
    let seen = device.connectivity.last_seen_at;
    DeviceView {
        last_seen: seen.map(rfc3339),
        stale_for_seconds: seen.map(|s| (now - s).whole_seconds().max(0)),
        moisture_deficient: device.is_moisture_deficient(),
        device,
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsParams {
    minutes: Option<i64>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/system/health/history", get(get_health_history))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/policy", put(put_policy))
        .route("/devices/{id}/water", post(water))
        .route("/devices/{id}/stop", post(stop))
        .route("/devices/{id}/events", get(get_events))
        .route("/devices/{id}/readings", get(get_readings))
        .with_state(app_state)
}

// GET /system/health (instantané à la demande)
async fn get_system_health(State(app): State<AppState>) -> Json<HealthSnapshot> {
    Json(app.service.health_snapshot().await)
}

// GET /system/health/history (tendance)
async fn get_health_history(State(app): State<AppState>) -> Json<Vec<HealthSummary>> {
    Json(app.service.health_history())
}

// GET /devices
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    let now = app.clock.now();
    Json(app.service.devices().into_iter().map(|d| to_view(d, now)).collect())
}

// GET /devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<DeviceView>, StatusCode> {
    let Some(device) = app.service.device(&id) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(to_view(device, app.clock.now())))
}

// PUT /devices/{id}/policy (mise à jour partielle)
async fn put_policy(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PolicyPatch>,
) -> Result<Json<DeviceView>, ApiError> {
    match app.service.update_policy(&id, &patch).await {
        Ok(device) => Ok(Json(to_view(device, app.clock.now()))),
        Err(ValidationError::UnknownDevice(id)) => Err(api_error(StatusCode::NOT_FOUND, "unknown_device", id)),
        Err(e) => Err(api_error(StatusCode::BAD_REQUEST, "invalid_policy", e.to_string())),
    }
}

// POST /devices/{id}/water (arrosage manuel)
async fn water(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<IrrigationEvent>, ApiError> {
    match app.service.request_irrigation(&id).await {
        Ok(event) => Ok(Json(event)),
        Err(refused) => {
            let code = match refused.reason {
                GateReason::UnknownDevice => StatusCode::NOT_FOUND,
                GateReason::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::CONFLICT,
            };
            Err((code, Json(json!({ "error": "irrigation_refused", "reason": refused.reason, "event": refused.event }))))
        }
    }
}

// POST /devices/{id}/stop (arrêt immédiat, sans portes de décision)
async fn stop(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    match app.service.stop_irrigation(&id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(refused) if refused.reason == GateReason::UnknownDevice => {
            Err(api_error(StatusCode::NOT_FOUND, "unknown_device", id.clone()))
        }
        Err(refused) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "stop_not_sent", refused.reason.as_str())),
    }
}

// GET /devices/{id}/events?limit=N
async fn get_events(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<EventsParams>,
) -> Json<Vec<IrrigationEvent>> {
    let limit = params.limit.unwrap_or(50).min(500);
    Json(app.service.recent_events(&id, limit))
}

// GET /devices/{id}/readings?minutes=N (défaut : 24h)
async fn get_readings(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let minutes = params.minutes.unwrap_or(24 * 60).clamp(1, 30 * 24 * 60);
    app.service
        .recent_readings(&id, time::Duration::minutes(minutes))
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, "storage_error", e.to_string()))
}
