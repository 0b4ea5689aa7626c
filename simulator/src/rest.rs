use crate::device::Device;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::info;
use viewer::errors::Error;
use viewer::model::{
    Alert, ConfigUpdate, DailyStat, DeviceTelemetry, HourlyStat, PumpCommand, PumpUsage,
};
use viewer::rest::AppError;

#[derive(Clone)]
pub struct BackendState {
    pub device: Arc<Mutex<Device>>,
    pub token: Arc<str>,
    /// Notified when a command changed the device config.
    pub config_changed: Arc<Notify>,
}

impl BackendState {
    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match presented {
            Some(token) if token == &*self.token => Ok(()),
            Some(_) => Err(Error::Auth("invalid token".to_string()).into()),
            None => Err(Error::Auth("missing bearer token".to_string()).into()),
        }
    }
}

pub fn create_router(state: BackendState) -> Router {
    Router::new()
        .route("/control/pump", post(control_pump))
        .route("/control/config", post(control_config))
        .route("/telemetry/latest", get(latest))
        .route("/telemetry/alerts", get(alerts))
        .route("/telemetry/hourly", get(hourly))
        .route("/telemetry/daily", get(daily))
        .route("/telemetry/pump/daily", get(pump_daily))
        .with_state(state)
}

async fn control_pump(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Json(command): Json<PumpCommand>,
) -> Result<Json<Value>, AppError> {
    state.authorize(&headers)?;
    state.device().apply_pump(&command, Utc::now())?;
    info!("Pump command applied: {}", command.state);
    state.config_changed.notify_one();
    Ok(Json(json!({ "success": true })))
}

async fn control_config(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<Value>, AppError> {
    state.authorize(&headers)?;
    let changed = state.device().apply_config(&update)?;
    if changed {
        info!("Configuration updated: {:?}", update);
    }
    // Republish even when unchanged so the client sees a confirmation.
    state.config_changed.notify_one();
    Ok(Json(json!({ "success": true, "changed": changed })))
}

async fn latest(
    State(state): State<BackendState>,
    headers: HeaderMap,
) -> Result<Json<DeviceTelemetry>, AppError> {
    state.authorize(&headers)?;
    Ok(Json(state.device().telemetry(Utc::now())))
}

async fn alerts(
    State(state): State<BackendState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Alert>>, AppError> {
    state.authorize(&headers)?;
    Ok(Json(state.device().alerts()))
}

async fn hourly(
    State(state): State<BackendState>,
    headers: HeaderMap,
) -> Result<Json<Vec<HourlyStat>>, AppError> {
    state.authorize(&headers)?;
    Ok(Json(state.device().hourly_stats()))
}

async fn daily(
    State(state): State<BackendState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DailyStat>>, AppError> {
    state.authorize(&headers)?;
    Ok(Json(state.device().daily_stats()))
}

async fn pump_daily(
    State(state): State<BackendState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PumpUsage>>, AppError> {
    state.authorize(&headers)?;
    Ok(Json(state.device().pump_usage()))
}
