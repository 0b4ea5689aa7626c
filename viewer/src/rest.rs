use crate::api::DeviceApi;
use crate::dispatch::{CommandOutcome, Dispatcher};
use crate::display::StatusSummary;
use crate::errors::Error;
use crate::model::{Alert, ConfigUpdate, PumpCommand};
use crate::stats::{load_stats, StatsView};
use crate::sync::ViewReader;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub view: ViewReader,
    pub dispatcher: Arc<Dispatcher>,
    pub api: Arc<dyn DeviceApi>,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    auto_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    outcome: CommandOutcome,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/view", get(get_view))
        .route("/api/v1/mode", post(post_mode))
        .route("/api/v1/pump", post(post_pump))
        .route("/api/v1/config", post(post_config))
        .route("/api/v1/alerts", get(get_alerts))
        .route("/api/v1/stats", get(get_stats))
        .with_state(state)
}

async fn get_view(State(state): State<AppState>) -> Json<StatusSummary> {
    let view = state.view.snapshot();
    let offline = state.view.is_offline();
    Json(StatusSummary::build(
        &view,
        offline,
        state.dispatcher.pending(),
        Instant::now(),
    ))
}

async fn post_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    let outcome = state.dispatcher.set_mode(request.auto_mode).await?;
    Ok(Json(CommandResponse { outcome }))
}

async fn post_pump(
    State(state): State<AppState>,
    Json(command): Json<PumpCommand>,
) -> Result<Json<CommandResponse>, AppError> {
    let outcome = state
        .dispatcher
        .set_pump(command.state, command.duration)
        .await?;
    Ok(Json(CommandResponse { outcome }))
}

async fn post_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<CommandResponse>, AppError> {
    let outcome = state.dispatcher.update_config(update).await?;
    Ok(Json(CommandResponse { outcome }))
}

/// Full alert history; the live view only keeps the newest few.
async fn get_alerts(State(state): State<AppState>) -> Result<Json<Vec<Alert>>, AppError> {
    Ok(Json(state.api.recent_alerts().await?))
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsView> {
    Json(load_stats(state.api.as_ref()).await)
}

pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Precondition(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::CommandFailure(_) | Error::Query(_) | Error::Connectivity(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
