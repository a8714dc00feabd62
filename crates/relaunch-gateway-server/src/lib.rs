use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use relaunch_common::{PushNotification, UpdateError};
use relaunch_orchestrator::UpdateOrchestrator;
use serde_json::json;
use tracing::{error, info, instrument, warn};

pub mod config;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<UpdateOrchestrator>,
    token: Arc<str>,
}

impl AppState {
    pub fn new(orchestrator: UpdateOrchestrator, token: impl Into<Arc<str>>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            token: token.into(),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/listen", any(listen))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "relaunch",
    }))
}

/// True if any `token` query value equals the shared secret.
fn authorized(params: &[(String, String)], secret: &str) -> bool {
    params
        .iter()
        .any(|(key, value)| key == "token" && value == secret)
}

fn failure(message: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{message}\n")).into_response()
}

#[instrument(skip_all, fields(method = %method))]
async fn listen(
    State(state): State<AppState>,
    method: Method,
    query: Option<Query<Vec<(String, String)>>>,
    body: Bytes,
) -> Response {
    let params = query.map(|Query(p)| p).unwrap_or_default();
    if method != Method::POST || !authorized(&params, &state.token) {
        warn!("Rejected webhook request");
        return failure(UpdateError::Unauthorized);
    }

    let notification = match PushNotification::from_slice(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Undecodable push notification");
            return failure(e);
        }
    };
    info!(repo = %notification.repo_name(), pusher = %notification.push_data.pusher, "Push notification received");

    match state.orchestrator.apply(&notification).await {
        Ok(report) if report.is_success() => (StatusCode::OK, "Okay").into_response(),
        Ok(report) => {
            error!(run_id = %report.run_id, failed = report.failures().count(), "Update finished with failures");
            failure(report.failure_summary())
        }
        Err(e) => {
            error!(error = %e, "Update aborted");
            failure(e)
        }
    }
}
