//! Axum webhook surface for Almoner.
//!
//! One endpoint accepts both provider payload shapes; normalization decides
//! which. Rejections are acknowledged with `200` so the provider stops
//! redelivering; only unsupported content types get `400` and only storage
//! faults get `500`.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use almoner_core::{normalize, Rejection};
use almoner_storage::IngestOutcome;
use almoner_sync::IngestService;

pub const CRATE_NAME: &str = "almoner-web";

#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
}

impl AppState {
    pub fn new(ingest: IngestService) -> Self {
        Self { ingest }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/donations", post(webhook_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("ALMONER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook listener started");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = match normalize(&body, content_type, Utc::now()) {
        Ok(event) => event,
        Err(rejection @ Rejection::UnsupportedContentType(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "reason": rejection.to_string()})),
            )
                .into_response();
        }
        Err(rejection) => {
            // Expected and acknowledged; not an error.
            debug!(reason = %rejection, "webhook ignored");
            return (
                StatusCode::OK,
                Json(json!({"status": "ignored", "reason": rejection.to_string()})),
            )
                .into_response();
        }
    };

    match state.ingest.ingest(&event).await {
        Ok(IngestOutcome::Recorded { new_lifetime }) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "result": "recorded",
                "lifetime_donated": new_lifetime,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "result": "duplicate"})),
        )
            .into_response(),
        Err(err) => {
            error!(email = %event.email, error = %err, "ingestion fault");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}
