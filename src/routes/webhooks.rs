use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::models::provider::Provider;
use crate::state::AppState;
use crate::webhook::pipeline::{process_delivery, PipelineOutcome};

pub async fn hotmart_webhook(State(app_state): State<AppState>, body: Bytes) -> Response {
    handle(app_state, Provider::Hotmart, body).await
}

pub async fn doppus_webhook(State(app_state): State<AppState>, body: Bytes) -> Response {
    handle(app_state, Provider::Doppus, body).await
}

/// Providers treat non-200 answers (and slow answers) as failures and
/// redeliver, so every outcome is acknowledged with a 200. Processing runs
/// on its own task; if it outlives the deadline the provider is answered
/// anyway and the work finishes in the background.
async fn handle(app_state: AppState, provider: Provider, body: Bytes) -> Response {
    let deadline = Duration::from_secs(app_state.config.handler_timeout_secs);
    let task = tokio::spawn({
        let app_state = app_state.clone();
        async move { process_delivery(&app_state, provider, &body, None).await }
    });

    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(outcome)) => respond(outcome),
        Ok(Err(join_err)) => {
            warn!(%provider, ?join_err, "webhook processing task panicked");
            (
                StatusCode::OK,
                Json(json!({ "success": false, "message": "internal error" })),
            )
                .into_response()
        }
        Err(_) => {
            warn!(%provider, "webhook processing exceeded the deadline; acknowledging anyway");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "accepted": true, "message": "accepted for processing" })),
            )
                .into_response()
        }
    }
}

fn respond(outcome: PipelineOutcome) -> Response {
    let body = match outcome {
        PipelineOutcome::Processed => json!({ "success": true, "message": "processed" }),
        PipelineOutcome::Duplicate => {
            json!({ "success": true, "duplicate": true, "message": "duplicate delivery" })
        }
        PipelineOutcome::Ignored { reason } => {
            json!({ "success": true, "ignored": true, "message": reason })
        }
        PipelineOutcome::Rejected { error } => json!({ "success": false, "message": error }),
        PipelineOutcome::Failed { error } => json!({ "success": false, "message": error }),
    };
    (StatusCode::OK, Json(body)).into_response()
}
