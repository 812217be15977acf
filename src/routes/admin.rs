use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::responses::JsonResponse;
use crate::state::AppState;
use crate::webhook::pipeline::PipelineOutcome;
use crate::worker::run_manual_retry;

/// Constant-time comparison of the X-Admin-Token header against the
/// configured secret.
fn authorized(app_state: &AppState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    presented
        .as_bytes()
        .ct_eq(app_state.config.admin_token.as_bytes())
        .into()
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl PageQuery {
    fn limits(&self) -> (i64, i64, i64) {
        let per_page = self.per_page.unwrap_or(20).clamp(1, 100);
        let page = self.page.unwrap_or(1).max(1);
        (page, per_page, (page - 1) * per_page)
    }
}

pub async fn list_webhook_logs(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PageQuery>,
) -> Response {
    if !authorized(&app_state, &headers) {
        return JsonResponse::unauthorized("Invalid admin token").into_response();
    }
    let (page, per_page, offset) = params.limits();
    match app_state.webhook_logs.list(per_page, offset).await {
        Ok(logs) => (
            StatusCode::OK,
            Json(json!({ "success": true, "logs": logs, "page": page, "per_page": per_page })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(?e, "DB error listing webhook logs");
            JsonResponse::server_error("Failed to fetch").into_response()
        }
    }
}

pub async fn list_failed_webhooks(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PageQuery>,
) -> Response {
    if !authorized(&app_state, &headers) {
        return JsonResponse::unauthorized("Invalid admin token").into_response();
    }
    let (page, per_page, offset) = params.limits();
    match app_state.failed_webhooks.list(per_page, offset).await {
        Ok(items) => (
            StatusCode::OK,
            Json(
                json!({ "success": true, "failed_webhooks": items, "page": page, "per_page": per_page }),
            ),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(?e, "DB error listing failed webhooks");
            JsonResponse::server_error("Failed to fetch").into_response()
        }
    }
}

/// Replays one dead-lettered delivery right now, skipping its backoff
/// schedule.
pub async fn retry_failed_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    if !authorized(&app_state, &headers) {
        return JsonResponse::unauthorized("Invalid admin token").into_response();
    }
    match run_manual_retry(&app_state, id).await {
        Ok(Some(outcome)) => {
            let resolved = !matches!(outcome, PipelineOutcome::Failed { .. });
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "resolved": resolved,
                    "outcome": format!("{:?}", outcome),
                })),
            )
                .into_response()
        }
        Ok(None) => JsonResponse::not_found("Failed webhook not found").into_response(),
        Err(e) => {
            tracing::error!(?e, "DB error retrying failed webhook");
            JsonResponse::server_error("Failed to retry").into_response()
        }
    }
}
