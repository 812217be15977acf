use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::failed_webhook::FailedWebhook;
use crate::state::AppState;
use crate::webhook::pipeline::{process_delivery, PipelineOutcome};

const CLAIM_BATCH: i64 = 10;
const GRACE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct RetryWorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RetryWorkerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawns the background loop that replays dead-lettered deliveries on
/// their backoff schedule and downgrades members whose grace window closed.
pub fn start_retry_worker(state: AppState) -> RetryWorkerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_secs(state.config.retry_poll_interval_secs);

    let handle = tokio::spawn(async move {
        let mut last_sweep = std::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("retry worker shutting down");
                        break;
                    }
                }
                _ = sleep(poll_interval) => {
                    if let Err(err) = process_due_retries(&state).await {
                        error!(?err, "retry worker: error processing due retries");
                    }
                    if last_sweep.elapsed() > GRACE_SWEEP_INTERVAL {
                        match state.store.downgrade_lapsed_users(time::OffsetDateTime::now_utc()).await {
                            Ok(0) => {}
                            Ok(n) => info!(count = n, "downgraded members past their grace window"),
                            Err(err) => error!(?err, "grace sweep failed"),
                        }
                        last_sweep = std::time::Instant::now();
                    }
                }
            }
        }
    });

    RetryWorkerHandle { shutdown, handle }
}

/// One polling pass: claim due rows and replay each. Returns how many rows
/// were claimed.
pub async fn process_due_retries(state: &AppState) -> Result<usize, sqlx::Error> {
    let claimed = state
        .failed_webhooks
        .claim_due(
            state.config.retry_max_attempts,
            state.config.retry_backoff_base_secs,
            CLAIM_BATCH,
        )
        .await?;
    let count = claimed.len();
    for row in claimed {
        replay(state, row).await;
    }
    Ok(count)
}

/// Admin-triggered replay of a single dead letter, ignoring its backoff
/// schedule. Returns None when the row is missing or already resolved.
pub async fn run_manual_retry(
    state: &AppState,
    id: Uuid,
) -> Result<Option<PipelineOutcome>, sqlx::Error> {
    let row = match state.failed_webhooks.claim_one(id).await? {
        Some(row) => row,
        None => return Ok(None),
    };
    Ok(Some(replay(state, row).await))
}

async fn replay(state: &AppState, row: FailedWebhook) -> PipelineOutcome {
    let body = row.payload.to_string();
    let outcome = process_delivery(state, row.source, body.as_bytes(), row.webhook_log_id).await;

    let bookkeeping = match &outcome {
        PipelineOutcome::Processed
        | PipelineOutcome::Duplicate
        | PipelineOutcome::Ignored { .. } => state.failed_webhooks.mark_resolved(row.id).await,
        PipelineOutcome::Rejected { error } => {
            // A payload that does not parse will never succeed on retry.
            state.failed_webhooks.mark_abandoned(row.id, error).await
        }
        PipelineOutcome::Failed { error } => {
            if row.retry_count >= state.config.retry_max_attempts {
                error!(failed_webhook_id = %row.id, "giving up on dead letter after max attempts");
                state.failed_webhooks.mark_abandoned(row.id, error).await
            } else {
                state.failed_webhooks.record_failure(row.id, error).await
            }
        }
    };
    if let Err(err) = bookkeeping {
        error!(?err, failed_webhook_id = %row.id, "failed to update dead letter status");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::db::mock_db::{
        MockFailedWebhookRepository, MockProductMappingRepository, MockSubscriptionStore,
        MockWebhookLogRepository,
    };
    use crate::models::failed_webhook::FailedWebhookStatus;
    use crate::models::provider::Provider;
    use crate::models::user::AccessLevel;
    use crate::services::smtp_mailer::mock_mailer::MockMailer;
    use time::OffsetDateTime;

    fn test_state(store: MockSubscriptionStore, failed: Arc<MockFailedWebhookRepository>) -> AppState {
        AppState {
            store: Arc::new(store),
            webhook_logs: Arc::new(MockWebhookLogRepository::new()),
            product_mappings: Arc::new(MockProductMappingRepository::default()),
            failed_webhooks: failed,
            mailer: Arc::new(MockMailer::default()),
            config: Arc::new(Config {
                database_url: "postgres://unused".into(),
                frontend_origin: "http://localhost:5173".into(),
                admin_token: "secret".into(),
                default_member_password: "mudar@123".into(),
                grace_hours_after_expiration: 0,
                retry_max_attempts: 5,
                retry_backoff_base_secs: 60,
                retry_poll_interval_secs: 1,
                handler_timeout_secs: 10,
            }),
        }
    }

    fn approved_payload() -> serde_json::Value {
        serde_json::json!({
            "event": "PURCHASE_APPROVED",
            "data": {
                "buyer": { "email": "ana@example.com", "name": "Ana Souza" },
                "purchase": { "transaction": "HP16730" },
                "product": { "id": 4412 }
            }
        })
    }

    fn due_row(payload: serde_json::Value, retry_count: i32) -> FailedWebhook {
        FailedWebhook {
            id: Uuid::new_v4(),
            webhook_log_id: Some(Uuid::new_v4()),
            source: Provider::Hotmart,
            payload,
            error_message: "connection refused".into(),
            retry_count,
            last_retry_at: None,
            status: FailedWebhookStatus::Pending,
            created_at: OffsetDateTime::now_utc() - time::Duration::hours(2),
        }
    }

    #[tokio::test]
    async fn successful_replay_resolves_the_dead_letter() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        let row = due_row(approved_payload(), 0);
        let row_id = row.id;
        failed.seed(row);

        let state = test_state(MockSubscriptionStore::new(), failed.clone());
        let claimed = process_due_retries(&state).await.unwrap();
        assert_eq!(claimed, 1);

        let rows = failed.snapshot();
        assert_eq!(rows[0].id, row_id);
        assert_eq!(rows[0].status, FailedWebhookStatus::Resolved);
    }

    #[tokio::test]
    async fn failed_replay_goes_back_to_pending() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        failed.seed(due_row(approved_payload(), 0));

        let state = test_state(MockSubscriptionStore::failing(), failed.clone());
        process_due_retries(&state).await.unwrap();

        let rows = failed.snapshot();
        assert_eq!(rows[0].status, FailedWebhookStatus::Pending);
        assert_eq!(rows[0].retry_count, 1);
    }

    #[tokio::test]
    async fn replay_at_max_attempts_is_abandoned() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        failed.seed(due_row(approved_payload(), 4));

        let state = test_state(MockSubscriptionStore::failing(), failed.clone());
        process_due_retries(&state).await.unwrap();

        let rows = failed.snapshot();
        assert_eq!(rows[0].status, FailedWebhookStatus::Abandoned);
        assert_eq!(rows[0].retry_count, 5);
    }

    #[tokio::test]
    async fn unparseable_payload_is_abandoned_outright() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        failed.seed(due_row(serde_json::Value::String("junk".into()), 0));

        let state = test_state(MockSubscriptionStore::new(), failed.clone());
        process_due_retries(&state).await.unwrap();

        let rows = failed.snapshot();
        assert_eq!(rows[0].status, FailedWebhookStatus::Abandoned);
    }

    #[tokio::test]
    async fn rows_inside_their_backoff_window_are_left_alone() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        let mut row = due_row(approved_payload(), 1);
        row.last_retry_at = Some(OffsetDateTime::now_utc());
        failed.seed(row);

        let state = test_state(MockSubscriptionStore::new(), failed.clone());
        let claimed = process_due_retries(&state).await.unwrap();
        assert_eq!(claimed, 0);
        assert_eq!(failed.snapshot()[0].status, FailedWebhookStatus::Pending);
    }

    #[tokio::test]
    async fn manual_retry_skips_the_backoff_schedule() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        let mut row = due_row(approved_payload(), 1);
        row.last_retry_at = Some(OffsetDateTime::now_utc());
        let row_id = row.id;
        failed.seed(row);

        let state = test_state(MockSubscriptionStore::new(), failed.clone());
        let outcome = run_manual_retry(&state, row_id).await.unwrap();
        assert!(matches!(outcome, Some(PipelineOutcome::Processed)));
        assert_eq!(failed.snapshot()[0].status, FailedWebhookStatus::Resolved);
    }

    #[tokio::test]
    async fn manual_retry_of_missing_row_returns_none() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        let state = test_state(MockSubscriptionStore::new(), failed);
        let outcome = run_manual_retry(&state, Uuid::new_v4()).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn replay_applies_the_subscription_change() {
        let failed = Arc::new(MockFailedWebhookRepository::new());
        failed.seed(due_row(approved_payload(), 0));

        let store = MockSubscriptionStore::new();
        let users = store.users.clone();
        let state = test_state(store, failed);
        process_due_retries(&state).await.unwrap();

        let users = users.lock().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "ana@example.com");
        assert_eq!(users[0].access_level, AccessLevel::Premium);
    }
}
