use serde_json::Value;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::subscription_store::{ApplyOutcome, Transition};
use crate::models::provider::Provider;
use crate::models::webhook_log::NewWebhookLog;
use crate::state::AppState;
use crate::webhook::dedup::dedup_key;
use crate::webhook::event::EventKind;
use crate::webhook::mapper;
use crate::webhook::normalizer::{normalize, NormalizeError};

/// Terminal result of one delivery. Every variant maps to an HTTP 200 at
/// the route layer; providers only see retryable failures as `Failed`.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// State was applied and the audit row marked processed.
    Processed,
    /// Same event seen before; nothing mutated.
    Duplicate,
    /// Valid delivery with nothing to do (unhandled event, cancel with no
    /// subscription on file).
    Ignored { reason: String },
    /// The payload itself is unusable. Dead-lettered like any other failure
    /// so it stays visible to operators; the retry worker abandons it on
    /// replay since the same bytes cannot parse differently.
    Rejected { error: String },
    /// Infrastructure failure. Dead-lettered on first delivery so the retry
    /// worker can replay it.
    Failed { error: String },
}

/// Runs one webhook delivery end to end: normalize, audit, resolve the
/// plan, apply through the store, notify. `existing_log` is set when the
/// retry worker replays a dead letter, so the original audit row is reused
/// and failures are not dead-lettered a second time.
pub async fn process_delivery(
    state: &AppState,
    provider: Provider,
    body: &[u8],
    existing_log: Option<Uuid>,
) -> PipelineOutcome {
    let now = OffsetDateTime::now_utc();
    let raw_payload = parse_raw(body);

    let event = match normalize(provider, body, now) {
        Ok(event) => event,
        Err(err) => {
            warn!(%provider, %err, "rejecting unusable webhook payload");
            let log_id = record_rejection(state, provider, &raw_payload, existing_log, &err).await;
            if existing_log.is_none() {
                dead_letter(state, log_id, provider, &raw_payload, &err.to_string()).await;
            }
            return PipelineOutcome::Rejected {
                error: err.to_string(),
            };
        }
    };

    let log_id = match existing_log {
        Some(id) => Some(id),
        None => {
            let entry = NewWebhookLog {
                provider,
                event_type: event.event_type.clone(),
                email: Some(event.email.clone()),
                transaction_id: event.transaction_id.clone(),
                raw_payload: raw_payload.clone(),
            };
            match state.webhook_logs.insert_received(&entry).await {
                Ok(id) => Some(id),
                Err(err) => {
                    // If the audit insert fails the database is in trouble;
                    // still try to park the delivery for later.
                    error!(%provider, ?err, "failed to write webhook audit row");
                    let message = format!("audit insert failed: {}", err);
                    dead_letter(state, None, provider, &raw_payload, &message).await;
                    return PipelineOutcome::Failed { error: message };
                }
            }
        }
    };

    if event.kind == EventKind::Unknown {
        // Unrecognized events are only recorded; the audit row keeps its
        // received status so they remain visible as never-handled.
        info!(%provider, event_type = %event.event_type, "ignoring unhandled event type");
        return PipelineOutcome::Ignored {
            reason: format!("unhandled event type: {}", event.event_type),
        };
    }

    let plan = mapper::resolve(
        state.product_mappings.as_ref(),
        provider,
        event.product_id.as_deref(),
        event.offer_code.as_deref(),
    )
    .await;

    let key = dedup_key(provider, event.transaction_id.as_deref(), &event.event_type);

    match state.store.apply_event(&event, &plan, &key, now).await {
        Ok(ApplyOutcome::Duplicate) => {
            info!(%provider, event_type = %event.event_type, "duplicate delivery");
            mark_processed(state, log_id, Some("duplicate delivery")).await;
            PipelineOutcome::Duplicate
        }
        Ok(ApplyOutcome::NoChange { reason }) => {
            info!(%provider, event_type = %event.event_type, reason, "no state change");
            mark_processed(state, log_id, Some(&reason)).await;
            PipelineOutcome::Ignored { reason }
        }
        Ok(ApplyOutcome::Applied { user_id, transition, .. }) => {
            info!(
                %provider,
                event_type = %event.event_type,
                %user_id,
                ?transition,
                "subscription event applied"
            );
            let note = plan
                .fallback
                .then_some("no product mapping found; defaulted to free trial");
            mark_processed(state, log_id, note).await;
            notify(state, &event.email, event.name.as_deref(), &transition).await;
            PipelineOutcome::Processed
        }
        Err(err) => {
            error!(%provider, event_type = %event.event_type, ?err, "failed to apply event");
            let message = err.to_string();
            if let Some(id) = log_id {
                if let Err(log_err) = state.webhook_logs.mark_error(id, &message).await {
                    error!(?log_err, "failed to mark webhook log as errored");
                }
            }
            if existing_log.is_none() {
                dead_letter(state, log_id, provider, &raw_payload, &message).await;
            }
            PipelineOutcome::Failed { error: message }
        }
    }
}

fn parse_raw(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Best-effort event string for a payload the normalizer refused, so the
/// audit row keeps whatever did parse.
fn rejected_event_type(provider: Provider, raw: &Value) -> String {
    let parsed = match provider {
        Provider::Hotmart => raw.get("event").and_then(Value::as_str),
        Provider::Doppus => raw
            .get("status")
            .and_then(|s| s.get("code"))
            .and_then(Value::as_str),
    };
    parsed
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unparseable")
        .to_string()
}

async fn record_rejection(
    state: &AppState,
    provider: Provider,
    raw_payload: &Value,
    existing_log: Option<Uuid>,
    err: &NormalizeError,
) -> Option<Uuid> {
    let log_id = match existing_log {
        Some(id) => Some(id),
        None => {
            let entry = NewWebhookLog {
                provider,
                event_type: rejected_event_type(provider, raw_payload),
                email: None,
                transaction_id: None,
                raw_payload: raw_payload.clone(),
            };
            match state.webhook_logs.insert_received(&entry).await {
                Ok(id) => Some(id),
                Err(log_err) => {
                    error!(?log_err, "failed to write webhook audit row for rejection");
                    None
                }
            }
        }
    };
    if let Some(id) = log_id {
        if let Err(log_err) = state.webhook_logs.mark_error(id, &err.to_string()).await {
            error!(?log_err, "failed to mark webhook log as errored");
        }
    }
    log_id
}

async fn mark_processed(state: &AppState, log_id: Option<Uuid>, note: Option<&str>) {
    if let Some(id) = log_id {
        if let Err(err) = state.webhook_logs.mark_processed(id, note).await {
            error!(?err, "failed to mark webhook log as processed");
        }
    }
}

async fn dead_letter(
    state: &AppState,
    log_id: Option<Uuid>,
    provider: Provider,
    raw_payload: &Value,
    error_message: &str,
) {
    match state
        .failed_webhooks
        .enqueue(log_id, provider, raw_payload.clone(), error_message)
        .await
    {
        Ok(id) => info!(%provider, failed_webhook_id = %id, "delivery parked for retry"),
        Err(err) => error!(%provider, ?err, "failed to enqueue dead letter"),
    }
}

/// Mail failures are logged and swallowed; the subscription change already
/// committed.
async fn notify(state: &AppState, email: &str, name: Option<&str>, transition: &Transition) {
    let result = match transition {
        Transition::Activated { .. } => {
            state
                .mailer
                .send_welcome_email(email, name.unwrap_or(email))
                .await
        }
        Transition::Terminated { status } => {
            state
                .mailer
                .send_access_ended_email(email, &status.to_string())
                .await
        }
    };
    if let Err(err) = result {
        warn!(%email, %err, "failed to send subscription notice");
    }
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
    use crate::db::subscription_store::SubscriptionStore;
    use crate::models::failed_webhook::FailedWebhookStatus;
    use crate::models::product_mapping::ProductMapping;
    use crate::models::user::{AccessLevel, PlanType};
    use crate::models::webhook_log::WebhookStatus;
    use crate::services::smtp_mailer::mock_mailer::MockMailer;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://unused".into(),
            frontend_origin: "http://localhost:5173".into(),
            admin_token: "secret".into(),
            default_member_password: "mudar@123".into(),
            grace_hours_after_expiration: 0,
            retry_max_attempts: 5,
            retry_backoff_base_secs: 60,
            retry_poll_interval_secs: 30,
            handler_timeout_secs: 10,
        }
    }

    struct TestHarness {
        state: AppState,
        store: Arc<MockSubscriptionStore>,
        logs: Arc<MockWebhookLogRepository>,
        failed: Arc<MockFailedWebhookRepository>,
        mailer: Arc<MockMailer>,
    }

    fn harness_with(store: MockSubscriptionStore, mappings: MockProductMappingRepository) -> TestHarness {
        let store = Arc::new(store);
        let logs = Arc::new(MockWebhookLogRepository::new());
        let failed = Arc::new(MockFailedWebhookRepository::new());
        let mailer = Arc::new(MockMailer::default());
        let state = AppState {
            store: store.clone(),
            webhook_logs: logs.clone(),
            product_mappings: Arc::new(mappings),
            failed_webhooks: failed.clone(),
            mailer: mailer.clone(),
            config: Arc::new(test_config()),
        };
        TestHarness {
            state,
            store,
            logs,
            failed,
            mailer,
        }
    }

    fn harness() -> TestHarness {
        harness_with(MockSubscriptionStore::new(), annual_mappings())
    }

    fn annual_mappings() -> MockProductMappingRepository {
        MockProductMappingRepository::with_rows(vec![ProductMapping {
            id: Uuid::new_v4(),
            provider: Provider::Hotmart,
            product_id: "4412".into(),
            offer_code: Some("annual".into()),
            plan_type: PlanType::Annual,
            duration_days: 365,
        }])
    }

    fn hotmart_approved() -> Vec<u8> {
        serde_json::json!({
            "event": "PURCHASE_APPROVED",
            "creation_date": 1_690_000_000_000i64,
            "data": {
                "buyer": { "email": "ana@example.com", "name": "Ana Souza" },
                "purchase": { "transaction": "HP16730", "offer": { "code": "annual" } },
                "product": { "id": 4412 }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn hotmart_refund() -> Vec<u8> {
        serde_json::json!({
            "event": "PURCHASE_REFUNDED",
            "data": {
                "buyer": { "email": "ana@example.com" },
                "purchase": { "transaction": "HP16730" },
                "product": { "id": 4412 }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn approved_purchase_provisions_a_premium_member() {
        let h = harness();
        let outcome =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);

        let user = h.store.user_by_email("ana@example.com").expect("user created");
        assert_eq!(user.access_level, AccessLevel::Premium);
        assert_eq!(user.plan_type, PlanType::Annual);
        assert!(user.subscription_expires_at.is_some());

        let sub = h.store.subscription_for(user.id).expect("subscription created");
        assert_eq!(sub.plan_type, PlanType::Annual);
        assert_eq!(sub.transaction_id.as_deref(), Some("HP16730"));

        let logs = h.logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, WebhookStatus::Processed);
        assert_eq!(logs[0].email.as_deref(), Some("ana@example.com"));

        let welcomes = h.mailer.sent_welcome_emails.lock().unwrap();
        assert_eq!(welcomes.len(), 1);
        assert_eq!(welcomes[0].0, "ana@example.com");
    }

    #[tokio::test]
    async fn redelivery_of_the_same_event_changes_nothing() {
        let h = harness();
        let first =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        let second =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        assert_eq!(first, PipelineOutcome::Processed);
        assert_eq!(second, PipelineOutcome::Duplicate);

        assert_eq!(h.store.users.lock().unwrap().len(), 1);
        assert_eq!(h.store.subscriptions.lock().unwrap().len(), 1);

        // Both deliveries are audited; only one welcome email goes out.
        let logs = h.logs.snapshot();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].error_message.as_deref(), Some("duplicate delivery"));
        assert_eq!(h.mailer.sent_welcome_emails.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_revokes_access_immediately() {
        let h = harness();
        process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        let outcome = process_delivery(&h.state, Provider::Hotmart, &hotmart_refund(), None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);

        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Free);
        assert_eq!(user.plan_type, PlanType::None);

        let notices = h.mailer.sent_access_ended_emails.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1, "refunded");
    }

    #[tokio::test]
    async fn cancel_without_subscription_is_audited_but_ignored() {
        let h = harness();
        let body = serde_json::json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "data": {
                "buyer": { "email": "nobody@example.com" },
                "purchase": { "transaction": "HP1" },
                "product": { "id": 4412 }
            }
        })
        .to_string()
        .into_bytes();
        let outcome = process_delivery(&h.state, Provider::Hotmart, &body, None).await;
        assert!(matches!(outcome, PipelineOutcome::Ignored { .. }));
        assert!(h.store.user_by_email("nobody@example.com").is_none());

        let logs = h.logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn unknown_event_is_audited_without_touching_the_store() {
        let h = harness();
        let body = serde_json::json!({
            "event": "SWITCH_PLAN",
            "data": { "buyer": { "email": "ana@example.com" } }
        })
        .to_string()
        .into_bytes();
        let outcome = process_delivery(&h.state, Provider::Hotmart, &body, None).await;
        assert!(matches!(outcome, PipelineOutcome::Ignored { .. }));

        assert!(h.store.processed_keys.lock().unwrap().is_empty());
        let logs = h.logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_type, "SWITCH_PLAN");
        // The row stays in its received state: nothing ever handled it.
        assert_eq!(logs[0].status, WebhookStatus::Received);
        assert!(logs[0].processed_at.is_none());
    }

    #[tokio::test]
    async fn cancel_redelivered_after_a_late_activation_still_applies() {
        let h = harness();
        let cancel = serde_json::json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "data": {
                "buyer": { "email": "ana@example.com" },
                "purchase": { "transaction": "HP16730" },
                "product": { "id": 4412 }
            }
        })
        .to_string()
        .into_bytes();

        // Providers may deliver out of order: the cancel lands first and is
        // skipped, then the activation arrives, then the cancel again.
        let first = process_delivery(&h.state, Provider::Hotmart, &cancel, None).await;
        assert!(matches!(first, PipelineOutcome::Ignored { .. }));

        process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Premium);

        // The skipped cancel left no dedup mark, so the redelivery applies.
        let redelivered = process_delivery(&h.state, Provider::Hotmart, &cancel, None).await;
        assert_eq!(redelivered, PipelineOutcome::Processed);

        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Free);
    }

    #[tokio::test]
    async fn unmapped_product_still_activates_with_fallback_note() {
        let h = harness_with(MockSubscriptionStore::new(), MockProductMappingRepository::default());
        let outcome =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);

        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.plan_type, PlanType::FreeTrial);

        let logs = h.logs.snapshot();
        assert_eq!(
            logs[0].error_message.as_deref(),
            Some("no product mapping found; defaulted to free trial")
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_and_dead_lettered() {
        let h = harness();
        let outcome = process_delivery(&h.state, Provider::Hotmart, b"{not json", None).await;
        assert!(matches!(outcome, PipelineOutcome::Rejected { .. }));

        let logs = h.logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, WebhookStatus::Error);
        assert_eq!(logs[0].event_type, "unparseable");

        let parked = h.failed.snapshot();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].webhook_log_id, Some(logs[0].id));
    }

    #[tokio::test]
    async fn missing_email_is_rejected_and_dead_lettered() {
        let h = harness();
        let body = serde_json::json!({
            "event": "PURCHASE_APPROVED",
            "data": { "purchase": { "transaction": "HP1" } }
        })
        .to_string()
        .into_bytes();
        let outcome = process_delivery(&h.state, Provider::Hotmart, &body, None).await;
        assert!(matches!(outcome, PipelineOutcome::Rejected { .. }));

        let logs = h.logs.snapshot();
        assert_eq!(logs[0].status, WebhookStatus::Error);
        // The event string parsed fine, so the audit row keeps it.
        assert_eq!(logs[0].event_type, "PURCHASE_APPROVED");
        assert_eq!(h.failed.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_parks_the_delivery_for_retry() {
        let h = harness_with(MockSubscriptionStore::failing(), annual_mappings());
        let outcome =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;
        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));

        let logs = h.logs.snapshot();
        assert_eq!(logs[0].status, WebhookStatus::Error);

        let parked = h.failed.snapshot();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].source, Provider::Hotmart);
        assert_eq!(parked[0].status, FailedWebhookStatus::Pending);
        assert_eq!(parked[0].webhook_log_id, Some(logs[0].id));
    }

    #[tokio::test]
    async fn replaying_a_dead_letter_does_not_enqueue_another() {
        let h = harness_with(MockSubscriptionStore::failing(), annual_mappings());
        let log_id = Uuid::new_v4();
        let outcome =
            process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), Some(log_id)).await;
        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
        assert!(h.failed.snapshot().is_empty());
    }

    #[tokio::test]
    async fn mailer_failure_does_not_fail_processing() {
        let store = Arc::new(MockSubscriptionStore::new());
        let logs = Arc::new(MockWebhookLogRepository::new());
        let state = AppState {
            store: store.clone(),
            webhook_logs: logs.clone(),
            product_mappings: Arc::new(annual_mappings()),
            failed_webhooks: Arc::new(MockFailedWebhookRepository::new()),
            mailer: Arc::new(MockMailer {
                fail_send: true,
                ..MockMailer::default()
            }),
            config: Arc::new(test_config()),
        };
        let outcome = process_delivery(&state, Provider::Hotmart, &hotmart_approved(), None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);
        assert!(store.user_by_email("ana@example.com").is_some());
    }

    #[tokio::test]
    async fn grace_period_keeps_premium_until_the_sweep() {
        let h = harness_with(MockSubscriptionStore::with_grace(48), annual_mappings());
        process_delivery(&h.state, Provider::Hotmart, &hotmart_approved(), None).await;

        let cancel = serde_json::json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "data": {
                "buyer": { "email": "ana@example.com" },
                "purchase": { "transaction": "HP16730" },
                "product": { "id": 4412 }
            }
        })
        .to_string()
        .into_bytes();
        process_delivery(&h.state, Provider::Hotmart, &cancel, None).await;

        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Premium);
        let deadline = user.subscription_expires_at.expect("grace deadline stamped");

        // Sweep before the deadline leaves premium alone; after it, access drops.
        let before = h
            .store
            .downgrade_lapsed_users(deadline - time::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(before, 0);
        let after = h.store.downgrade_lapsed_users(deadline).await.unwrap();
        assert_eq!(after, 1);
        let user = h.store.user_by_email("ana@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Free);
    }

    #[tokio::test]
    async fn doppus_approved_provisions_through_offer_mapping() {
        let mappings = MockProductMappingRepository::with_rows(vec![ProductMapping {
            id: Uuid::new_v4(),
            provider: Provider::Doppus,
            product_id: "club-monthly".into(),
            offer_code: None,
            plan_type: PlanType::Monthly,
            duration_days: 30,
        }]);
        let h = harness_with(MockSubscriptionStore::new(), mappings);
        let body = serde_json::json!({
            "customer": { "email": "bruno@example.com", "name": "Bruno Lima" },
            "items": [ { "offer": "club-monthly" } ],
            "transaction": { "code": "DP-9981" },
            "status": { "code": "approved" }
        })
        .to_string()
        .into_bytes();
        let outcome = process_delivery(&h.state, Provider::Doppus, &body, None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);

        let user = h.store.user_by_email("bruno@example.com").unwrap();
        assert_eq!(user.plan_type, PlanType::Monthly);
        assert_eq!(user.access_level, AccessLevel::Premium);

        // Chargeback on the same transaction pulls access back.
        let reversed = serde_json::json!({
            "customer": { "email": "bruno@example.com" },
            "items": [ { "offer": "club-monthly" } ],
            "transaction": { "code": "DP-9981" },
            "status": { "code": "reversed" }
        })
        .to_string()
        .into_bytes();
        let outcome = process_delivery(&h.state, Provider::Doppus, &reversed, None).await;
        assert_eq!(outcome, PipelineOutcome::Processed);

        let user = h.store.user_by_email("bruno@example.com").unwrap();
        assert_eq!(user.access_level, AccessLevel::Free);
        let sub = h.store.subscription_for(user.id).unwrap();
        assert_eq!(sub.status, crate::models::subscription::SubscriptionStatus::Refunded);
    }
}
