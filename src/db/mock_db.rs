use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::failed_webhook_repository::FailedWebhookRepository;
use crate::db::product_mapping_repository::ProductMappingRepository;
use crate::db::subscription_store::{ApplyOutcome, SubscriptionStore, Transition};
use crate::db::webhook_log_repository::WebhookLogRepository;
use crate::models::failed_webhook::{FailedWebhook, FailedWebhookStatus};
use crate::models::product_mapping::ProductMapping;
use crate::models::provider::Provider;
use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::models::user::{AccessLevel, PlanType, User};
use crate::models::webhook_log::{NewWebhookLog, WebhookLogEntry, WebhookStatus};
use crate::webhook::event::SubscriptionEvent;
use crate::webhook::mapper::ResolvedPlan;
use crate::webhook::state_machine::{plan_action, Action};

fn mock_failure() -> sqlx::Error {
    sqlx::Error::Protocol("Mock DB failure".into())
}

/// In-memory subscription store running the same planner as the Postgres
/// implementation, so pipeline tests exercise the real decision rules.
pub struct MockSubscriptionStore {
    pub users: Arc<Mutex<Vec<User>>>,
    pub subscriptions: Arc<Mutex<Vec<Subscription>>>,
    pub processed_keys: Arc<Mutex<HashSet<String>>>,
    pub grace_hours: i64,
    pub should_fail: bool,
}

impl MockSubscriptionStore {
    pub fn new() -> Self {
        Self::with_grace(0)
    }

    pub fn with_grace(grace_hours: i64) -> Self {
        MockSubscriptionStore {
            users: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            processed_keys: Arc::new(Mutex::new(HashSet::new())),
            grace_hours,
            should_fail: false,
        }
    }

    pub fn failing() -> Self {
        MockSubscriptionStore {
            should_fail: true,
            ..Self::new()
        }
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email == email)
            .cloned()
    }

    pub fn subscription_for(&self, user_id: Uuid) -> Option<Subscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.updated_at)
            .cloned()
    }

    pub fn seed_user(&self, user: User) {
        self.users.lock().unwrap().push(user);
    }

    pub fn seed_subscription(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap().push(sub);
    }
}

impl Default for MockSubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStore for MockSubscriptionStore {
    async fn apply_event(
        &self,
        event: &SubscriptionEvent,
        plan: &ResolvedPlan,
        dedup_key: &str,
        now: OffsetDateTime,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }

        if !self.processed_keys.lock().unwrap().insert(dedup_key.to_string()) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let existing_user = self.user_by_email(&event.email);
        let existing_sub = existing_user
            .as_ref()
            .and_then(|u| self.subscription_for(u.id));

        let action = plan_action(event, plan, existing_sub.as_ref(), now, self.grace_hours);

        match action {
            Action::Skip { reason } => {
                // Mirror of the Postgres rollback: a skipped event leaves no
                // dedup mark behind, so a redelivery is re-evaluated.
                self.processed_keys.lock().unwrap().remove(dedup_key);
                Ok(ApplyOutcome::NoChange {
                    reason: reason.to_string(),
                })
            }
            Action::Activate { plan_type, start, end } => {
                let user_id = match existing_user {
                    Some(u) => {
                        let mut users = self.users.lock().unwrap();
                        let stored = users.iter_mut().find(|c| c.id == u.id).unwrap();
                        stored.access_level = AccessLevel::Premium;
                        stored.plan_type = plan_type;
                        stored.subscription_source = Some(event.provider.into());
                        stored.subscription_started_at = Some(start);
                        stored.subscription_expires_at = end;
                        stored.is_active = true;
                        u.id
                    }
                    None => {
                        let id = Uuid::new_v4();
                        self.users.lock().unwrap().push(User {
                            id,
                            email: event.email.clone(),
                            username: crate::utils::username::username_base(&event.email),
                            name: event.name.clone().unwrap_or_else(|| event.email.clone()),
                            password_hash: "mock-hash".into(),
                            access_level: AccessLevel::Premium,
                            plan_type,
                            subscription_source: Some(event.provider.into()),
                            subscription_started_at: Some(start),
                            subscription_expires_at: end,
                            is_active: true,
                            created_at: now,
                        });
                        id
                    }
                };

                let mut subs = self.subscriptions.lock().unwrap();
                let subscription_id = match subs.iter_mut().find(|s| s.user_id == user_id) {
                    Some(sub) => {
                        sub.plan_type = plan_type;
                        sub.status = SubscriptionStatus::Active;
                        sub.start_date = start;
                        sub.end_date = end;
                        sub.origin = event.provider;
                        sub.transaction_id = event.transaction_id.clone();
                        sub.last_event = event.event_type.clone();
                        sub.updated_at = now;
                        sub.id
                    }
                    None => {
                        let id = Uuid::new_v4();
                        subs.push(Subscription {
                            id,
                            user_id,
                            plan_type,
                            status: SubscriptionStatus::Active,
                            start_date: start,
                            end_date: end,
                            origin: event.provider,
                            transaction_id: event.transaction_id.clone(),
                            last_event: event.event_type.clone(),
                            created_at: now,
                            updated_at: now,
                        });
                        id
                    }
                };

                Ok(ApplyOutcome::Applied {
                    user_id,
                    subscription_id,
                    transition: Transition::Activated {
                        plan_type,
                        end_date: end,
                    },
                })
            }
            Action::Terminate { status, downgrade_at } => {
                let sub = existing_sub.expect("planner only terminates existing subscriptions");
                let user_id = sub.user_id;

                {
                    let mut subs = self.subscriptions.lock().unwrap();
                    let stored = subs.iter_mut().find(|s| s.id == sub.id).unwrap();
                    stored.status = status;
                    stored.last_event = event.event_type.clone();
                    stored.updated_at = now;
                }
                {
                    let mut users = self.users.lock().unwrap();
                    let stored = users.iter_mut().find(|u| u.id == user_id).unwrap();
                    match downgrade_at {
                        None => {
                            stored.access_level = AccessLevel::Free;
                            stored.plan_type = PlanType::None;
                            stored.subscription_expires_at = None;
                        }
                        Some(deadline) => {
                            stored.subscription_expires_at = Some(deadline);
                        }
                    }
                }

                Ok(ApplyOutcome::Applied {
                    user_id,
                    subscription_id: sub.id,
                    transition: Transition::Terminated { status },
                })
            }
        }
    }

    async fn downgrade_lapsed_users(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let mut count = 0;
        let mut users = self.users.lock().unwrap();
        for user in users.iter_mut() {
            if user.access_level == AccessLevel::Premium
                && user.plan_type != PlanType::Lifetime
                && user.subscription_expires_at.is_some_and(|t| t <= now)
            {
                user.access_level = AccessLevel::Free;
                user.plan_type = PlanType::None;
                user.subscription_expires_at = None;
                count += 1;
            }
        }
        Ok(count)
    }
}

pub struct MockProductMappingRepository {
    pub rows: Vec<ProductMapping>,
    pub should_fail: bool,
}

impl MockProductMappingRepository {
    pub fn with_rows(rows: Vec<ProductMapping>) -> Self {
        MockProductMappingRepository {
            rows,
            should_fail: false,
        }
    }

    pub fn failing() -> Self {
        MockProductMappingRepository {
            rows: Vec::new(),
            should_fail: true,
        }
    }
}

impl Default for MockProductMappingRepository {
    fn default() -> Self {
        Self::with_rows(Vec::new())
    }
}

#[async_trait]
impl ProductMappingRepository for MockProductMappingRepository {
    async fn find_by_offer(
        &self,
        provider: Provider,
        product_id: &str,
        offer_code: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        Ok(self
            .rows
            .iter()
            .find(|m| {
                m.provider == provider
                    && m.product_id == product_id
                    && m.offer_code.as_deref() == Some(offer_code)
            })
            .cloned())
    }

    async fn find_default(
        &self,
        provider: Provider,
        product_id: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        Ok(self
            .rows
            .iter()
            .find(|m| {
                m.provider == provider && m.product_id == product_id && m.offer_code.is_none()
            })
            .cloned())
    }
}

pub struct MockWebhookLogRepository {
    pub entries: Arc<Mutex<Vec<WebhookLogEntry>>>,
    pub should_fail: bool,
}

impl MockWebhookLogRepository {
    pub fn new() -> Self {
        MockWebhookLogRepository {
            entries: Arc::new(Mutex::new(Vec::new())),
            should_fail: false,
        }
    }

    pub fn failing() -> Self {
        MockWebhookLogRepository {
            should_fail: true,
            ..Self::new()
        }
    }

    pub fn snapshot(&self) -> Vec<WebhookLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl Default for MockWebhookLogRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookLogRepository for MockWebhookLogRepository {
    async fn insert_received(&self, entry: &NewWebhookLog) -> Result<Uuid, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let id = Uuid::new_v4();
        self.entries.lock().unwrap().push(WebhookLogEntry {
            id,
            provider: entry.provider,
            event_type: entry.event_type.clone(),
            status: WebhookStatus::Received,
            email: entry.email.clone(),
            transaction_id: entry.transaction_id.clone(),
            raw_payload: entry.raw_payload.clone(),
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
        });
        Ok(id)
    }

    async fn mark_processed(&self, id: Uuid, note: Option<&str>) -> Result<(), sqlx::Error> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        entry.status = WebhookStatus::Processed;
        entry.error_message = note.map(|s| s.to_string());
        entry.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        entry.status = WebhookStatus::Error;
        entry.error_message = Some(error.to_string());
        entry.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<WebhookLogEntry>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

pub struct MockFailedWebhookRepository {
    pub rows: Arc<Mutex<Vec<FailedWebhook>>>,
    pub should_fail: bool,
}

impl MockFailedWebhookRepository {
    pub fn new() -> Self {
        MockFailedWebhookRepository {
            rows: Arc::new(Mutex::new(Vec::new())),
            should_fail: false,
        }
    }

    pub fn failing() -> Self {
        MockFailedWebhookRepository {
            should_fail: true,
            ..Self::new()
        }
    }

    pub fn snapshot(&self) -> Vec<FailedWebhook> {
        self.rows.lock().unwrap().clone()
    }

    pub fn seed(&self, row: FailedWebhook) {
        self.rows.lock().unwrap().push(row);
    }
}

impl Default for MockFailedWebhookRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailedWebhookRepository for MockFailedWebhookRepository {
    async fn enqueue(
        &self,
        webhook_log_id: Option<Uuid>,
        source: Provider,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<Uuid, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let id = Uuid::new_v4();
        self.rows.lock().unwrap().push(FailedWebhook {
            id,
            webhook_log_id,
            source,
            payload,
            error_message: error.to_string(),
            retry_count: 0,
            last_retry_at: None,
            status: FailedWebhookStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    async fn claim_due(
        &self,
        max_attempts: i32,
        backoff_base_secs: i64,
        limit: i64,
    ) -> Result<Vec<FailedWebhook>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let now = OffsetDateTime::now_utc();
        let mut claimed = Vec::new();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let eligible = matches!(
                row.status,
                FailedWebhookStatus::Pending | FailedWebhookStatus::Retrying
            ) && row.retry_count < max_attempts;
            if !eligible {
                continue;
            }
            let anchor = row.last_retry_at.unwrap_or(row.created_at);
            let backoff = Duration::seconds(backoff_base_secs << row.retry_count.min(30));
            if anchor + backoff > now {
                continue;
            }
            row.status = FailedWebhookStatus::Retrying;
            row.retry_count += 1;
            row.last_retry_at = Some(now);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn claim_one(&self, id: Uuid) -> Result<Option<FailedWebhook>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|r| {
            r.id == id
                && matches!(
                    r.status,
                    FailedWebhookStatus::Pending
                        | FailedWebhookStatus::Retrying
                        | FailedWebhookStatus::Abandoned
                )
        });
        Ok(row.map(|r| {
            r.status = FailedWebhookStatus::Retrying;
            r.retry_count += 1;
            r.last_retry_at = Some(now);
            r.clone()
        }))
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<(), sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        row.status = FailedWebhookStatus::Resolved;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        row.status = FailedWebhookStatus::Pending;
        row.error_message = error.to_string();
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        row.status = FailedWebhookStatus::Abandoned;
        row.error_message = error.to_string();
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<FailedWebhook>, sqlx::Error> {
        if self.should_fail {
            return Err(mock_failure());
        }
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
