use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::subscription_store::{ApplyOutcome, SubscriptionStore, Transition};
use crate::models::subscription::Subscription;
use crate::models::user::{PlanType, SubscriptionSource, User};
use crate::utils::username::{username_base, username_candidate};
use crate::webhook::event::SubscriptionEvent;
use crate::webhook::mapper::ResolvedPlan;
use crate::webhook::state_machine::{plan_action, Action};

pub struct PostgresSubscriptionStore {
    pub pool: PgPool,
    /// Hash of the fixed starter password given to provisioned accounts.
    pub default_password_hash: String,
    pub grace_hours: i64,
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn apply_event(
        &self,
        event: &SubscriptionEvent,
        plan: &ResolvedPlan,
        dedup_key: &str,
        now: OffsetDateTime,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // The dedup insert is the serialization point: of two concurrent
        // deliveries of the same event, exactly one sees rows_affected == 1.
        let inserted = sqlx::query::<Postgres>(
            r#"
            INSERT INTO processed_events (dedup_key)
            VALUES ($1)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(dedup_key)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        let existing_user = sqlx::query_as::<Postgres, User>(
            "SELECT * FROM users WHERE email = $1 FOR UPDATE",
        )
        .bind(&event.email)
        .fetch_optional(&mut *tx)
        .await?;

        let existing_sub = match &existing_user {
            Some(user) => {
                sqlx::query_as::<Postgres, Subscription>(
                    r#"
                    SELECT * FROM subscriptions
                    WHERE user_id = $1
                    ORDER BY updated_at DESC
                    LIMIT 1
                    FOR UPDATE
                    "#,
                )
                .bind(user.id)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };

        let action = plan_action(event, plan, existing_sub.as_ref(), now, self.grace_hours);

        let outcome = match action {
            Action::Skip { reason } => {
                // Nothing was applied, so the dedup mark must not survive:
                // a skipped terminal event that arrived before its
                // activation has to be re-evaluated if it is redelivered.
                tx.rollback().await?;
                return Ok(ApplyOutcome::NoChange {
                    reason: reason.to_string(),
                });
            }
            Action::Activate { plan_type, start, end } => {
                let user_id = match &existing_user {
                    Some(user) => {
                        self.activate_user(&mut tx, user.id, event, plan_type, start, end)
                            .await?;
                        user.id
                    }
                    None => self.create_member(&mut tx, event, plan_type, start, end).await?,
                };

                let subscription_id = self
                    .upsert_subscription(&mut tx, user_id, existing_sub.as_ref(), event, plan_type, start, end, now)
                    .await?;

                ApplyOutcome::Applied {
                    user_id,
                    subscription_id,
                    transition: Transition::Activated {
                        plan_type,
                        end_date: end,
                    },
                }
            }
            Action::Terminate { status, downgrade_at } => {
                // The planner only terminates when a subscription row exists.
                let sub = match existing_sub.as_ref() {
                    Some(sub) => sub,
                    None => {
                        tx.rollback().await?;
                        return Err(sqlx::Error::Protocol(
                            "terminate planned without a subscription row".into(),
                        ));
                    }
                };

                sqlx::query::<Postgres>(
                    r#"
                    UPDATE subscriptions
                    SET status = $1, last_event = $2, updated_at = $3
                    WHERE id = $4
                    "#,
                )
                .bind(status)
                .bind(&event.event_type)
                .bind(now)
                .bind(sub.id)
                .execute(&mut *tx)
                .await?;

                match downgrade_at {
                    None => {
                        sqlx::query::<Postgres>(
                            r#"
                            UPDATE users
                            SET access_level = 'free',
                                plan_type = 'none',
                                subscription_expires_at = NULL
                            WHERE id = $1
                            "#,
                        )
                        .bind(sub.user_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    Some(deadline) => {
                        // Premium stays until the grace sweep passes the
                        // deadline stamped here.
                        sqlx::query::<Postgres>(
                            "UPDATE users SET subscription_expires_at = $1 WHERE id = $2",
                        )
                        .bind(deadline)
                        .bind(sub.user_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }

                ApplyOutcome::Applied {
                    user_id: sub.user_id,
                    subscription_id: sub.id,
                    transition: Transition::Terminated { status },
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn downgrade_lapsed_users(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let result = sqlx::query::<Postgres>(
            r#"
            UPDATE users
            SET access_level = 'free',
                plan_type = 'none',
                subscription_expires_at = NULL
            WHERE access_level = 'premium'
              AND plan_type <> 'lifetime'
              AND subscription_expires_at IS NOT NULL
              AND subscription_expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl PostgresSubscriptionStore {
    /// Grants premium on an existing account. Email, username, name and
    /// password are left exactly as they are.
    async fn activate_user(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        event: &SubscriptionEvent,
        plan_type: PlanType,
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            r#"
            UPDATE users
            SET access_level = 'premium',
                plan_type = $1,
                subscription_source = $2,
                subscription_started_at = $3,
                subscription_expires_at = $4,
                is_active = TRUE
            WHERE id = $5
            "#,
        )
        .bind(plan_type)
        .bind(SubscriptionSource::from(event.provider))
        .bind(start)
        .bind(end)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn create_member(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &SubscriptionEvent,
        plan_type: PlanType,
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
    ) -> Result<Uuid, sqlx::Error> {
        let username = self.pick_username(tx, &event.email).await?;
        let name = event.name.clone().unwrap_or_else(|| event.email.clone());

        let user_id: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO users (
                email, username, name, password_hash,
                access_level, plan_type, subscription_source,
                subscription_started_at, subscription_expires_at, is_active
            )
            VALUES ($1, $2, $3, $4, 'premium', $5, $6, $7, $8, TRUE)
            RETURNING id
            "#,
        )
        .bind(&event.email)
        .bind(&username)
        .bind(&name)
        .bind(&self.default_password_hash)
        .bind(plan_type)
        .bind(SubscriptionSource::from(event.provider))
        .bind(start)
        .bind(end)
        .fetch_one(&mut **tx)
        .await?;

        Ok(user_id)
    }

    async fn pick_username(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
    ) -> Result<String, sqlx::Error> {
        let base = username_base(email);
        for attempt in 0..40 {
            let candidate = username_candidate(&base, attempt);
            let conn: &mut PgConnection = &mut *tx;
            let taken = sqlx::query_scalar::<Postgres, i64>(
                "SELECT 1 FROM users WHERE username = $1",
            )
            .bind(&candidate)
            .fetch_optional(conn)
            .await?
            .is_some();
            if !taken {
                return Ok(candidate);
            }
        }
        // Random tails above make running out effectively impossible.
        Err(sqlx::Error::Protocol("could not allocate a username".into()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        existing: Option<&Subscription>,
        event: &SubscriptionEvent,
        plan_type: PlanType,
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<Uuid, sqlx::Error> {
        if let Some(sub) = existing {
            sqlx::query::<Postgres>(
                r#"
                UPDATE subscriptions
                SET plan_type = $1,
                    status = 'active',
                    start_date = $2,
                    end_date = $3,
                    origin = $4,
                    transaction_id = $5,
                    last_event = $6,
                    updated_at = $7
                WHERE id = $8
                "#,
            )
            .bind(plan_type)
            .bind(start)
            .bind(end)
            .bind(event.provider)
            .bind(&event.transaction_id)
            .bind(&event.event_type)
            .bind(now)
            .bind(sub.id)
            .execute(&mut **tx)
            .await?;
            return Ok(sub.id);
        }

        let id: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_type, status, start_date, end_date,
                origin, transaction_id, last_event
            )
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan_type)
        .bind(start)
        .bind(end)
        .bind(event.provider)
        .bind(&event.transaction_id)
        .bind(&event.event_type)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }
}
