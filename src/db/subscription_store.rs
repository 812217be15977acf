use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::subscription::SubscriptionStatus;
use crate::models::user::PlanType;
use crate::webhook::event::SubscriptionEvent;
use crate::webhook::mapper::ResolvedPlan;

/// State change applied by the store, used to drive notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Activated {
        plan_type: PlanType,
        end_date: Option<OffsetDateTime>,
    },
    Terminated {
        status: SubscriptionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The dedup key was already recorded; nothing was mutated.
    Duplicate,
    /// Valid delivery with no state to change (e.g. cancel with no
    /// subscription on file). The dedup key is still recorded.
    NoChange { reason: String },
    Applied {
        user_id: Uuid,
        subscription_id: Uuid,
        transition: Transition,
    },
}

/// The single atomic unit of webhook processing: dedup-mark, user upsert
/// and subscription mutation happen inside one database transaction so two
/// concurrent deliveries of the same event can never both apply.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn apply_event(
        &self,
        event: &SubscriptionEvent,
        plan: &ResolvedPlan,
        dedup_key: &str,
        now: OffsetDateTime,
    ) -> Result<ApplyOutcome, sqlx::Error>;

    /// Grace sweep: finish the deferred downgrade for premium users whose
    /// expiry timestamp has passed. Returns the number of users downgraded.
    async fn downgrade_lapsed_users(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error>;
}
