use time::{Duration, OffsetDateTime};

use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::models::user::PlanType;
use crate::webhook::event::{EventKind, SubscriptionEvent};
use crate::webhook::mapper::ResolvedPlan;

/// What the store should do with a normalized event. Computed purely from
/// the event and the current subscription row so that the Postgres and
/// in-memory stores apply identical rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create or reactivate the subscription window and grant premium.
    Activate {
        plan_type: PlanType,
        start: OffsetDateTime,
        /// None for lifetime plans.
        end: Option<OffsetDateTime>,
    },
    /// Retire the subscription. `downgrade_at == None` downgrades the user
    /// immediately; `Some(t)` leaves premium in place until the grace sweep
    /// passes `t`.
    Terminate {
        status: SubscriptionStatus,
        downgrade_at: Option<OffsetDateTime>,
    },
    /// Valid delivery, nothing to change.
    Skip { reason: &'static str },
}

pub fn plan_action(
    event: &SubscriptionEvent,
    plan: &ResolvedPlan,
    existing: Option<&Subscription>,
    now: OffsetDateTime,
    grace_hours: i64,
) -> Action {
    match event.kind {
        EventKind::Approved => {
            let end = if plan.plan_type == PlanType::Lifetime {
                None
            } else {
                Some(event.occurred_at + Duration::days(i64::from(plan.duration_days)))
            };
            Action::Activate {
                plan_type: plan.plan_type,
                start: event.occurred_at,
                end,
            }
        }
        EventKind::Canceled | EventKind::Refunded | EventKind::Disputed => {
            if existing.is_none() {
                return Action::Skip {
                    reason: "no subscription on file for this user",
                };
            }
            Action::Terminate {
                status: terminal_status(event.kind),
                downgrade_at: grace_deadline(now, grace_hours),
            }
        }
        EventKind::Expired => {
            let sub = match existing {
                Some(s) => s,
                None => {
                    return Action::Skip {
                        reason: "no subscription on file for this user",
                    }
                }
            };
            match sub.end_date {
                None => Action::Skip {
                    reason: "lifetime subscription does not expire",
                },
                Some(end) if end > now => Action::Skip {
                    reason: "subscription end date is still in the future",
                },
                Some(_) => Action::Terminate {
                    status: SubscriptionStatus::Expired,
                    downgrade_at: grace_deadline(now, grace_hours),
                },
            }
        }
        EventKind::Unknown => Action::Skip {
            reason: "unhandled event type",
        },
    }
}

fn terminal_status(kind: EventKind) -> SubscriptionStatus {
    match kind {
        EventKind::Canceled => SubscriptionStatus::Canceled,
        EventKind::Refunded => SubscriptionStatus::Refunded,
        EventKind::Disputed => SubscriptionStatus::Disputed,
        EventKind::Expired => SubscriptionStatus::Expired,
        EventKind::Approved | EventKind::Unknown => unreachable!("not a terminal event"),
    }
}

fn grace_deadline(now: OffsetDateTime, grace_hours: i64) -> Option<OffsetDateTime> {
    if grace_hours > 0 {
        Some(now + Duration::hours(grace_hours))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::Provider;
    use uuid::Uuid;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn event(kind: EventKind) -> SubscriptionEvent {
        SubscriptionEvent {
            provider: Provider::Hotmart,
            kind,
            event_type: "TEST".into(),
            email: "a@x.com".into(),
            name: None,
            transaction_id: Some("T1".into()),
            product_id: Some("4412".into()),
            offer_code: None,
            plan_name_hint: None,
            occurred_at: now(),
        }
    }

    fn annual_plan() -> ResolvedPlan {
        ResolvedPlan {
            plan_type: PlanType::Annual,
            duration_days: 365,
            fallback: false,
        }
    }

    fn active_sub(end: Option<OffsetDateTime>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_type: PlanType::Annual,
            status: SubscriptionStatus::Active,
            start_date: now() - Duration::days(30),
            end_date: end,
            origin: Provider::Hotmart,
            transaction_id: Some("T0".into()),
            last_event: "PURCHASE_APPROVED".into(),
            created_at: now() - Duration::days(30),
            updated_at: now() - Duration::days(30),
        }
    }

    #[test]
    fn approval_activates_with_computed_end_date() {
        let action = plan_action(&event(EventKind::Approved), &annual_plan(), None, now(), 0);
        match action {
            Action::Activate { plan_type, start, end } => {
                assert_eq!(plan_type, PlanType::Annual);
                assert_eq!(start, now());
                assert_eq!(end, Some(now() + Duration::days(365)));
            }
            other => panic!("expected Activate, got {:?}", other),
        }
    }

    #[test]
    fn approval_of_lifetime_plan_has_no_end_date() {
        let plan = ResolvedPlan {
            plan_type: PlanType::Lifetime,
            duration_days: 0,
            fallback: false,
        };
        let action = plan_action(&event(EventKind::Approved), &plan, None, now(), 0);
        assert!(matches!(action, Action::Activate { end: None, .. }));
    }

    #[test]
    fn approval_reactivates_over_prior_terminal_state() {
        let mut sub = active_sub(Some(now() - Duration::days(1)));
        sub.status = SubscriptionStatus::Canceled;
        let action =
            plan_action(&event(EventKind::Approved), &annual_plan(), Some(&sub), now(), 0);
        assert!(matches!(action, Action::Activate { .. }));
    }

    #[test]
    fn cancellation_without_subscription_is_skipped() {
        let action = plan_action(&event(EventKind::Canceled), &annual_plan(), None, now(), 0);
        assert!(matches!(action, Action::Skip { .. }));
    }

    #[test]
    fn refund_terminates_and_downgrades_immediately_without_grace() {
        let sub = active_sub(Some(now() + Duration::days(100)));
        let action =
            plan_action(&event(EventKind::Refunded), &annual_plan(), Some(&sub), now(), 0);
        assert_eq!(
            action,
            Action::Terminate {
                status: SubscriptionStatus::Refunded,
                downgrade_at: None
            }
        );
    }

    #[test]
    fn grace_period_defers_the_downgrade() {
        let sub = active_sub(Some(now() + Duration::days(100)));
        let action =
            plan_action(&event(EventKind::Canceled), &annual_plan(), Some(&sub), now(), 48);
        assert_eq!(
            action,
            Action::Terminate {
                status: SubscriptionStatus::Canceled,
                downgrade_at: Some(now() + Duration::hours(48))
            }
        );
    }

    #[test]
    fn dispute_maps_to_disputed_status() {
        let sub = active_sub(Some(now() + Duration::days(10)));
        let action =
            plan_action(&event(EventKind::Disputed), &annual_plan(), Some(&sub), now(), 0);
        assert!(matches!(
            action,
            Action::Terminate {
                status: SubscriptionStatus::Disputed,
                ..
            }
        ));
    }

    #[test]
    fn expiry_requires_the_end_date_to_have_passed() {
        let sub = active_sub(Some(now() + Duration::days(10)));
        let action =
            plan_action(&event(EventKind::Expired), &annual_plan(), Some(&sub), now(), 0);
        assert!(matches!(action, Action::Skip { .. }));

        let sub = active_sub(Some(now() - Duration::days(1)));
        let action =
            plan_action(&event(EventKind::Expired), &annual_plan(), Some(&sub), now(), 0);
        assert!(matches!(
            action,
            Action::Terminate {
                status: SubscriptionStatus::Expired,
                ..
            }
        ));
    }

    #[test]
    fn lifetime_subscription_never_expires() {
        let sub = active_sub(None);
        let action =
            plan_action(&event(EventKind::Expired), &annual_plan(), Some(&sub), now(), 0);
        assert!(matches!(action, Action::Skip { .. }));
    }

    #[test]
    fn unknown_event_changes_nothing() {
        let sub = active_sub(Some(now() + Duration::days(10)));
        let action =
            plan_action(&event(EventKind::Unknown), &annual_plan(), Some(&sub), now(), 0);
        assert_eq!(
            action,
            Action::Skip {
                reason: "unhandled event type"
            }
        );
    }
}
