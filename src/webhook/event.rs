use core::fmt;

use time::OffsetDateTime;

use crate::models::provider::Provider;

/// Internal classification of a provider event. Unrecognized event strings
/// are kept verbatim in [`SubscriptionEvent::event_type`] and classified as
/// `Unknown` so they still land in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Approved,
    Canceled,
    Refunded,
    Disputed,
    Expired,
    Unknown,
}

impl EventKind {
    pub fn from_hotmart(event: &str) -> EventKind {
        match event {
            "PURCHASE_APPROVED" | "SUBSCRIPTION_ACTIVATED" => EventKind::Approved,
            "SUBSCRIPTION_CANCELLATION" | "SUBSCRIPTION_CANCELLED" | "PURCHASE_CANCELED" => {
                EventKind::Canceled
            }
            "PURCHASE_REFUNDED" => EventKind::Refunded,
            "PURCHASE_PROTEST" => EventKind::Disputed,
            "SUBSCRIPTION_EXPIRED" => EventKind::Expired,
            _ => EventKind::Unknown,
        }
    }

    pub fn from_doppus(status_code: &str) -> EventKind {
        match status_code.to_ascii_lowercase().as_str() {
            "approved" => EventKind::Approved,
            "reversed" => EventKind::Refunded,
            "canceled" => EventKind::Canceled,
            _ => EventKind::Unknown,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Approved => "approved",
            EventKind::Canceled => "canceled",
            EventKind::Refunded => "refunded",
            EventKind::Disputed => "disputed",
            EventKind::Expired => "expired",
            EventKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Provider-neutral shape every inbound payload is normalized into before
/// any state is touched.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub provider: Provider,
    pub kind: EventKind,
    /// Provider event string, verbatim.
    pub event_type: String,
    /// Case-folded, trimmed.
    pub email: String,
    pub name: Option<String>,
    pub transaction_id: Option<String>,
    pub product_id: Option<String>,
    pub offer_code: Option<String>,
    pub plan_name_hint: Option<String>,
    pub occurred_at: OffsetDateTime,
}
