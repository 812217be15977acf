use core::fmt;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::models::provider::Provider;
use crate::webhook::event::{EventKind, SubscriptionEvent};

#[derive(Debug, PartialEq, Eq)]
pub enum NormalizeError {
    InvalidJson(String),
    MissingField(&'static str),
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::InvalidJson(e) => write!(f, "invalid JSON body: {}", e),
            NormalizeError::MissingField(field) => write!(f, "missing required field: {}", field),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Maps a raw provider body into the internal event shape. Only `email` and
/// the event-type string are mandatory; everything else degrades to `None`.
pub fn normalize(
    provider: Provider,
    body: &[u8],
    now: OffsetDateTime,
) -> Result<SubscriptionEvent, NormalizeError> {
    match provider {
        Provider::Hotmart => normalize_hotmart(body, now),
        Provider::Doppus => normalize_doppus(body, now),
    }
}

fn clean_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

fn clean_opt(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// -- Hotmart ---------------------------------------------------------------

#[derive(Deserialize)]
struct HotmartPayload {
    event: Option<String>,
    creation_date: Option<i64>,
    data: Option<HotmartData>,
}

#[derive(Deserialize)]
struct HotmartData {
    buyer: Option<HotmartBuyer>,
    purchase: Option<HotmartPurchase>,
    product: Option<HotmartProduct>,
    subscription: Option<HotmartSubscription>,
}

#[derive(Deserialize)]
struct HotmartBuyer {
    email: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct HotmartPurchase {
    transaction: Option<String>,
    order_date: Option<i64>,
    offer: Option<HotmartOffer>,
}

#[derive(Deserialize)]
struct HotmartOffer {
    code: Option<String>,
}

#[derive(Deserialize)]
struct HotmartProduct {
    // Hotmart sends numeric product ids; tolerate strings as well.
    id: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct HotmartSubscription {
    plan: Option<HotmartPlan>,
}

#[derive(Deserialize)]
struct HotmartPlan {
    name: Option<String>,
}

fn normalize_hotmart(body: &[u8], now: OffsetDateTime) -> Result<SubscriptionEvent, NormalizeError> {
    let payload: HotmartPayload =
        serde_json::from_slice(body).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;

    let event_type = payload
        .event
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingField("event"))?
        .to_string();

    let data = payload.data;
    let buyer = data.as_ref().and_then(|d| d.buyer.as_ref());
    let email = buyer
        .and_then(|b| b.email.as_deref())
        .and_then(clean_email)
        .ok_or(NormalizeError::MissingField("data.buyer.email"))?;

    let purchase = data.as_ref().and_then(|d| d.purchase.as_ref());
    let occurred_at = payload
        .creation_date
        .or_else(|| purchase.and_then(|p| p.order_date))
        .and_then(epoch_millis_to_utc)
        .unwrap_or(now);

    let product_id = data
        .as_ref()
        .and_then(|d| d.product.as_ref())
        .and_then(|p| p.id.as_ref())
        .and_then(json_id_to_string);

    Ok(SubscriptionEvent {
        provider: Provider::Hotmart,
        kind: EventKind::from_hotmart(&event_type),
        email,
        name: clean_opt(buyer.and_then(|b| b.name.clone())),
        transaction_id: clean_opt(purchase.and_then(|p| p.transaction.clone())),
        product_id,
        offer_code: clean_opt(purchase.and_then(|p| p.offer.as_ref()).and_then(|o| o.code.clone())),
        plan_name_hint: clean_opt(
            data.as_ref()
                .and_then(|d| d.subscription.as_ref())
                .and_then(|s| s.plan.as_ref())
                .and_then(|p| p.name.clone()),
        ),
        event_type,
        occurred_at,
    })
}

fn epoch_millis_to_utc(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(millis / 1000).ok()
}

fn json_id_to_string(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// -- Doppus ----------------------------------------------------------------

#[derive(Deserialize)]
struct DoppusPayload {
    customer: Option<DoppusCustomer>,
    items: Option<Vec<DoppusItem>>,
    transaction: Option<DoppusTransaction>,
    status: Option<DoppusStatus>,
}

#[derive(Deserialize)]
struct DoppusCustomer {
    email: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct DoppusItem {
    offer: Option<String>,
    offer_name: Option<String>,
}

#[derive(Deserialize)]
struct DoppusTransaction {
    code: Option<String>,
}

#[derive(Deserialize)]
struct DoppusStatus {
    code: Option<String>,
}

fn normalize_doppus(body: &[u8], now: OffsetDateTime) -> Result<SubscriptionEvent, NormalizeError> {
    let payload: DoppusPayload =
        serde_json::from_slice(body).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;

    let event_type = payload
        .status
        .as_ref()
        .and_then(|s| s.code.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingField("status.code"))?
        .to_string();

    let email = payload
        .customer
        .as_ref()
        .and_then(|c| c.email.as_deref())
        .and_then(clean_email)
        .ok_or(NormalizeError::MissingField("customer.email"))?;

    // Doppus identifies what was bought by the offer code alone, so the
    // offer doubles as the product key for mapping lookups.
    let item = payload.items.as_ref().and_then(|items| items.first());
    let offer = clean_opt(item.and_then(|i| i.offer.clone()));

    Ok(SubscriptionEvent {
        provider: Provider::Doppus,
        kind: EventKind::from_doppus(&event_type),
        email,
        name: clean_opt(payload.customer.as_ref().and_then(|c| c.name.clone())),
        transaction_id: clean_opt(payload.transaction.as_ref().and_then(|t| t.code.clone())),
        product_id: offer.clone(),
        offer_code: None,
        plan_name_hint: clean_opt(item.and_then(|i| i.offer_name.clone())),
        event_type,
        occurred_at: now,
    })
}
