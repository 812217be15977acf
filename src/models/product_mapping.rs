use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::provider::Provider;
use crate::models::user::PlanType;

/// Admin-managed reference data resolving a provider product/offer pair to
/// an internal plan. A row with `offer_code = NULL` is the default mapping
/// for its product; at most one such row exists per (provider, product_id).
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct ProductMapping {
    pub id: Uuid,
    pub provider: Provider,
    pub product_id: String,
    pub offer_code: Option<String>,
    pub plan_type: PlanType,
    pub duration_days: i32,
}
