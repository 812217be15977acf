use core::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::Type, FromRow};
use time::OffsetDateTime;

use crate::models::provider::Provider;

#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone)]
#[sqlx(type_name = "access_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Visitor,
    Free,
    Premium,
    Designer,
    Admin,
    Support,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessLevel::Visitor => "visitor",
            AccessLevel::Free => "free",
            AccessLevel::Premium => "premium",
            AccessLevel::Designer => "designer",
            AccessLevel::Admin => "admin",
            AccessLevel::Support => "support",
        };
        write!(f, "{}", s)
    }
}

#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone)]
#[sqlx(type_name = "plan_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    None,
    #[sqlx(rename = "free_trial")]
    #[serde(rename = "free_trial")]
    FreeTrial,
    Monthly,
    Annual,
    Lifetime,
    Custom,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::None => "none",
            PlanType::FreeTrial => "free_trial",
            PlanType::Monthly => "monthly",
            PlanType::Annual => "annual",
            PlanType::Lifetime => "lifetime",
            PlanType::Custom => "custom",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a user's current subscription was granted from.
#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone)]
#[sqlx(type_name = "subscription_source", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionSource {
    Manual,
    Hotmart,
    Doppus,
}

impl From<Provider> for SubscriptionSource {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Hotmart => SubscriptionSource::Hotmart,
            Provider::Doppus => SubscriptionSource::Doppus,
        }
    }
}

#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: uuid::Uuid,
    pub email: String,
    pub username: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub access_level: AccessLevel,
    pub plan_type: PlanType,
    pub subscription_source: Option<SubscriptionSource>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
