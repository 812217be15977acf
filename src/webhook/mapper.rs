use tracing::warn;

use crate::db::product_mapping_repository::ProductMappingRepository;
use crate::models::provider::Provider;
use crate::models::user::PlanType;

/// Plan resolved for an event. `fallback` marks deliveries that matched no
/// mapping row and degraded to the zero-day trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub plan_type: PlanType,
    pub duration_days: i32,
    pub fallback: bool,
}

impl ResolvedPlan {
    fn fallback() -> Self {
        ResolvedPlan {
            plan_type: PlanType::FreeTrial,
            duration_days: 0,
            fallback: true,
        }
    }
}

/// Resolution order: exact (product, offer) match, then the product's
/// NULL-offer default, then the global free-trial fallback. Never fails;
/// lookup errors degrade to the fallback so the pipeline always completes.
pub async fn resolve(
    repo: &dyn ProductMappingRepository,
    provider: Provider,
    product_id: Option<&str>,
    offer_code: Option<&str>,
) -> ResolvedPlan {
    let product_id = match product_id {
        Some(id) => id,
        None => {
            warn!(%provider, "event carries no product id; falling back to free trial");
            return ResolvedPlan::fallback();
        }
    };

    if let Some(offer) = offer_code {
        match repo.find_by_offer(provider, product_id, offer).await {
            Ok(Some(m)) => {
                return ResolvedPlan {
                    plan_type: m.plan_type,
                    duration_days: m.duration_days,
                    fallback: false,
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(?err, %provider, product_id, offer, "mapping lookup failed; falling back");
                return ResolvedPlan::fallback();
            }
        }
    }

    match repo.find_default(provider, product_id).await {
        Ok(Some(m)) => ResolvedPlan {
            plan_type: m.plan_type,
            duration_days: m.duration_days,
            fallback: false,
        },
        Ok(None) => {
            warn!(
                %provider,
                product_id,
                offer = offer_code.unwrap_or("-"),
                "no product mapping found; falling back to free trial"
            );
            ResolvedPlan::fallback()
        }
        Err(err) => {
            warn!(?err, %provider, product_id, "mapping lookup failed; falling back");
            ResolvedPlan::fallback()
        }
    }
}
