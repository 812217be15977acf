use async_trait::async_trait;

use crate::models::product_mapping::ProductMapping;
use crate::models::provider::Provider;

#[async_trait]
pub trait ProductMappingRepository: Send + Sync {
    /// Exact (provider, product, offer) match.
    async fn find_by_offer(
        &self,
        provider: Provider,
        product_id: &str,
        offer_code: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error>;

    /// Default mapping for the product, i.e. the row with a NULL offer code.
    async fn find_default(
        &self,
        provider: Provider,
        product_id: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error>;
}
