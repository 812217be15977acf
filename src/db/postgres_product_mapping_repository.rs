use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use crate::db::product_mapping_repository::ProductMappingRepository;
use crate::models::product_mapping::ProductMapping;
use crate::models::provider::Provider;

pub struct PostgresProductMappingRepository {
    pub pool: PgPool,
}

#[async_trait]
impl ProductMappingRepository for PostgresProductMappingRepository {
    async fn find_by_offer(
        &self,
        provider: Provider,
        product_id: &str,
        offer_code: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error> {
        sqlx::query_as::<Postgres, ProductMapping>(
            r#"
            SELECT * FROM product_mappings
            WHERE provider = $1 AND product_id = $2 AND offer_code = $3
            "#,
        )
        .bind(provider)
        .bind(product_id)
        .bind(offer_code)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_default(
        &self,
        provider: Provider,
        product_id: &str,
    ) -> Result<Option<ProductMapping>, sqlx::Error> {
        sqlx::query_as::<Postgres, ProductMapping>(
            r#"
            SELECT * FROM product_mappings
            WHERE provider = $1 AND product_id = $2 AND offer_code IS NULL
            "#,
        )
        .bind(provider)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
    }
}
