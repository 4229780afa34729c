use chrono::Utc;
use tracing::{debug, info};

use super::{Database, StoreError};
use crate::models::{PLACEHOLDER_NAME, Product};

const PRODUCT_COLUMNS: &str = "id, url, name, image_url, active, last_success_at, last_failure_at, created_at, updated_at";

impl Database {
    pub async fn product(&self, id: i64) -> Result<Option<Product>, StoreError> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    pub async fn product_by_url(&self, url: &str) -> Result<Option<Product>, StoreError> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    pub async fn list_active_products(&self) -> Result<Vec<Product>, StoreError> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    /// Get-or-create the product for `url`.
    ///
    /// The unique index on `products.url` arbitrates concurrent first sightings:
    /// a resolver that loses the insert race re-reads and returns the winner's
    /// row, so every caller observes the same product id.
    pub async fn resolve_product(
        &self,
        url: &str,
        fallback_name: Option<&str>,
    ) -> Result<Product, StoreError> {
        if let Some(existing) = self.product_by_url(url).await? {
            return Ok(existing);
        }

        let name = fallback_name.unwrap_or(PLACEHOLDER_NAME);
        match self.insert_product(url, name).await {
            Ok(product) => {
                info!(product.id = product.id, %url, "Created product");
                Ok(product)
            }
            Err(StoreError::Conflict) => {
                debug!(%url, "Product created concurrently, re-reading");
                self.product_by_url(url).await?.ok_or(StoreError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Explicit, user-initiated creation. Idempotent on URL.
    pub async fn add_product(&self, url: &str, name: Option<&str>) -> Result<Product, StoreError> {
        self.resolve_product(url, name).await
    }

    async fn insert_product(&self, url: &str, name: &str) -> Result<Product, StoreError> {
        let now = Utc::now();
        let product = sqlx::query_as::<_, Product>(&format!(
            r"
            INSERT INTO products (url, name, active, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            RETURNING {PRODUCT_COLUMNS}
            "
        ))
        .bind(url)
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(product)
    }

    /// Replace a placeholder name and fill a missing image after a scrape.
    pub async fn update_product_details(
        &self,
        product: &Product,
        title: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Product, StoreError> {
        let name = match title {
            Some(title) if product.needs_name() => Some(title),
            _ => product.name.as_deref(),
        };
        let image_url = product.image_url.as_deref().or(image_url);

        if name == product.name.as_deref() && image_url == product.image_url.as_deref() {
            return Ok(product.clone());
        }

        let updated = sqlx::query_as::<_, Product>(&format!(
            "UPDATE products SET name = ?, image_url = ?, updated_at = ? WHERE id = ? RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(name)
        .bind(image_url)
        .bind(Utc::now())
        .bind(product.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    pub async fn mark_success(&self, product_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query("UPDATE products SET last_success_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failure(&self, product_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query("UPDATE products SET last_failure_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-(de)activate a product. Inactive products are skipped by digests.
    pub async fn set_active(&self, product_id: i64, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE products SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(product_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Hard-delete a product together with its price history and run logs.
    pub async fn delete_product(&self, product_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // run_logs carries no foreign key, so it is not covered by the cascade
        sqlx::query("DELETE FROM run_logs WHERE product_id = ?")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        info!(product.id = product_id, "Deleted product");
        Ok(())
    }
}
