use chrono::{DateTime, Utc};

use super::{Database, StoreError};
use crate::models::PriceRecord;

impl Database {
    pub async fn insert_price_record(
        &self,
        product_id: i64,
        price_cents: i64,
        currency: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<PriceRecord, StoreError> {
        let record = sqlx::query_as::<_, PriceRecord>(
            r"
            INSERT INTO price_records (product_id, price_cents, currency, captured_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, product_id, price_cents, currency, captured_at
            ",
        )
        .bind(product_id)
        .bind(price_cents)
        .bind(currency)
        .bind(captured_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Full history for a product, newest first.
    pub async fn price_history(&self, product_id: i64) -> Result<Vec<PriceRecord>, StoreError> {
        let records = sqlx::query_as::<_, PriceRecord>(
            r"
            SELECT id, product_id, price_cents, currency, captured_at
            FROM price_records
            WHERE product_id = ?
            ORDER BY captured_at DESC, id DESC
            ",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Records captured at or after `since`, plus the two most recent records
    /// regardless of age, newest first.
    ///
    /// Read in one statement so the latest/previous pair and the windowed
    /// records come from the same snapshot.
    pub async fn recent_price_records(
        &self,
        product_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceRecord>, StoreError> {
        let records = sqlx::query_as::<_, PriceRecord>(
            r"
            SELECT id, product_id, price_cents, currency, captured_at
            FROM price_records
            WHERE product_id = ?1
              AND (
                captured_at >= ?2
                OR id IN (
                    SELECT id FROM price_records
                    WHERE product_id = ?1
                    ORDER BY captured_at DESC, id DESC
                    LIMIT 2
                )
              )
            ORDER BY captured_at DESC, id DESC
            ",
        )
        .bind(product_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
