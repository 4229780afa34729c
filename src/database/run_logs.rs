use chrono::Utc;

use super::{Database, StoreError};
use crate::models::{RunLog, RunStatus};

impl Database {
    pub async fn insert_run_log(
        &self,
        product_id: Option<i64>,
        url: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<RunLog, StoreError> {
        let log = sqlx::query_as::<_, RunLog>(
            r"
            INSERT INTO run_logs (product_id, url, status, error, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, product_id, url, status, error, created_at
            ",
        )
        .bind(product_id)
        .bind(url)
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(log)
    }

    /// Most recent run logs for a product, newest first.
    pub async fn run_logs(&self, product_id: i64, limit: i64) -> Result<Vec<RunLog>, StoreError> {
        let logs = sqlx::query_as::<_, RunLog>(
            r"
            SELECT id, product_id, url, status, error, created_at
            FROM run_logs
            WHERE product_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(product_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    pub async fn run_logs_for_url(&self, url: &str) -> Result<Vec<RunLog>, StoreError> {
        let logs = sqlx::query_as::<_, RunLog>(
            r"
            SELECT id, product_id, url, status, error, created_at
            FROM run_logs
            WHERE url = ?
            ORDER BY created_at DESC, id DESC
            ",
        )
        .bind(url)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}
