use anyhow::{Context, Result};

use crate::models::PendingAutoAnalysis;

use super::Storage;

impl Storage {
    pub async fn insert_pending_auto_analysis(&self, feed_id: i64, item_ids: &[i64]) -> Result<i64> {
        let payload = serde_json::to_value(item_ids)?;
        sqlx::query_scalar(
            "INSERT INTO pending_auto_analysis (feed_id, item_ids) VALUES ($1, $2) RETURNING id",
        )
        .bind(feed_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert pending auto-analysis row")
    }

    pub async fn take_pending_auto_analysis(&self, limit: i64) -> Result<Vec<PendingAutoAnalysis>> {
        sqlx::query_as::<_, PendingAutoAnalysis>(
            "SELECT * FROM pending_auto_analysis WHERE status = 'pending'
             ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending auto-analysis rows")
    }

    pub async fn set_pending_auto_analysis_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE pending_auto_analysis SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to update pending auto-analysis status")?;
        Ok(())
    }
}
