use anyhow::{Context, Result};
use chrono::NaiveDate;

use super::Storage;

/// One completed run-item sample fed into the daily/hourly rollups (§4.9).
pub struct MetricsSample {
    pub feed_id: i64,
    pub model: String,
    pub cost_usd: f64,
    pub processing_time_seconds: f64,
    pub failed: bool,
}

impl Storage {
    /// Upsert FeedMetrics(feed_id, today): increments counters and
    /// recomputes the weighted averages via `new_avg = (old*(n-1) + sample) / n`
    /// rather than overwriting (§3 invariant).
    pub async fn record_feed_metric(&self, sample: &MetricsSample, today: NaiveDate) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO feed_metrics (feed_id, metric_date, items_processed, items_failed, total_cost_usd, avg_processing_time_seconds)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (feed_id, metric_date) DO UPDATE SET
                items_processed = feed_metrics.items_processed + $3,
                items_failed = feed_metrics.items_failed + $4,
                total_cost_usd = feed_metrics.total_cost_usd + $5,
                avg_processing_time_seconds =
                    (feed_metrics.avg_processing_time_seconds * (feed_metrics.items_processed + feed_metrics.items_failed) + $6)
                    / (feed_metrics.items_processed + feed_metrics.items_failed + 1)
            "#,
        )
        .bind(sample.feed_id)
        .bind(today)
        .bind(if sample.failed { 0 } else { 1 })
        .bind(if sample.failed { 1 } else { 0 })
        .bind(sample.cost_usd)
        .bind(sample.processing_time_seconds)
        .execute(&mut *tx)
        .await
        .context("failed to upsert feed_metrics")?;

        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT per_model FROM feed_metrics WHERE feed_id = $1 AND metric_date = $2")
                .bind(sample.feed_id)
                .bind(today)
                .fetch_optional(&mut *tx)
                .await?;

        let mut per_model = row
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let entry = per_model
            .entry(sample.model.clone())
            .or_insert_with(|| serde_json::json!({"count": 0, "cost_usd": 0.0}));
        let count = entry.get("count").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        let cost = entry.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0) + sample.cost_usd;
        *entry = serde_json::json!({"count": count, "cost_usd": cost});

        sqlx::query("UPDATE feed_metrics SET per_model = $1 WHERE feed_id = $2 AND metric_date = $3")
            .bind(serde_json::Value::Object(per_model))
            .bind(sample.feed_id)
            .bind(today)
            .execute(&mut *tx)
            .await
            .context("failed to update feed_metrics.per_model")?;

        // avg_items_per_run: items_processed for this feed/day divided by
        // the number of distinct runs that contributed one of those items.
        sqlx::query(
            r#"
            UPDATE feed_metrics SET avg_items_per_run = items_processed::double precision / distinct_runs.n
            FROM (
                SELECT GREATEST(COUNT(DISTINCT ari.run_id), 1) AS n
                FROM analysis_run_items ari
                JOIN items i ON i.id = ari.item_id
                WHERE i.feed_id = $1 AND ari.state = 'completed' AND ari.completed_at::date = $2
            ) AS distinct_runs
            WHERE feed_id = $1 AND metric_date = $2
            "#,
        )
        .bind(sample.feed_id)
        .bind(today)
        .execute(&mut *tx)
        .await
        .context("failed to update feed_metrics.avg_items_per_run")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn record_queue_metric(
        &self,
        today: NaiveDate,
        hour: i32,
        sample: &MetricsSample,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_metrics (metric_date, metric_hour, items_processed, items_failed, total_cost_usd, avg_processing_time_seconds)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (metric_date, metric_hour) DO UPDATE SET
                items_processed = queue_metrics.items_processed + $3,
                items_failed = queue_metrics.items_failed + $4,
                total_cost_usd = queue_metrics.total_cost_usd + $5,
                avg_processing_time_seconds =
                    (queue_metrics.avg_processing_time_seconds * (queue_metrics.items_processed + queue_metrics.items_failed) + $6)
                    / (queue_metrics.items_processed + queue_metrics.items_failed + 1)
            "#,
        )
        .bind(today)
        .bind(hour)
        .bind(if sample.failed { 0 } else { 1 })
        .bind(if sample.failed { 1 } else { 0 })
        .bind(sample.cost_usd)
        .bind(sample.processing_time_seconds)
        .execute(&self.pool)
        .await
        .context("failed to upsert queue_metrics")?;
        Ok(())
    }

    pub async fn feed_metrics_for_day(&self, feed_id: i64, day: NaiveDate) -> Result<Option<serde_json::Value>> {
        let row: Option<(i32, i32, f64, f64, f64, serde_json::Value)> = sqlx::query_as(
            "SELECT items_processed, items_failed, total_cost_usd, avg_processing_time_seconds, avg_items_per_run, per_model
             FROM feed_metrics WHERE feed_id = $1 AND metric_date = $2",
        )
        .bind(feed_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read feed_metrics")?;

        Ok(row.map(|(processed, failed, cost, avg_time, avg_items, per_model)| {
            serde_json::json!({
                "items_processed": processed,
                "items_failed": failed,
                "total_cost_usd": cost,
                "avg_processing_time_seconds": avg_time,
                "avg_items_per_run": avg_items,
                "per_model": per_model,
            })
        }))
    }

    /// Top-spend feeds over the trailing `days` window.
    pub async fn top_spend_feeds(&self, days: i32, limit: i64) -> Result<Vec<(i64, f64)>> {
        sqlx::query_as(
            r#"
            SELECT feed_id, SUM(total_cost_usd) AS total
            FROM feed_metrics
            WHERE metric_date >= (CURRENT_DATE - $1::int)
            GROUP BY feed_id
            ORDER BY total DESC
            LIMIT $2
            "#,
        )
        .bind(days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to compute top-spend feeds")
    }
}
