use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{AnalysisRun, AnalysisRunItem, TokensUsed};

use super::Storage;

impl Storage {
    pub async fn create_analysis_run(
        &self,
        scope: &serde_json::Value,
        params: &serde_json::Value,
        scope_hash: &str,
        triggered_by: &str,
        cost_estimate: f64,
    ) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO analysis_runs (scope, params, scope_hash, triggered_by, cost_estimate, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id
            "#,
        )
        .bind(scope)
        .bind(params)
        .bind(scope_hash)
        .bind(triggered_by)
        .bind(cost_estimate)
        .fetch_one(&self.pool)
        .await
        .context("failed to create analysis run")
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<AnalysisRun>> {
        sqlx::query_as::<_, AnalysisRun>("SELECT * FROM analysis_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch analysis run")
    }

    pub async fn active_run_for_scope_hash(&self, scope_hash: &str) -> Result<Option<AnalysisRun>> {
        sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE scope_hash = $1
             AND status IN ('pending', 'running', 'paused')",
        )
        .bind(scope_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check for active run by scope hash")
    }

    pub async fn set_run_status(&self, run_id: i64, status: &str) -> Result<()> {
        let (started, completed) = match status {
            "running" => (Some(Utc::now()), None),
            "completed" | "failed" | "cancelled" => (None, Some(Utc::now())),
            _ => (None, None),
        };
        sqlx::query(
            r#"
            UPDATE analysis_runs SET status = $1, updated_at = now(),
                started_at = COALESCE($2, started_at),
                completed_at = COALESCE($3, completed_at)
            WHERE id = $4
            "#,
        )
        .bind(status)
        .bind(started)
        .bind(completed)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("failed to update run status")?;
        Ok(())
    }

    pub async fn set_run_last_error(&self, run_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE analysis_runs SET last_error = $1, updated_at = now() WHERE id = $2")
            .bind(error)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("failed to record run error")?;
        Ok(())
    }

    pub async fn pending_runs(&self, limit: i64) -> Result<Vec<AnalysisRun>> {
        sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE status IN ('pending', 'running')
             ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending/running runs")
    }

    pub async fn materialize_run_items(&self, run_id: i64, item_ids: &[i64]) -> Result<i64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let inserted: Vec<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO analysis_run_items (run_id, item_id, state)
            SELECT $1, unnest($2::bigint[]), 'queued'
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to materialize run items")?;

        sqlx::query("UPDATE analysis_runs SET queued_count = queued_count + $1 WHERE id = $2")
            .bind(inserted.len() as i32)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(inserted.len() as i64)
    }

    /// The pivot operation (§4.1/§4.8): select the oldest `queued` rows for
    /// this run, lock them skipping already-locked rows, and atomically flip
    /// them to `processing`. Disjoint across concurrent callers by
    /// construction of `FOR UPDATE SKIP LOCKED`.
    pub async fn claim_queued_run_items(
        &self,
        run_id: i64,
        chunk_size: i64,
    ) -> Result<Vec<AnalysisRunItem>> {
        sqlx::query_as::<_, AnalysisRunItem>(
            r#"
            WITH claimed AS (
                SELECT id FROM analysis_run_items
                WHERE run_id = $1 AND state = 'queued'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE analysis_run_items
            SET state = 'processing', started_at = now()
            WHERE id IN (SELECT id FROM claimed)
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(chunk_size)
        .fetch_all(&self.pool)
        .await
        .context("failed to claim queued run items")
    }

    /// Flip `processing` rows older than `max_age` back to `queued` (the
    /// only legal terminal->non-terminal transition, §8).
    pub async fn reset_stale_processing(&self, max_age: chrono::Duration) -> Result<i64> {
        let cutoff = Utc::now() - max_age;
        let rows = sqlx::query(
            "UPDATE analysis_run_items SET state = 'queued', started_at = NULL
             WHERE state = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("failed to reset stale processing items")?;
        Ok(rows.rows_affected() as i64)
    }

    pub async fn complete_run_item_success(
        &self,
        item_id: i64,
        sentiment: &serde_json::Value,
        impact: &serde_json::Value,
        model_tag: &str,
        tokens: TokensUsed,
        cost_usd: f64,
    ) -> Result<()> {
        let tokens_json = serde_json::to_value(tokens)?;
        let mut tx = self.pool.begin().await?;

        let run_id: i64 = sqlx::query_scalar(
            r#"
            UPDATE analysis_run_items
            SET state = 'completed', completed_at = now(), sentiment = $1, impact = $2,
                model_tag = $3, tokens_used = $4, cost_usd = $5
            WHERE id = $6
            RETURNING run_id
            "#,
        )
        .bind(sentiment)
        .bind(impact)
        .bind(model_tag)
        .bind(&tokens_json)
        .bind(cost_usd)
        .bind(item_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to complete run item")?;

        sqlx::query(
            "UPDATE analysis_runs SET processed_count = processed_count + 1,
             actual_cost = actual_cost + $1, updated_at = now() WHERE id = $2",
        )
        .bind(cost_usd)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn fail_run_item(&self, item_id: i64, error_message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let run_id: i64 = sqlx::query_scalar(
            "UPDATE analysis_run_items SET state = 'failed', completed_at = now(),
             error_message = $1 WHERE id = $2 RETURNING run_id",
        )
        .bind(error_message)
        .bind(item_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to mark run item failed")?;

        sqlx::query(
            "UPDATE analysis_runs SET failed_count = failed_count + 1, updated_at = now() WHERE id = $1",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Counts of remaining `queued`/`processing` rows for a run, used to
    /// decide run completion (§4.8 step 3).
    pub async fn run_item_remaining_counts(&self, run_id: i64) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'queued') AS queued,
                COUNT(*) FILTER (WHERE state = 'processing') AS processing
            FROM analysis_run_items WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count remaining run items")?;
        Ok(row)
    }

    /// Most recent `impact.overall` per item id, from completed run items
    /// (§4.8.1's `min_impact_threshold`/`max_impact_threshold` filters).
    /// Items with no completed analysis are absent from the returned map.
    pub async fn latest_impact_overall(&self, item_ids: &[i64]) -> Result<std::collections::HashMap<i64, f64>> {
        let rows: Vec<(i64, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (item_id) item_id, (impact->>'overall')::double precision
            FROM analysis_run_items
            WHERE item_id = ANY($1) AND state = 'completed' AND impact IS NOT NULL
            ORDER BY item_id, completed_at DESC
            "#,
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to load latest impact scores")?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, overall)| overall.map(|v| (id, v)))
            .collect())
    }

    pub async fn count_analyzed_items_since(&self, since: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM analysis_run_items WHERE state = 'completed' AND completed_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("failed to count analyzed items")
    }

    pub async fn count_created_items_since(&self, since: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .context("failed to count created items")
    }

    pub async fn count_running_runs(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM analysis_runs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await
            .context("failed to count running runs")
    }

    pub async fn count_runs_started_since(&self, since: DateTime<Utc>, auto_only: bool) -> Result<i64> {
        if auto_only {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM analysis_runs WHERE started_at >= $1 AND triggered_by = 'auto'",
            )
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .context("failed to count auto runs since")
        } else {
            sqlx::query_scalar("SELECT COUNT(*) FROM analysis_runs WHERE started_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .context("failed to count runs since")
        }
    }

    pub async fn update_run_slo_gauges(
        &self,
        run_id: i64,
        coverage_10m: f64,
        coverage_60m: f64,
        items_per_minute: f64,
        error_rate: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analysis_runs SET coverage_10m = $1, coverage_60m = $2,
                items_per_minute = $3, error_rate = $4, updated_at = now()
            WHERE id = $5
            "#,
        )
        .bind(coverage_10m)
        .bind(coverage_60m)
        .bind(items_per_minute)
        .bind(error_rate)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("failed to update run SLO gauges")?;
        Ok(())
    }
}
