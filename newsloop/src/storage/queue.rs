use anyhow::{Context, Result};

use crate::models::QueuedRun;

use super::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    Duplicate,
}

impl Storage {
    /// The C6 single-`{QUEUED,RUNNING}`-per-scope_hash invariant (spec.md
    /// §3/§8): is there already a queued-or-running row for this scope?
    /// Shared by `enqueue_run`'s own dedup check and the admission
    /// controller's duplicate check, since a queued manual run has no
    /// `analysis_runs` row yet for `active_run_for_scope_hash` to see.
    pub async fn active_queued_run_for_scope_hash(&self, scope_hash: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM queued_runs WHERE scope_hash = $1 AND status IN ('QUEUED', 'RUNNING')",
        )
        .bind(scope_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check for duplicate queued run")
    }

    pub async fn enqueue_run(
        &self,
        priority: &str,
        scope_hash: &str,
        scope_json: &serde_json::Value,
        params_json: &serde_json::Value,
    ) -> Result<EnqueueOutcome> {
        if self.active_queued_run_for_scope_hash(scope_hash).await?.is_some() {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queued_runs (priority, scope_hash, scope_json, params_json)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(priority)
        .bind(scope_hash)
        .bind(scope_json)
        .bind(params_json)
        .fetch_one(&self.pool)
        .await
        .context("failed to enqueue run")?;

        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Dequeue the next run: priority desc, then created_at asc. Atomically
    /// flips the winning row to RUNNING.
    pub async fn dequeue_run(&self) -> Result<Option<QueuedRun>> {
        sqlx::query_as::<_, QueuedRun>(
            r#"
            WITH next AS (
                SELECT id FROM queued_runs
                WHERE status = 'QUEUED'
                ORDER BY CASE priority WHEN 'HIGH' THEN 2 WHEN 'MEDIUM' THEN 1 ELSE 0 END DESC,
                         created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE queued_runs
            SET status = 'RUNNING', started_at = now()
            WHERE id IN (SELECT id FROM next)
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to dequeue run")
    }

    pub async fn mark_queued_run_completed(&self, id: i64, analysis_run_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE queued_runs SET status = 'COMPLETED', analysis_run_id = $1 WHERE id = $2",
        )
        .bind(analysis_run_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark queued run completed")?;
        Ok(())
    }

    pub async fn mark_queued_run_failed(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query("UPDATE queued_runs SET status = 'FAILED', error_message = $1 WHERE id = $2")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark queued run failed")?;
        Ok(())
    }

    pub async fn cancel_queued_run(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queued_runs SET status = 'CANCELLED' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to cancel queued run")?;
        Ok(())
    }

    /// Emergency stop: flip all QUEUED rows to CANCELLED, return count.
    pub async fn clear_queue(&self) -> Result<i64> {
        let result = sqlx::query("UPDATE queued_runs SET status = 'CANCELLED' WHERE status = 'QUEUED'")
            .execute(&self.pool)
            .await
            .context("failed to clear queue")?;
        Ok(result.rows_affected() as i64)
    }

    pub async fn queue_status_counts(&self) -> Result<Vec<(String, String, i64)>> {
        sqlx::query_as(
            "SELECT status, priority, COUNT(*) FROM queued_runs GROUP BY status, priority",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to compute queue status counts")
    }

    /// List the most recent queued runs with `queue_position` populated for
    /// QUEUED rows (§11): a row's position is the count of other QUEUED rows
    /// ranked ahead of it by priority then age.
    pub async fn queue_list(&self, limit: i64) -> Result<Vec<QueuedRun>> {
        sqlx::query_as::<_, QueuedRun>(
            r#"
            SELECT *, CASE WHEN status = 'QUEUED' THEN (
                SELECT COUNT(*) FROM queued_runs other
                WHERE other.status = 'QUEUED'
                  AND (
                    CASE other.priority WHEN 'HIGH' THEN 2 WHEN 'MEDIUM' THEN 1 ELSE 0 END
                    > CASE queued_runs.priority WHEN 'HIGH' THEN 2 WHEN 'MEDIUM' THEN 1 ELSE 0 END
                    OR (other.priority = queued_runs.priority AND other.created_at < queued_runs.created_at)
                  )
            ) END AS queue_position
            FROM queued_runs ORDER BY created_at DESC LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list queued runs")
    }

}
