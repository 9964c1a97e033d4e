use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{Feed, FeedHealth, FetchLog, FetchOutcome};

use super::Storage;

impl Storage {
    pub async fn list_active_feeds(&self) -> Result<Vec<Feed>> {
        sqlx::query_as::<_, Feed>(
            "SELECT * FROM feeds WHERE status = 'active' AND archived_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active feeds")
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = $1")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch feed")
    }

    /// Create a feed and append the corresponding config-change row in the
    /// same transaction (§6 inbound command contract).
    pub async fn create_feed(&self, url: &str, title: Option<&str>) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let feed_id: i64 = sqlx::query_scalar(
            "INSERT INTO feeds (url, title) VALUES ($1, $2) RETURNING id",
        )
        .bind(url)
        .bind(title)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert feed")?;

        sqlx::query(
            "INSERT INTO feed_configuration_changes (change_type, feed_id, new_config)
             VALUES ('feed_created', $1, $2)",
        )
        .bind(feed_id)
        .bind(serde_json::json!({"url": url, "title": title}))
        .execute(&mut *tx)
        .await
        .context("failed to append config change")?;

        tx.commit().await?;
        Ok(feed_id)
    }

    /// Pre-flight check for critical-feed deletion (§9 design note): report
    /// referencing row counts so a caller can decide archive vs. delete.
    pub async fn feed_deletion_preflight(&self, feed_id: i64) -> Result<FeedDeletionPreflight> {
        let feed = self
            .get_feed(feed_id)
            .await?
            .context("feed not found")?;

        let item_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;

        let can_delete = !(feed.is_critical && item_count > 0);

        Ok(FeedDeletionPreflight {
            feed_id,
            is_critical: feed.is_critical,
            referencing_items: item_count,
            can_delete,
        })
    }

    /// Archive a feed instead of deleting it (recommended workflow for
    /// is_critical feeds with referencing rows).
    pub async fn archive_feed(&self, feed_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE feeds SET status = 'inactive', archived_at = now() WHERE id = $1",
        )
        .bind(feed_id)
        .execute(&mut *tx)
        .await
        .context("failed to archive feed")?;

        sqlx::query(
            "INSERT INTO feed_configuration_changes (change_type, feed_id, new_config)
             VALUES ('feed_updated', $1, $2)",
        )
        .bind(feed_id)
        .bind(serde_json::json!({"status": "inactive", "archived": true}))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_fetch_log_running(&self, feed_id: i64, started_at: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO fetch_log (feed_id, started_at, status) VALUES ($1, $2, 'running') RETURNING id",
        )
        .bind(feed_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert running fetch_log row")
    }

    /// Single transaction covering feed row update, fetch_log completion and
    /// feed_health recompute — the multi-table write path described in §4.1.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_fetch(
        &self,
        fetch_log_id: i64,
        feed_id: i64,
        outcome: FetchOutcome,
        items_found: i32,
        items_new: i32,
        response_time_ms: i64,
        error_message: Option<&str>,
        feed_updates: Option<FeedFetchUpdate>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE fetch_log SET completed_at = now(), status = $1, items_found = $2,
             items_new = $3, response_time_ms = $4, error_message = $5 WHERE id = $6",
        )
        .bind(outcome.as_str())
        .bind(items_found)
        .bind(items_new)
        .bind(response_time_ms as i32)
        .bind(error_message)
        .bind(fetch_log_id)
        .execute(&mut *tx)
        .await
        .context("failed to complete fetch_log row")?;

        // `last_fetched` advances on any non-error completion, including a
        // 304 that carries no other feed_updates (the fetcher only returns
        // etag/last_modified/title/status when the body was actually
        // re-parsed) — otherwise a feed that only ever returns 304 would
        // keep a stale `last_fetched`, which interval-change recomputation
        // (spec.md §4.5) reads.
        if let Some(update) = feed_updates {
            sqlx::query(
                "UPDATE feeds SET last_fetched = now(), etag = COALESCE($1, etag),
                 last_modified = COALESCE($2, last_modified),
                 title = COALESCE(NULLIF(title, ''), $3),
                 status = $4 WHERE id = $5",
            )
            .bind(update.etag)
            .bind(update.last_modified)
            .bind(update.title)
            .bind(update.status)
            .bind(feed_id)
            .execute(&mut *tx)
            .await
            .context("failed to update feed after fetch")?;
        } else if !matches!(outcome, FetchOutcome::Error) {
            sqlx::query("UPDATE feeds SET last_fetched = now() WHERE id = $1")
                .bind(feed_id)
                .execute(&mut *tx)
                .await
                .context("failed to update feed last_fetched after fetch")?;
        }

        self.upsert_feed_health(&mut tx, feed_id, matches!(outcome, FetchOutcome::Error))
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Recomputes `ok_ratio`/`uptime_24h`/`uptime_7d`/`avg_response_time_ms`
    /// from the FetchLog windows (§3 FeedHealth: "Recomputed from FetchLog
    /// windows on each fetch completion"), rather than folding them in
    /// incrementally. `consecutive_failures`/`last_success`/`last_failure`
    /// remain incremental counters since they have no natural "window".
    async fn upsert_feed_health(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        feed_id: i64,
        is_failure: bool,
    ) -> Result<()> {
        let windows: (f64, f64, f64, f64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(AVG((status IN ('success', 'not_modified'))::int::float), 1.0) AS ok_ratio,
                COALESCE(AVG((status IN ('success', 'not_modified'))::int::float) FILTER (WHERE started_at >= now() - interval '24 hours'), 1.0) AS uptime_24h,
                COALESCE(AVG((status IN ('success', 'not_modified'))::int::float) FILTER (WHERE started_at >= now() - interval '7 days'), 1.0) AS uptime_7d,
                COALESCE(AVG(response_time_ms) FILTER (WHERE status IN ('success', 'not_modified')), 0.0) AS avg_response_time_ms
            FROM fetch_log
            WHERE feed_id = $1 AND status != 'running'
            "#,
        )
        .bind(feed_id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to recompute feed_health windows")?;
        let (ok_ratio, uptime_24h, uptime_7d, avg_response_time_ms) = windows;

        sqlx::query(
            r#"
            INSERT INTO feed_health (feed_id, ok_ratio, consecutive_failures, avg_response_time_ms, last_success, last_failure, uptime_24h, uptime_7d)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (feed_id) DO UPDATE SET
                ok_ratio = $2,
                consecutive_failures = CASE WHEN $9 THEN feed_health.consecutive_failures + 1 ELSE 0 END,
                avg_response_time_ms = $4,
                last_success = CASE WHEN $9 THEN feed_health.last_success ELSE now() END,
                last_failure = CASE WHEN $9 THEN now() ELSE feed_health.last_failure END,
                uptime_24h = $7,
                uptime_7d = $8
            "#,
        )
        .bind(feed_id)
        .bind(ok_ratio)
        .bind(if is_failure { 1 } else { 0 })
        .bind(avg_response_time_ms)
        .bind(if is_failure { None } else { Some(Utc::now()) })
        .bind(if is_failure { Some(Utc::now()) } else { None })
        .bind(uptime_24h)
        .bind(uptime_7d)
        .bind(is_failure)
        .execute(&mut **tx)
        .await
        .context("failed to upsert feed_health")?;
        Ok(())
    }

    pub async fn get_fetch_log(&self, id: i64) -> Result<Option<FetchLog>> {
        sqlx::query_as::<_, FetchLog>("SELECT * FROM fetch_log WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch fetch_log row")
    }

    pub async fn get_feed_health(&self, feed_id: i64) -> Result<Option<FeedHealth>> {
        sqlx::query_as::<_, FeedHealth>("SELECT * FROM feed_health WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch feed_health")
    }
}

#[derive(Clone)]
pub struct FeedFetchUpdate {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub title: Option<String>,
    pub status: &'static str,
}

pub struct FeedDeletionPreflight {
    pub feed_id: i64,
    pub is_critical: bool,
    pub referencing_items: i64,
    pub can_delete: bool,
}
