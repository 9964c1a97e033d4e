use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::ConfigChange;

use super::Storage;

impl Storage {
    pub async fn append_config_change(
        &self,
        change_type: &str,
        feed_id: Option<i64>,
        template_id: Option<i64>,
        old_config: Option<serde_json::Value>,
        new_config: Option<serde_json::Value>,
    ) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO feed_configuration_changes (change_type, feed_id, template_id, old_config, new_config)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(change_type)
        .bind(feed_id)
        .bind(template_id)
        .bind(old_config)
        .bind(new_config)
        .fetch_one(&self.pool)
        .await
        .context("failed to append config change")
    }

    pub async fn unapplied_changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ConfigChange>> {
        sqlx::query_as::<_, ConfigChange>(
            "SELECT * FROM feed_configuration_changes
             WHERE applied_at IS NULL AND created_at >= $1
             ORDER BY created_at ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to list unapplied config changes")
    }

    pub async fn mark_changes_applied(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE feed_configuration_changes SET applied_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("failed to mark config changes applied")?;
        Ok(())
    }

    /// Drift-hash fallback (§4.4, §11): content hash over the full current
    /// feeds set and full templates+assignments set, compared by the caller
    /// against `feed_scheduler_state.last_*_config_hash`.
    pub async fn current_feeds_hash(&self) -> Result<String> {
        let rows: Vec<(i64, String, i32, String)> = sqlx::query_as(
            "SELECT id, url, fetch_interval_minutes, status FROM feeds ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load feeds for drift hash")?;

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for (id, url, interval, status) in rows {
            hasher.update(id.to_le_bytes());
            hasher.update(url.as_bytes());
            hasher.update(interval.to_le_bytes());
            hasher.update(status.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub async fn current_templates_hash(&self) -> Result<String> {
        let rows: Vec<(i64, i64, i64, i32, bool)> = sqlx::query_as(
            "SELECT a.id, a.feed_id, a.template_id, a.priority, a.active
             FROM feed_template_assignments a ORDER BY a.id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load template assignments for drift hash")?;

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for (id, feed_id, template_id, priority, active) in rows {
            hasher.update(id.to_le_bytes());
            hasher.update(feed_id.to_le_bytes());
            hasher.update(template_id.to_le_bytes());
            hasher.update(priority.to_le_bytes());
            hasher.update([active as u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub async fn get_scheduler_state_hashes(&self) -> Result<(Option<String>, Option<String>, Option<DateTime<Utc>>)> {
        let row: (Option<String>, Option<String>, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT last_feed_config_hash, last_template_config_hash, last_config_check
             FROM feed_scheduler_state WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to read feed_scheduler_state")?;
        Ok(row)
    }

    pub async fn update_scheduler_state(
        &self,
        feed_hash: &str,
        template_hash: &str,
        last_config_check: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE feed_scheduler_state
             SET last_feed_config_hash = $1, last_template_config_hash = $2,
                 last_config_check = $3, last_heartbeat = now(), is_active = true
             WHERE id = 1",
        )
        .bind(feed_hash)
        .bind(template_hash)
        .bind(last_config_check)
        .execute(&self.pool)
        .await
        .context("failed to update feed_scheduler_state")?;
        Ok(())
    }

    pub async fn heartbeat_scheduler(&self) -> Result<()> {
        sqlx::query("UPDATE feed_scheduler_state SET last_heartbeat = now() WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("failed to heartbeat scheduler state")?;
        Ok(())
    }
}
