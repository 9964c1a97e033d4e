use anyhow::{Context, Result};

use super::Storage;

/// A feed template row, as needed by the fetcher's extraction step (§4.3.1).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedTemplate {
    pub id: i64,
    pub name: String,
    pub field_mappings: serde_json::Value,
    pub content_processing_rules: serde_json::Value,
    pub quality_filters: serde_json::Value,
}

impl Storage {
    /// The highest-priority active template assignment for a feed, if any.
    pub async fn active_template_for_feed(&self, feed_id: i64) -> Result<Option<FeedTemplate>> {
        sqlx::query_as::<_, FeedTemplate>(
            r#"
            SELECT t.id, t.name, t.field_mappings, t.content_processing_rules, t.quality_filters
            FROM feed_template_assignments a
            JOIN feed_templates t ON t.id = a.template_id
            WHERE a.feed_id = $1 AND a.active = true
            ORDER BY a.priority DESC
            LIMIT 1
            "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load active template for feed")
    }

    /// Feed ids affected by template/assignment changes, for C4's
    /// `TemplateChangesAffectingFeeds()`.
    pub async fn feeds_for_template(&self, template_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT feed_id FROM feed_template_assignments WHERE template_id = $1")
            .bind(template_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list feeds for template")
    }
}
