use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::Item;

use super::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

pub fn content_hash(title: &str, link: &str, summary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(link.as_bytes());
    hasher.update(summary.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct NewItem<'a> {
    pub feed_id: i64,
    pub title: &'a str,
    pub link: &'a str,
    pub description: &'a str,
    pub content: &'a str,
    pub author: Option<&'a str>,
    pub published: Option<DateTime<Utc>>,
}

impl Storage {
    /// Insert an item unless its content_hash already exists. A unique
    /// violation on `items.content_hash` is translated into `Duplicate`
    /// without poisoning the caller's transaction (§4.1).
    pub async fn insert_item_if_absent(&self, item: NewItem<'_>) -> Result<InsertOutcome> {
        let hash = content_hash(item.title, item.link, item.description);

        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO items (feed_id, content_hash, title, link, description, content, author, published)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(item.feed_id)
        .bind(&hash)
        .bind(item.title)
        .bind(item.link)
        .bind(item.description)
        .bind(item.content)
        .bind(item.author)
        .bind(item.published.unwrap_or_else(Utc::now))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(InsertOutcome::Inserted(id)),
            Err(sqlx::Error::Database(db_err)) if db_err.constraint() == Some("items_content_hash_key") => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e).context("failed to insert item"),
        }
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch item")
    }

    pub async fn item_ids_for_feeds(&self, feed_ids: &[i64]) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM items WHERE feed_id = ANY($1) ORDER BY created_at DESC")
            .bind(feed_ids)
            .fetch_all(&self.pool)
            .await
            .context("failed to list items by feed")
    }

    pub async fn item_ids_in_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM items WHERE created_at BETWEEN $1 AND $2 ORDER BY created_at DESC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("failed to list items by timerange")
    }

    pub async fn all_item_ids_newest_first(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM items ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list all items")
    }

    /// item ids already present in any completed analysis_run_items row —
    /// used to implement `unanalyzed_only` (§4.8.1).
    pub async fn already_analyzed_item_ids(&self, item_ids: &[i64]) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT DISTINCT item_id FROM analysis_run_items WHERE item_id = ANY($1) AND state = 'completed'",
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to list already-analyzed items")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_order_sensitive_over_its_three_fields() {
        let a = content_hash("T", "L", "S");
        let b = content_hash("T", "L", "S");
        assert_eq!(a, b);
        let c = content_hash("T2", "L", "S");
        assert_ne!(a, c);
    }
}
