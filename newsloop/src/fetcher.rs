//! C3: Feed Fetcher. Single public operation `fetch(feed) -> FetchLog`,
//! guarded by the `feed_fetch` circuit breaker.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::extraction::{apply_content_rules, extract_fields, passes_quality_filters, remove_tracking_params};
use crate::models::{Feed, FetchLog, FetchOutcome};
use crate::scraping::scrape_article_content;
use crate::storage::feeds::FeedFetchUpdate;
use crate::storage::items::{InsertOutcome, NewItem};
use crate::storage::Storage;

/// Below this length, feed-provided content is considered too thin to
/// analyze and worth replacing with a full-page scrape (§3, `scrape_full_content`).
const MIN_CONTENT_CHARS: usize = 100;
const SCRAPE_TIMEOUT_SECS: u64 = 10;

/// Items newly inserted by a fetch carry over into `pending_auto_analysis`,
/// capped at this many ids per fetch (§4.3 step 7); the rest are dropped
/// with a log line rather than silently truncated.
pub const AUTO_MAX_PER_RUN: usize = 50;

const USER_AGENT: &str = "News-MCP/1.0";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

struct FetchRunResult {
    outcome: FetchOutcome,
    items_found: i32,
    items_new: i32,
    response_time_ms: i64,
    feed_update: Option<FeedFetchUpdate>,
}

#[derive(Clone)]
pub struct Fetcher {
    storage: Storage,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl Fetcher {
    pub fn new(storage: Storage, breaker: CircuitBreaker) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client config is static and always valid");
        Self { storage, client, breaker }
    }

    pub async fn fetch(&self, feed: &Feed) -> Result<FetchLog> {
        let started_at = Utc::now();
        let fetch_log_id = self.storage.insert_fetch_log_running(feed.id, started_at).await?;

        let run_result = self.breaker.call(|| self.run(feed)).await;

        let (outcome, items_found, items_new, response_time_ms, error_message, feed_update) = match run_result {
            Ok(r) => (r.outcome, r.items_found, r.items_new, r.response_time_ms, None, r.feed_update),
            Err(e) => {
                warn!(feed_id = feed.id, error = %e, "feed fetch failed");
                (
                    FetchOutcome::Error,
                    0,
                    0,
                    0,
                    Some(e.to_string()),
                    Some(FeedFetchUpdate { etag: None, last_modified: None, title: None, status: "error" }),
                )
            }
        };

        let completion = self
            .storage
            .complete_fetch(
                fetch_log_id,
                feed.id,
                outcome,
                items_found,
                items_new,
                response_time_ms,
                error_message.as_deref(),
                feed_update.clone(),
            )
            .await;

        if let Err(e) = completion {
            if items_new > 0 {
                // A post-success session error (§4.3 step 9): entries were
                // already durably inserted before this write failed, so
                // items_new > 0 is the truth that matters. Retry the
                // completion write as success rather than let a transient
                // failure here relabel a fetch that actually found items.
                warn!(feed_id = feed.id, error = %e, "fetch_log completion failed after items were persisted, retrying as success");
                self.storage
                    .complete_fetch(
                        fetch_log_id,
                        feed.id,
                        FetchOutcome::Success,
                        items_found,
                        items_new,
                        response_time_ms,
                        None,
                        feed_update,
                    )
                    .await?;
            } else {
                return Err(e);
            }
        }

        self.storage.get_fetch_log(fetch_log_id).await?.context("fetch_log row vanished after completion")
    }

    async fn run(&self, feed: &Feed) -> Result<FetchRunResult> {
        let start = Instant::now();

        let mut request = self.client.get(&feed.url);
        if let Some(last_modified) = &feed.last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }
        if let Some(etag) = &feed.etag {
            request = request.header("If-None-Match", etag);
        }

        let response = request.send().await.context("feed GET failed")?;
        let response_time_ms = start.elapsed().as_millis() as i64;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchRunResult {
                outcome: FetchOutcome::NotModified,
                items_found: 0,
                items_new: 0,
                response_time_ms,
                feed_update: None,
            });
        }

        if !response.status().is_success() {
            anyhow::bail!("feed server responded {}", response.status());
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let body = response.bytes().await.context("failed to read feed body")?;
        let parsed = feed_rs::parser::parse(&body[..]).context("failed to parse feed body")?;

        let template = self.storage.active_template_for_feed(feed.id).await?;

        let mut items_found = 0i32;
        let mut new_item_ids = Vec::new();

        for entry in &parsed.entries {
            items_found += 1;
            match self.ingest_entry(feed, entry, template.as_ref()).await {
                Ok(Some(id)) => new_item_ids.push(id),
                Ok(None) => {}
                Err(e) => {
                    warn!(feed_id = feed.id, error = %e, "skipping feed entry after per-entry failure");
                }
            }
        }

        let items_new = new_item_ids.len() as i32;

        if !new_item_ids.is_empty() && feed.auto_analyze_enabled {
            let dropped = new_item_ids.len().saturating_sub(AUTO_MAX_PER_RUN);
            new_item_ids.truncate(AUTO_MAX_PER_RUN);
            if dropped > 0 {
                info!(feed_id = feed.id, dropped, "truncating pending_auto_analysis to AUTO_MAX_PER_RUN");
            }
            self.storage.insert_pending_auto_analysis(feed.id, &new_item_ids).await?;
        }

        Ok(FetchRunResult {
            outcome: FetchOutcome::Success,
            items_found,
            items_new,
            response_time_ms,
            feed_update: Some(FeedFetchUpdate {
                etag,
                last_modified,
                title: parsed.title.map(|t| t.content),
                status: "active",
            }),
        })
    }

    async fn ingest_entry(
        &self,
        feed: &Feed,
        entry: &feed_rs::model::Entry,
        template: Option<&crate::storage::templates::FeedTemplate>,
    ) -> Result<Option<i64>> {
        let mut fields = extract_fields(entry, template);

        if let Some(tmpl) = template {
            if !passes_quality_filters(&fields, &tmpl.quality_filters) {
                return Ok(None);
            }
        }
        fields.link = remove_tracking_params(&fields.link);

        let content = entry
            .content
            .as_ref()
            .and_then(|c| c.body.clone())
            .unwrap_or_default();

        let content = if feed.scrape_full_content && content.len() < MIN_CONTENT_CHARS {
            match scrape_article_content(&fields.link, SCRAPE_TIMEOUT_SECS).await {
                Ok(scraped) if !scraped.is_empty() => {
                    info!(feed_id = feed.id, link = %fields.link, "used scraped content in place of short feed content");
                    scraped
                }
                Ok(_) => content,
                Err(e) => {
                    warn!(feed_id = feed.id, link = %fields.link, error = %e, "full-content scrape failed, keeping feed content");
                    content
                }
            }
        } else {
            content
        };

        let content = if let Some(tmpl) = template {
            apply_content_rules(content, &tmpl.content_processing_rules)
        } else {
            content
        };

        let published = entry.published.map(|dt| dt.with_timezone(&Utc));

        let outcome = self
            .storage
            .insert_item_if_absent(NewItem {
                feed_id: feed.id,
                title: &fields.title,
                link: &fields.link,
                description: &fields.description,
                content: &content,
                author: fields.author.as_deref(),
                published,
            })
            .await?;

        match outcome {
            InsertOutcome::Inserted(id) => Ok(Some(id)),
            InsertOutcome::Duplicate => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_max_per_run_drops_excess_deterministically() {
        let mut ids: Vec<i64> = (0..80).collect();
        let dropped = ids.len().saturating_sub(AUTO_MAX_PER_RUN);
        ids.truncate(AUTO_MAX_PER_RUN);
        assert_eq!(ids.len(), 50);
        assert_eq!(dropped, 30);
    }

    #[test]
    fn scrape_gate_triggers_only_below_threshold() {
        let short = "x".repeat(MIN_CONTENT_CHARS - 1);
        let long = "x".repeat(MIN_CONTENT_CHARS);
        assert!(short.len() < MIN_CONTENT_CHARS);
        assert!(long.len() >= MIN_CONTENT_CHARS);
    }
}
