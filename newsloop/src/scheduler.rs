//! C5: Dynamic Scheduler. One in-memory schedule map, one cooperative loop.
//! The database owns feed state; the scheduler owns only the next-fetch
//! timing derived from it (§9 design note).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::config_watcher::ConfigWatcher;
use crate::fetcher::Fetcher;
use crate::models::FetchOutcome;
use crate::storage::Storage;

struct ScheduleEntry {
    feed_id: i64,
    interval: Duration,
    status: String,
    next_fetch: DateTime<Utc>,
    consecutive_failures: u32,
    is_running: bool,
}

pub struct Scheduler {
    storage: Storage,
    watcher: ConfigWatcher,
    fetcher: Fetcher,
    schedule: HashMap<i64, ScheduleEntry>,
    last_config_check: DateTime<Utc>,
    shutdown: Arc<Notify>,
    tick: Duration,
    config_check_interval: Duration,
    dispatch_batch: usize,
    max_backoff: Duration,
}

impl Scheduler {
    pub fn new(
        storage: Storage,
        breaker: CircuitBreaker,
        shutdown: Arc<Notify>,
        config: &common::SchedulerConfig,
    ) -> Self {
        let watcher = ConfigWatcher::new(storage.clone());
        let fetcher = Fetcher::new(storage.clone(), breaker);
        Self {
            storage,
            watcher,
            fetcher,
            schedule: HashMap::new(),
            last_config_check: Utc::now(),
            shutdown,
            tick: Duration::from_secs(config.tick_interval_seconds),
            config_check_interval: Duration::from_secs(config.config_check_interval_seconds),
            dispatch_batch: config.dispatch_batch,
            max_backoff: Duration::from_secs(config.max_backoff_minutes.max(0) as u64 * 60),
        }
    }

    /// Populate the schedule map from the set of currently active feeds.
    pub async fn load_initial(&mut self) -> anyhow::Result<()> {
        let feeds = self.storage.list_active_feeds().await?;
        let now = Utc::now();
        for feed in feeds {
            let interval = Duration::from_secs(feed.fetch_interval_minutes as u64 * 60);
            let next_fetch = feed
                .last_fetched
                .map(|last| last + chrono::Duration::from_std(interval).unwrap_or_default())
                .unwrap_or(now);
            self.schedule.insert(
                feed.id,
                ScheduleEntry {
                    feed_id: feed.id,
                    interval,
                    status: feed.status.clone(),
                    next_fetch,
                    consecutive_failures: 0,
                    is_running: false,
                },
            );
        }
        info!(feeds = self.schedule.len(), "scheduler loaded initial schedule");
        Ok(())
    }

    /// Run the main loop until shutdown is notified.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {
                    self.tick_once().await?;
                }
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn tick_once(&mut self) -> anyhow::Result<()> {
        if Utc::now() - self.last_config_check
            >= chrono::Duration::from_std(self.config_check_interval).unwrap()
        {
            self.apply_config_changes().await?;
            self.last_config_check = Utc::now();
        }

        let due: Vec<i64> = self
            .schedule
            .values()
            .filter(|e| !e.is_running && e.status == "active" && Utc::now() >= e.next_fetch)
            .map(|e| e.feed_id)
            .collect();

        for batch in due.chunks(self.dispatch_batch) {
            let mut handles = Vec::with_capacity(batch.len());
            for &feed_id in batch {
                if let Some(entry) = self.schedule.get_mut(&feed_id) {
                    entry.is_running = true;
                }
                let storage = self.storage.clone();
                let fetcher = self.fetcher.clone();
                handles.push((
                    feed_id,
                    tokio::spawn(async move { dispatch_one(storage, fetcher, feed_id).await }),
                ));
            }
            for (feed_id, handle) in handles {
                let result = match handle.await {
                    Ok(r) => r,
                    Err(e) => Err(anyhow::anyhow!("fetch task for feed {feed_id} panicked: {e}")),
                };
                self.apply_outcome(feed_id, result);
            }
        }

        self.watcher.heartbeat().await?;
        Ok(())
    }

    fn apply_outcome(&mut self, feed_id: i64, result: anyhow::Result<FetchOutcome>) {
        let Some(entry) = self.schedule.get_mut(&feed_id) else { return };
        entry.is_running = false;

        match result {
            Ok(FetchOutcome::Success) | Ok(FetchOutcome::NotModified) => {
                entry.consecutive_failures = 0;
                entry.next_fetch = Utc::now() + chrono::Duration::from_std(entry.interval).unwrap_or_default();
            }
            Ok(FetchOutcome::Error) | Err(_) => {
                entry.consecutive_failures += 1;
                let backoff = entry.interval * 2u32.saturating_pow(entry.consecutive_failures).min(u32::MAX);
                let backoff = backoff.min(self.max_backoff);
                entry.next_fetch = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
                warn!(feed_id, failures = entry.consecutive_failures, "feed fetch failed, backing off");
            }
        }
    }

    async fn apply_config_changes(&mut self) -> anyhow::Result<()> {
        let impact = self.watcher.poll(self.last_config_check).await?;
        self.apply_impact(impact.clone()).await?;
        // Ack the change-log rows only now that the impact has actually been
        // reconciled into the in-memory schedule (§4.4).
        self.watcher.acknowledge(&impact).await?;

        // Drift-hash fallback (§4.4): a raw-SQL edit or any other write that
        // bypassed the change log leaves the in-memory schedule stale even
        // though `poll` above found nothing to apply. Detect that case
        // independently and fully resync from the feeds table when it fires.
        if self.watcher.detect_drift().await? {
            warn!("feed/template config drift detected outside the change log, resyncing schedule");
            self.full_resync().await?;
        }

        Ok(())
    }

    /// Reload the schedule from the feeds table, preserving in-flight state
    /// (`is_running`, `consecutive_failures`) for feeds already tracked.
    async fn full_resync(&mut self) -> anyhow::Result<()> {
        let feeds = self.storage.list_active_feeds().await?;
        let live_ids: std::collections::HashSet<i64> = feeds.iter().map(|f| f.id).collect();
        self.schedule.retain(|id, _| live_ids.contains(id));

        for feed in feeds {
            let interval = Duration::from_secs(feed.fetch_interval_minutes as u64 * 60);
            match self.schedule.get_mut(&feed.id) {
                Some(entry) => {
                    if entry.interval != interval {
                        entry.next_fetch = feed
                            .last_fetched
                            .map(|last| last + chrono::Duration::from_std(interval).unwrap_or_default())
                            .unwrap_or_else(Utc::now);
                    }
                    entry.interval = interval;
                    entry.status = feed.status;
                }
                None => {
                    let next_fetch = feed
                        .last_fetched
                        .map(|last| last + chrono::Duration::from_std(interval).unwrap_or_default())
                        .unwrap_or_else(Utc::now);
                    self.schedule.insert(
                        feed.id,
                        ScheduleEntry {
                            feed_id: feed.id,
                            interval,
                            status: feed.status,
                            next_fetch,
                            consecutive_failures: 0,
                            is_running: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_impact(&mut self, impact: crate::config_watcher::ScheduleImpact) -> anyhow::Result<()> {
        for feed_id in impact.new_feeds_to_schedule {
            if let Some(feed) = self.storage.get_feed(feed_id).await? {
                let interval = Duration::from_secs(feed.fetch_interval_minutes as u64 * 60);
                self.schedule.insert(
                    feed_id,
                    ScheduleEntry {
                        feed_id,
                        interval,
                        status: feed.status,
                        next_fetch: Utc::now(),
                        consecutive_failures: 0,
                        is_running: false,
                    },
                );
            }
        }

        for feed_id in impact.feeds_requiring_schedule_update {
            let Some(feed) = self.storage.get_feed(feed_id).await? else { continue };
            if !feed.is_active() {
                self.schedule.remove(&feed_id);
                continue;
            }
            let interval = Duration::from_secs(feed.fetch_interval_minutes as u64 * 60);
            let entry = self.schedule.entry(feed_id).or_insert_with(|| ScheduleEntry {
                feed_id,
                interval,
                status: feed.status.clone(),
                next_fetch: Utc::now(),
                consecutive_failures: 0,
                is_running: false,
            });
            if entry.interval != interval {
                entry.next_fetch = feed
                    .last_fetched
                    .map(|last| last + chrono::Duration::from_std(interval).unwrap_or_default())
                    .unwrap_or_else(Utc::now);
            }
            entry.interval = interval;
            entry.status = feed.status;
        }

        for feed_id in impact.deleted_feeds_to_unschedule {
            self.schedule.remove(&feed_id);
        }

        for feed_id in impact.feeds_affected_by_template_changes {
            if let Some(entry) = self.schedule.get_mut(&feed_id) {
                entry.next_fetch = Utc::now();
            }
        }

        Ok(())
    }
}

/// Fetch one feed on its own task so a batch of up to `DISPATCH_BATCH`
/// feeds runs concurrently rather than one-at-a-time (§4.5 step 3).
async fn dispatch_one(storage: Storage, fetcher: Fetcher, feed_id: i64) -> anyhow::Result<FetchOutcome> {
    let feed = storage
        .get_feed(feed_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("feed {} vanished before dispatch", feed_id))?;
    let log = fetcher.fetch(&feed).await?;
    Ok(match log.status.as_str() {
        "success" => FetchOutcome::Success,
        "not_modified" => FetchOutcome::NotModified,
        _ => FetchOutcome::Error,
    })
}
