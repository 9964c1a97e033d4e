//! Admission Controller (C7): the single gate between "someone wants to run
//! an analysis" and "an AnalysisRun actually starts". All checks are
//! serialized behind one internal lock (§5 Rust note) so that two concurrent
//! `can_start` calls can't both observe capacity and both proceed.
//!
//! Grounded on `analysis_run_manager.py`'s `AnalysisRunManager`: the check
//! order, the exact reason-message phrasing, and `process_queue`'s
//! capacity-then-emergency-stop-then-dequeue sequence all follow it.

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::models::{Priority, QueuedRun, RunParams, RunScope, TriggeredBy};
use crate::run_queue::RunQueue;
use crate::scope::scope_hash;
use crate::storage::queue::EnqueueOutcome;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    Proceed,
    Enqueued(i64),
    Rejected(String),
}

/// A run pulled off the queue and ready for the worker to materialize and
/// start. Mirrors `process_queue`'s return shape in the Python original.
#[derive(Debug, Clone)]
pub struct StartDecision {
    pub queued_run_id: i64,
    pub scope: RunScope,
    pub params: RunParams,
    pub triggered_by: TriggeredBy,
}

pub struct AdmissionController {
    storage: Storage,
    queue: RunQueue,
    lock: Mutex<()>,
    emergency_stop: std::sync::atomic::AtomicBool,
    limits: common::AdmissionConfig,
}

impl AdmissionController {
    pub fn new(storage: Storage, limits: common::AdmissionConfig) -> Self {
        let queue = RunQueue::new(storage.clone());
        Self {
            storage,
            queue,
            lock: Mutex::new(()),
            emergency_stop: std::sync::atomic::AtomicBool::new(false),
            limits,
        }
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// `CanStart` (§4.7): acquires the internal mutex, then checks in order:
    /// emergency stop, duplicate active run, concurrency, daily, daily-auto,
    /// hourly.
    pub async fn can_start(
        &self,
        scope: &RunScope,
        params: &RunParams,
        triggered_by: TriggeredBy,
    ) -> Result<AdmissionDecision> {
        let _guard = self.lock.lock().await;

        if self.is_emergency_stopped() {
            return Ok(AdmissionDecision::Rejected("Emergency stop is active".to_string()));
        }

        let hash = scope_hash(scope, params);
        if self.storage.active_run_for_scope_hash(&hash).await?.is_some() {
            return Ok(AdmissionDecision::Rejected(
                "Duplicate run: an active run already covers this scope".to_string(),
            ));
        }
        // A queued-but-not-yet-started run has no `analysis_runs` row for the
        // check above to see, so the C6 dedup invariant needs a second check
        // against `queued_runs` directly (seed scenario 3, spec.md §8).
        if self.storage.active_queued_run_for_scope_hash(&hash).await?.is_some() {
            return Ok(AdmissionDecision::Rejected(
                "Duplicate run: already queued under this scope".to_string(),
            ));
        }

        let running = self.storage.count_running_runs().await?;
        let max_concurrent = self.limits.max_concurrent;
        if running >= max_concurrent {
            return Ok(if triggered_by.priority() == Priority::High {
                match self.queue.enqueue(scope, params, triggered_by).await? {
                    EnqueueOutcome::Enqueued(id) => AdmissionDecision::Enqueued(id),
                    EnqueueOutcome::Duplicate => AdmissionDecision::Rejected(
                        "Duplicate run: already queued under this scope".to_string(),
                    ),
                }
            } else {
                AdmissionDecision::Rejected(format!(
                    "Too many concurrent runs ({running}/{max_concurrent}). Auto/scheduled runs rejected."
                ))
            });
        }

        let since_day = Utc::now() - Duration::hours(24);
        let daily = self.storage.count_runs_started_since(since_day, false).await?;
        let max_daily = self.limits.max_daily;
        if daily >= max_daily {
            return Ok(AdmissionDecision::Rejected(format!(
                "Daily run limit exceeded ({daily}/{max_daily})"
            )));
        }

        if triggered_by == TriggeredBy::Auto {
            let daily_auto = self.storage.count_runs_started_since(since_day, true).await?;
            let max_daily_auto = self.limits.max_daily_auto;
            if daily_auto >= max_daily_auto {
                return Ok(AdmissionDecision::Rejected(format!(
                    "Daily auto-run limit exceeded ({daily_auto}/{max_daily_auto})"
                )));
            }
        }

        let since_hour = Utc::now() - Duration::hours(1);
        let hourly = self.storage.count_runs_started_since(since_hour, false).await?;
        let max_hourly = self.limits.max_hourly;
        if hourly >= max_hourly {
            return Ok(AdmissionDecision::Rejected(format!(
                "Hourly run limit exceeded ({hourly}/{max_hourly})"
            )));
        }

        Ok(AdmissionDecision::Proceed)
    }

    /// `ProcessQueue` (§4.7): if capacity exists and we're not stopped,
    /// dequeue the next run and hand it back to the caller (the worker) to
    /// materialize and start. Does not itself create the AnalysisRun — the
    /// caller confirms start via `MarkCompleted`.
    pub async fn process_queue(&self) -> Result<Option<StartDecision>> {
        let _guard = self.lock.lock().await;

        if self.is_emergency_stopped() {
            return Ok(None);
        }

        let running = self.storage.count_running_runs().await?;
        if running >= self.limits.max_concurrent {
            return Ok(None);
        }

        let Some(next) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        Ok(Some(decode_queued_run(next)?))
    }

    /// Record that a dequeued run actually started, so its queue row carries
    /// the resulting `analysis_run_id`.
    pub async fn confirm_started(&self, queued_run_id: i64, analysis_run_id: i64) -> Result<()> {
        self.queue.mark_completed(queued_run_id, analysis_run_id).await
    }

    pub async fn mark_start_failed(&self, queued_run_id: i64, reason: &str) -> Result<()> {
        self.queue.mark_failed(queued_run_id, reason).await
    }

    /// Sets the process-wide stop flag and clears the queue.
    pub async fn emergency_stop_all(&self) -> Result<i64> {
        let _guard = self.lock.lock().await;
        self.emergency_stop.store(true, std::sync::atomic::Ordering::SeqCst);
        self.queue.clear_queue().await
    }

    pub async fn resume_operations(&self) {
        let _guard = self.lock.lock().await;
        self.emergency_stop.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Mirrors `get_status()`: a snapshot for health/metrics reporting.
    pub async fn status(&self) -> Result<AdmissionStatus> {
        let running = self.storage.count_running_runs().await?;
        let queue_counts = self.queue.status().await?;
        let since_day = Utc::now() - Duration::hours(24);
        let daily = self.storage.count_runs_started_since(since_day, false).await?;
        let daily_auto = self.storage.count_runs_started_since(since_day, true).await?;
        let since_hour = Utc::now() - Duration::hours(1);
        let hourly = self.storage.count_runs_started_since(since_hour, false).await?;

        Ok(AdmissionStatus {
            emergency_stop: self.is_emergency_stopped(),
            active_runs: running,
            max_concurrent: self.limits.max_concurrent,
            queued_runs: queue_counts.iter().map(|(_, _, n)| n).sum(),
            daily_runs: daily,
            daily_auto_runs: daily_auto,
            hourly_runs: hourly,
            at_concurrent_limit: running >= self.limits.max_concurrent,
            at_daily_limit: daily >= self.limits.max_daily,
            at_hourly_limit: hourly >= self.limits.max_hourly,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionStatus {
    pub emergency_stop: bool,
    pub active_runs: i64,
    pub max_concurrent: i64,
    pub queued_runs: i64,
    pub daily_runs: i64,
    pub daily_auto_runs: i64,
    pub hourly_runs: i64,
    pub at_concurrent_limit: bool,
    pub at_daily_limit: bool,
    pub at_hourly_limit: bool,
}

fn decode_queued_run(row: QueuedRun) -> Result<StartDecision> {
    let scope: RunScope = serde_json::from_value(row.scope_json)?;
    let params: RunParams = serde_json::from_value(row.params_json)?;
    let triggered_by = match row.priority.as_str() {
        "HIGH" => TriggeredBy::Manual,
        "MEDIUM" => TriggeredBy::Scheduled,
        _ => TriggeredBy::Auto,
    };
    Ok(StartDecision {
        queued_run_id: row.id,
        scope,
        params,
        triggered_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_queued_run_maps_priority_back_to_trigger() {
        let row = QueuedRun {
            id: 1,
            priority: "HIGH".to_string(),
            status: "RUNNING".to_string(),
            scope_hash: "abc".to_string(),
            scope_json: serde_json::json!({"type": "global"}),
            params_json: serde_json::json!({"model": "gpt-4.1-mini"}),
            analysis_run_id: None,
            created_at: Utc::now(),
            started_at: None,
            error_message: None,
            queue_position: None,
        };
        let decoded = decode_queued_run(row).unwrap();
        assert_eq!(decoded.triggered_by, TriggeredBy::Manual);
    }
}
