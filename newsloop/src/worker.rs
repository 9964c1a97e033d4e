//! Analysis Orchestrator / Worker (C8): a single long-lived control loop
//! that drains pending auto-analysis, starts queued runs, claims items
//! skip-locked, drives rate-limited LLM calls, and performs periodic
//! maintenance. Grounded on `analysis_worker.py`'s `AnalysisWorker.start`
//! (the five-step cycle) and `AnalysisOrchestrator`'s per-run item loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
use crate::cost::{self, built_in_pricing};
use crate::llm::LlmClient;
use crate::models::{RunParams, RunScope, TriggeredBy};
use crate::retry::retry_with_recovery_strategy;
use crate::scope;
use crate::storage::Storage;

pub struct WorkerSettings {
    pub chunk_size: i64,
    pub sleep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_processing: chrono::Duration,
    pub min_request_interval: Duration,
    pub max_runs_per_cycle: usize,
    pub reset_stale_on_start: bool,
}

impl From<&common::WorkerConfig> for WorkerSettings {
    fn from(cfg: &common::WorkerConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            sleep_interval: Duration::from_secs(cfg.sleep_interval_seconds),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_seconds),
            stale_processing: chrono::Duration::seconds(cfg.stale_processing_seconds),
            min_request_interval: Duration::from_secs_f64(cfg.min_request_interval_seconds),
            max_runs_per_cycle: cfg.max_runs_per_cycle,
            reset_stale_on_start: cfg.reset_stale_on_start,
        }
    }
}

fn resolve_price(pricing: &common::PricingConfig, model: &str) -> Option<common::ModelPrice> {
    cost::price_for_model(pricing, model)
        .or_else(|| cost::price_for_model(&built_in_pricing(), model))
        .copied()
}

/// Default parameters applied to auto-triggered single-item runs drained
/// from `pending_auto_analysis` (§4.8 step 1).
fn auto_params(model: &str) -> RunParams {
    RunParams {
        model: model.to_string(),
        rate_per_second: 1.0,
        limit: 5000,
        override_existing: false,
        unanalyzed_only: true,
        min_impact_threshold: None,
        max_impact_threshold: None,
    }
}

pub struct Worker {
    storage: Storage,
    admission: Arc<AdmissionController>,
    llm: Arc<dyn LlmClient>,
    llm_breaker: CircuitBreaker,
    pricing: common::PricingConfig,
    default_model: String,
    settings: WorkerSettings,
    last_call_at: tokio::sync::Mutex<HashMap<i64, Instant>>,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub async fn new(
        storage: Storage,
        admission: Arc<AdmissionController>,
        llm: Arc<dyn LlmClient>,
        breakers: &BreakerRegistry,
        pricing: common::PricingConfig,
        default_model: String,
        settings: WorkerSettings,
        shutdown: Arc<Notify>,
    ) -> Self {
        let llm_breaker = breakers.get_or_create("llm_call", BreakerConfig::llm_call()).await;
        Self {
            storage,
            admission,
            llm,
            llm_breaker,
            pricing,
            default_model,
            settings,
            last_call_at: tokio::sync::Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub async fn run(&self) {
        if self.settings.reset_stale_on_start {
            match self.storage.reset_stale_processing(self.settings.stale_processing).await {
                Ok(n) if n > 0 => info!(count = n, "reset stale processing items on startup"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to reset stale processing items on startup"),
            }
        }

        let mut last_heartbeat = Instant::now();

        loop {
            let work_done = match self.process_cycle().await {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "error in worker cycle");
                    false
                }
            };

            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                self.periodic_maintenance().await;
                last_heartbeat = Instant::now();
            }

            let sleep_for = if work_done { Duration::from_millis(0) } else { self.settings.sleep_interval };
            if !work_done {
                debug!("no work to do, sleeping");
            }
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return;
                }
            }
        }
    }

    async fn process_cycle(&self) -> anyhow::Result<bool> {
        let mut work_done = false;

        work_done |= self.drain_pending_auto_analysis().await?;
        work_done |= self.intake_queue().await?;
        work_done |= self.process_active_runs().await?;

        Ok(work_done)
    }

    /// Step 1: drain `pending_auto_analysis` rows through admission.
    async fn drain_pending_auto_analysis(&self) -> anyhow::Result<bool> {
        let rows = self.storage.take_pending_auto_analysis(self.settings.max_runs_per_cycle as i64).await?;
        if rows.is_empty() {
            return Ok(false);
        }

        for row in &rows {
            let item_ids: Vec<i64> = serde_json::from_value(row.item_ids.clone()).unwrap_or_default();
            let scope = RunScope::Items { item_ids };
            let params = auto_params(&self.default_model);

            self.storage.set_pending_auto_analysis_status(row.id, "processing").await?;

            match self.admission.can_start(&scope, &params, TriggeredBy::Auto).await {
                Ok(decision) => {
                    self.handle_admission_decision(decision, scope, params, TriggeredBy::Auto).await?;
                    self.storage.set_pending_auto_analysis_status(row.id, "done").await?;
                }
                Err(e) => {
                    warn!(error = %e, pending_id = row.id, "admission check failed for pending auto-analysis");
                    self.storage.set_pending_auto_analysis_status(row.id, "error").await?;
                }
            }
        }

        Ok(true)
    }

    /// Step 2: ask the admission controller for the next queued run to
    /// start, materialize its items, and flip it to running.
    async fn intake_queue(&self) -> anyhow::Result<bool> {
        let Some(decision) = self.admission.process_queue().await? else {
            return Ok(false);
        };

        let item_ids = scope::materialize(&self.storage, &decision.scope, &decision.params).await?;
        let price = resolve_price(&self.pricing, &decision.params.model);
        let cost_estimate = price
            .map(|p| cost::estimate_run_cost(&p, item_ids.len() as i64))
            .unwrap_or(0.0);

        let scope_json = serde_json::to_value(&decision.scope)?;
        let params_json = serde_json::to_value(&decision.params)?;
        let hash = scope::scope_hash(&decision.scope, &decision.params);

        let run_id = self
            .storage
            .create_analysis_run(&scope_json, &params_json, &hash, decision.triggered_by.as_str(), cost_estimate)
            .await;

        let run_id = match run_id {
            Ok(id) => id,
            Err(e) => {
                self.admission
                    .mark_start_failed(decision.queued_run_id, &format!("failed to create run: {e}"))
                    .await
                    .ok();
                return Err(e);
            }
        };

        self.storage.materialize_run_items(run_id, &item_ids).await?;
        self.storage.set_run_status(run_id, "running").await?;
        self.admission.confirm_started(decision.queued_run_id, run_id).await?;

        info!(run_id, items = item_ids.len(), "started run from queue");
        Ok(true)
    }

    async fn handle_admission_decision(
        &self,
        decision: crate::admission::AdmissionDecision,
        scope: RunScope,
        params: RunParams,
        triggered_by: TriggeredBy,
    ) -> anyhow::Result<()> {
        use crate::admission::AdmissionDecision as D;
        match decision {
            D::Proceed => {
                let item_ids = scope::materialize(&self.storage, &scope, &params).await?;
                let price = resolve_price(&self.pricing, &params.model);
                let cost_estimate = price.map(|p| cost::estimate_run_cost(&p, item_ids.len() as i64)).unwrap_or(0.0);

                let scope_json = serde_json::to_value(&scope)?;
                let params_json = serde_json::to_value(&params)?;
                let hash = scope::scope_hash(&scope, &params);
                let run_id = self
                    .storage
                    .create_analysis_run(&scope_json, &params_json, &hash, triggered_by.as_str(), cost_estimate)
                    .await?;
                self.storage.materialize_run_items(run_id, &item_ids).await?;
                self.storage.set_run_status(run_id, "running").await?;
                info!(run_id, "started run directly from auto-analysis");
            }
            D::Enqueued(id) => {
                debug!(queued_id = id, "auto-analysis queued due to capacity");
            }
            D::Rejected(reason) => {
                debug!(reason, "auto-analysis rejected by admission controller");
            }
        }
        Ok(())
    }

    /// Step 3: advance pending/running runs, bounded to
    /// `max_runs_per_cycle`.
    async fn process_active_runs(&self) -> anyhow::Result<bool> {
        let runs = self.storage.pending_runs(self.settings.max_runs_per_cycle as i64).await?;
        if runs.is_empty() {
            return Ok(false);
        }

        let mut work_done = false;
        for run in runs {
            if run.status == "pending" {
                if let Err(e) = self.storage.set_run_status(run.id, "running").await {
                    error!(run_id = run.id, error = %e, "failed to start run");
                    continue;
                }
            }

            match self.process_run(run.id).await {
                Ok(processed) => work_done |= processed > 0,
                Err(e) => error!(run_id = run.id, error = %e, "error processing run"),
            }
        }
        Ok(work_done)
    }

    async fn process_run(&self, run_id: i64) -> anyhow::Result<usize> {
        let Some(run) = self.storage.get_run(run_id).await? else {
            return Ok(0);
        };
        let params: RunParams = serde_json::from_value(run.params.clone())?;
        // §4.8 step 3: sleep so the per-run call rate stays <= rate_per_second,
        // floored by MIN_REQUEST_INTERVAL regardless of how high the rate is set.
        let interval_for_rate = Duration::from_secs_f64(1.0 / params.clamped_rate());
        let min_interval = interval_for_rate.max(self.settings.min_request_interval);

        let claimed = self.storage.claim_queued_run_items(run_id, self.settings.chunk_size).await?;
        let mut processed = 0usize;

        let price = resolve_price(&self.pricing, &params.model);

        for item in &claimed {
            self.enforce_rate_limit(run_id, min_interval).await;
            let item_start = Instant::now();

            let Some(source) = self.storage.get_item(item.item_id).await? else {
                self.storage.fail_run_item(item.id, "item no longer exists").await?;
                continue;
            };
            let title = source.title.clone().unwrap_or_default();
            let body = source
                .content
                .clone()
                .or_else(|| source.description.clone())
                .unwrap_or_default();
            let prompt = crate::llm::build_prompt(&title, &body);

            let llm = self.llm.clone();
            let outcome = self
                .llm_breaker
                .call(|| {
                    let llm = llm.clone();
                    let prompt = prompt.clone();
                    async move {
                        retry_with_recovery_strategy(|| {
                            let llm = llm.clone();
                            let prompt = prompt.clone();
                            async move { llm.analyze(&prompt).await }
                        })
                        .await
                    }
                })
                .await;

            match outcome {
                Ok(result) => {
                    let cost_usd = price.map(|p| cost::calculate_cost(&p, result.tokens_used)).unwrap_or(0.0);
                    self.storage
                        .complete_run_item_success(item.id, &result.sentiment, &result.impact, &params.model, result.tokens_used, cost_usd)
                        .await?;
                    self.emit_metrics_sample(source.feed_id, &params.model, cost_usd, item_start, false).await;
                    processed += 1;
                }
                Err(e) => {
                    self.storage.fail_run_item(item.id, &format!("{e:#}")).await?;
                    self.emit_metrics_sample(source.feed_id, &params.model, 0.0, item_start, true).await;
                }
            }
        }

        self.refresh_run_aggregates(run_id).await?;
        Ok(processed)
    }

    /// Emit one sample to the metrics & cost aggregator (C9) for this
    /// run-item's completion, feeding both the daily per-feed rollup and the
    /// hourly queue rollup (§4.9).
    async fn emit_metrics_sample(&self, feed_id: i64, model: &str, cost_usd: f64, started: Instant, failed: bool) {
        let sample = crate::storage::metrics::MetricsSample {
            feed_id,
            model: model.to_string(),
            cost_usd,
            processing_time_seconds: started.elapsed().as_secs_f64(),
            failed,
        };
        let now = Utc::now();
        if let Err(e) = self.storage.record_feed_metric(&sample, now.date_naive()).await {
            warn!(error = %e, feed_id, "failed to record feed metric");
        }
        if let Err(e) = self.storage.record_queue_metric(now.date_naive(), now.hour() as i32, &sample).await {
            warn!(error = %e, "failed to record queue metric");
        }
    }

    async fn enforce_rate_limit(&self, run_id: i64, min_interval: Duration) {
        let mut guard = self.last_call_at.lock().await;
        let now = Instant::now();
        if let Some(last) = guard.get(&run_id) {
            let elapsed = now.duration_since(*last);
            if elapsed < min_interval {
                let deficit = min_interval - elapsed;
                drop(guard);
                tokio::time::sleep(deficit).await;
                guard = self.last_call_at.lock().await;
            }
        }
        guard.insert(run_id, Instant::now());
    }

    async fn refresh_run_aggregates(&self, run_id: i64) -> anyhow::Result<()> {
        let Some(run) = self.storage.get_run(run_id).await? else {
            return Ok(());
        };

        let (queued, processing) = self.storage.run_item_remaining_counts(run_id).await?;

        let since_10m = Utc::now() - chrono::Duration::minutes(10);
        let since_60m = Utc::now() - chrono::Duration::minutes(60);
        let analyzed_10m = self.storage.count_analyzed_items_since(since_10m).await? as f64;
        let created_10m = self.storage.count_created_items_since(since_10m).await?.max(1) as f64;
        let analyzed_60m = self.storage.count_analyzed_items_since(since_60m).await? as f64;
        let created_60m = self.storage.count_created_items_since(since_60m).await?.max(1) as f64;

        let minutes_running = run
            .started_at
            .map(|t| (Utc::now() - t).num_seconds() as f64 / 60.0)
            .unwrap_or(1.0)
            .max(1.0 / 60.0);
        let items_per_minute = run.processed_count as f64 / minutes_running;
        let total_terminal = (run.processed_count + run.failed_count).max(1) as f64;
        let error_rate = run.failed_count as f64 / total_terminal;

        self.storage
            .update_run_slo_gauges(run_id, analyzed_10m / created_10m, analyzed_60m / created_60m, items_per_minute, error_rate)
            .await?;

        if queued == 0 && processing == 0 {
            self.storage.set_run_status(run_id, "completed").await?;
            info!(run_id, "run completed");
        }

        Ok(())
    }

    /// Step 4: heartbeat maintenance — stale reclaim, emergency-stop
    /// pause/resume of queue polling is implicit (admission checks the flag
    /// on every `process_queue`/`can_start` call).
    async fn periodic_maintenance(&self) {
        match self.storage.reset_stale_processing(self.settings.stale_processing).await {
            Ok(n) if n > 0 => info!(count = n, "reclaimed stale processing items"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to reset stale processing items"),
        }

        match self.admission.status().await {
            Ok(status) if status.emergency_stop => {
                debug!("emergency stop active, queue processing paused");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to read admission status"),
        }
    }
}
