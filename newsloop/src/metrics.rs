//! Metrics & Cost Aggregator (C9) HTTP surface. The aggregator itself is an
//! in-process registry — `BreakerRegistry::snapshot`, `AdmissionController::status`,
//! and the `feed_metrics`/`queue_metrics` rollups in `storage::metrics` — this
//! module only renders that registry as a minimal text exposition format over
//! one HTTP endpoint. No scrape-protocol negotiation, no metric families, no
//! histograms: that richer stack is an external collaborator (§1), not
//! something this core hosts.

use std::sync::Arc;

use rocket::http::ContentType;
use rocket::{get, routes, State};

use crate::admission::AdmissionController;
use crate::breaker::{BreakerRegistry, CircuitState};
use crate::storage::Storage;

pub struct MetricsState {
    pub storage: Storage,
    pub breakers: Arc<BreakerRegistry>,
    pub admission: Arc<AdmissionController>,
}

#[get("/healthz")]
fn healthz() -> &'static str {
    "ok"
}

#[get("/metrics")]
async fn metrics(state: &State<MetricsState>) -> (ContentType, String) {
    (ContentType::Plain, render(state).await)
}

fn breaker_state_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

async fn render(state: &MetricsState) -> String {
    let mut out = String::new();

    out.push_str("# HELP newsloop_breaker_state circuit breaker state: 0=closed 1=half_open 2=open\n");
    out.push_str("# TYPE newsloop_breaker_state gauge\n");
    for (name, circuit_state, stats) in state.breakers.snapshot().await {
        out.push_str(&format!(
            "newsloop_breaker_state{{breaker=\"{name}\"}} {}\n",
            breaker_state_value(circuit_state)
        ));
        out.push_str(&format!(
            "newsloop_breaker_errors_total{{breaker=\"{name}\"}} {}\n",
            stats.total_errors
        ));
        out.push_str(&format!(
            "newsloop_breaker_consecutive_errors{{breaker=\"{name}\"}} {}\n",
            stats.consecutive_errors
        ));
        out.push_str(&format!(
            "newsloop_breaker_recovery_attempts_total{{breaker=\"{name}\"}} {}\n",
            stats.recovery_attempts
        ));
        for (kind, count) in &stats.errors_by_kind {
            out.push_str(&format!(
                "newsloop_breaker_errors_by_kind_total{{breaker=\"{name}\",kind=\"{kind}\"}} {count}\n"
            ));
        }
    }

    out.push_str("# HELP newsloop_admission_active_runs analysis runs currently running\n");
    out.push_str("# TYPE newsloop_admission_active_runs gauge\n");
    match state.admission.status().await {
        Ok(status) => {
            out.push_str(&format!("newsloop_admission_active_runs {}\n", status.active_runs));
            out.push_str(&format!("newsloop_admission_max_concurrent {}\n", status.max_concurrent));
            out.push_str(&format!("newsloop_admission_queued_runs {}\n", status.queued_runs));
            out.push_str(&format!("newsloop_admission_daily_runs {}\n", status.daily_runs));
            out.push_str(&format!("newsloop_admission_daily_auto_runs {}\n", status.daily_auto_runs));
            out.push_str(&format!("newsloop_admission_hourly_runs {}\n", status.hourly_runs));
            out.push_str(&format!(
                "newsloop_admission_emergency_stop {}\n",
                if status.emergency_stop { 1 } else { 0 }
            ));
        }
        Err(e) => {
            out.push_str(&format!("# admission status unavailable: {e:#}\n"));
        }
    }

    out.push_str("# HELP newsloop_feed_spend_usd total cost for the top-spending feeds over the trailing 7 days\n");
    out.push_str("# TYPE newsloop_feed_spend_usd gauge\n");
    match state.storage.top_spend_feeds(7, 10).await {
        Ok(rows) => {
            for (feed_id, total) in rows {
                out.push_str(&format!("newsloop_feed_spend_usd{{feed_id=\"{feed_id}\"}} {total}\n"));
            }
        }
        Err(e) => {
            out.push_str(&format!("# top-spend feeds unavailable: {e:#}\n"));
        }
    }

    out
}

/// Launches the metrics HTTP server; runs until Rocket's own shutdown fairing
/// fires (SIGINT/SIGTERM) or the process exits.
pub async fn serve(
    config: &common::MetricsServerConfig,
    storage: Storage,
    breakers: Arc<BreakerRegistry>,
    admission: Arc<AdmissionController>,
) -> anyhow::Result<()> {
    let figment = rocket::Config::figment()
        .merge(("address", config.bind.clone()))
        .merge(("port", config.port));

    let state = MetricsState {
        storage,
        breakers,
        admission,
    };

    rocket::custom(figment)
        .manage(state)
        .mount("/", routes![healthz, metrics])
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("metrics server failed: {e}"))?;

    Ok(())
}
