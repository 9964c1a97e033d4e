//! newsloop - single binary running the scheduler, the analysis worker, and
//! the metrics HTTP endpoint in one process. Each piece can be disabled via a
//! CLI flag so an operator can run dedicated scheduler-only or worker-only
//! processes against the same database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use newsloop::admission::AdmissionController;
use newsloop::breaker::{BreakerConfig, BreakerRegistry};
use newsloop::llm::remote::RemoteLlmClient;
use newsloop::llm::LlmClient;
use newsloop::metrics;
use newsloop::scheduler::Scheduler;
use newsloop::storage::Storage;
use newsloop::worker::{Worker, WorkerSettings};

#[derive(Parser, Debug)]
#[command(name = "newsloop", about = "Feed scheduler and analysis orchestration core")]
struct Args {
    /// Path to config.toml (overrides config.default.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable the dynamic scheduler (feed fetch dispatch)
    #[arg(long)]
    no_scheduler: bool,

    /// Disable the analysis worker
    #[arg(long)]
    no_worker: bool,

    /// Disable the metrics HTTP endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = match args.config {
        Some(p) => {
            if !p.exists() {
                error!(path = ?p, "specified config file not found");
                anyhow::bail!("config file not found: {}", p.display());
            }
            Some(p)
        }
        None => {
            let p = PathBuf::from("config.toml");
            p.exists().then_some(p)
        }
    };

    let config = Config::load_with_defaults(
        default_path.exists().then(|| default_path.as_path()),
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let pool = common::init_db_pool(&config.database)
        .await
        .context("failed to initialize database pool")?;
    common::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;
    let storage = Storage::new(pool);

    let breakers = Arc::new(BreakerRegistry::new());
    let shutdown = Arc::new(Notify::new());
    let admission = Arc::new(AdmissionController::new(storage.clone(), config.admission.clone()));

    let mut handles = Vec::new();

    if !args.no_scheduler {
        let db_breaker = breakers.get_or_create("db", BreakerConfig::db()).await;
        let mut scheduler = Scheduler::new(
            storage.clone(),
            db_breaker,
            shutdown.clone(),
            &config.scheduler,
        );
        scheduler
            .load_initial()
            .await
            .context("failed to load initial feed schedule")?;
        handles.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!(error = %e, "scheduler task failed");
            }
        }));
        info!("scheduler task started");
    }

    if !args.no_worker {
        let llm = build_llm_client(&config)?;
        let settings = WorkerSettings::from(&config.worker);
        let worker = Worker::new(
            storage.clone(),
            admission.clone(),
            llm,
            &breakers,
            config.pricing.clone(),
            default_model(&config),
            settings,
            shutdown.clone(),
        )
        .await;
        handles.push(tokio::spawn(async move {
            worker.run().await;
        }));
        info!("worker task started");
    }

    if !args.no_metrics {
        let metrics_storage = storage.clone();
        let metrics_breakers = breakers.clone();
        let metrics_admission = admission.clone();
        let metrics_config = config.metrics.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) =
                metrics::serve(&metrics_config, metrics_storage, metrics_breakers, metrics_admission).await
            {
                error!(error = %e, "metrics server failed");
            }
        }));
        info!(bind = %config.metrics.bind, port = config.metrics.port, "metrics endpoint started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, notifying tasks");
    shutdown.notify_waiters();

    for handle in handles {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(20), handle).await {
            error!(error = %e, "task did not exit within the shutdown grace period");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn default_model(config: &Config) -> String {
    config
        .llm
        .as_ref()
        .and_then(|l| l.remote.as_ref())
        .map(|r| r.model.clone())
        .unwrap_or_else(|| "gpt-4.1-mini".to_string())
}

fn build_llm_client(config: &Config) -> Result<Arc<dyn LlmClient>> {
    let remote = config
        .llm
        .as_ref()
        .and_then(|l| l.remote.as_ref())
        .context("worker enabled but no [llm.remote] section configured")?;

    let api_key = std::env::var(&remote.api_key_env)
        .with_context(|| format!("LLM API key env var '{}' not set", remote.api_key_env))?;

    Ok(Arc::new(RemoteLlmClient::new(
        remote.api_url.clone(),
        api_key,
        remote.model.clone(),
        remote.timeout_seconds,
        remote.max_tokens,
    )))
}
