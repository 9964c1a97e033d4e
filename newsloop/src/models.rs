//! Shared domain types for feeds, items, runs and the run queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub fetch_interval_minutes: i32,
    pub status: String,
    pub last_fetched: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub auto_analyze_enabled: bool,
    pub scrape_full_content: bool,
    pub configuration_hash: Option<String>,
    pub is_critical: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub content_hash: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    NotModified,
    Error,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::NotModified => "not_modified",
            FetchOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub items_found: Option<i32>,
    pub items_new: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedHealth {
    pub feed_id: i64,
    pub ok_ratio: f64,
    pub consecutive_failures: i32,
    pub avg_response_time_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub uptime_24h: f64,
    pub uptime_7d: f64,
}

/// One entry in the append-only configuration change log (C4).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigChange {
    pub id: i64,
    pub change_type: String,
    pub feed_id: Option<i64>,
    pub template_id: Option<i64>,
    pub old_config: Option<serde_json::Value>,
    pub new_config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Run trigger, carried through to priority derivation (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
    Auto,
}

impl TriggeredBy {
    pub fn priority(&self) -> Priority {
        match self {
            TriggeredBy::Manual => Priority::High,
            TriggeredBy::Scheduled => Priority::Medium,
            TriggeredBy::Auto => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Scheduled => "scheduled",
            TriggeredBy::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    // Ord derives low-to-high; queue dequeue order wants HIGH first, so
    // callers sort by `Reverse(priority)` or compare descending explicitly.
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }

    pub fn rank(&self) -> i32 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// A scope discriminator + payload, tagged so unknown types are rejected at
/// ingress rather than at use (§9 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunScope {
    Items { item_ids: Vec<i64> },
    Feeds { feed_ids: Vec<i64> },
    Timerange {
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub model: String,
    #[serde(default = "default_rate")]
    pub rate_per_second: f64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub override_existing: bool,
    #[serde(default)]
    pub unanalyzed_only: bool,
    pub min_impact_threshold: Option<f64>,
    pub max_impact_threshold: Option<f64>,
}

fn default_rate() -> f64 {
    1.0
}
fn default_limit() -> i64 {
    5000
}

impl RunParams {
    /// Clamp rate_per_second into the allowed band.
    pub fn clamped_rate(&self) -> f64 {
        self.rate_per_second.clamp(0.2, 3.0)
    }

    pub fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 5000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisRun {
    pub id: i64,
    pub scope: serde_json::Value,
    pub params: serde_json::Value,
    pub scope_hash: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub cost_estimate: f64,
    pub actual_cost: f64,
    pub last_error: Option<String>,
    pub queued_count: i32,
    pub processed_count: i32,
    pub failed_count: i32,
    pub coverage_10m: Option<f64>,
    pub coverage_60m: Option<f64>,
    pub items_per_minute: Option<f64>,
    pub error_rate: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunItemState {
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl RunItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunItemState::Queued => "queued",
            RunItemState::Processing => "processing",
            RunItemState::Completed => "completed",
            RunItemState::Failed => "failed",
            RunItemState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisRunItem {
    pub id: i64,
    pub run_id: i64,
    pub item_id: i64,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_used: Option<serde_json::Value>,
    pub cost_usd: Option<f64>,
    pub sentiment: Option<serde_json::Value>,
    pub impact: Option<serde_json::Value>,
    pub model_tag: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedRun {
    pub id: i64,
    pub priority: String,
    pub status: String,
    pub scope_hash: String,
    pub scope_json: serde_json::Value,
    pub params_json: serde_json::Value,
    pub analysis_run_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Count of QUEUED rows ahead of this one by priority then age (§11's
    /// `_calculate_queue_position`). Only populated by queries that compute
    /// it explicitly (`Storage::queue_list`); absent (`None`) on plain
    /// `SELECT *` reads like `dequeue_run`.
    #[sqlx(default)]
    pub queue_position: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingAutoAnalysis {
    pub id: i64,
    pub feed_id: i64,
    pub item_ids: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Per-item token counts, as returned by the LLM client contract (§6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokensUsed {
    pub input: i64,
    pub output: i64,
    #[serde(default)]
    pub cached: i64,
}
