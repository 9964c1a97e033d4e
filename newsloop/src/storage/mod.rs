//! Storage Adapter (C1): typed access to feeds, items, runs, run_items,
//! queued_runs, pending_auto_analysis, feed_health, fetch_log and
//! config_changes. Write paths that touch multiple tables are single
//! transactions (see `feeds::complete_fetch`).

use sqlx::PgPool;

pub mod config_changes;
pub mod feeds;
pub mod items;
pub mod metrics;
pub mod pending;
pub mod queue;
pub mod runs;
pub mod templates;

/// Thin wrapper around the pool; every query lives in an `impl Storage`
/// block in one of this module's submodules, grouped by entity.
#[derive(Clone)]
pub struct Storage {
    pub pool: PgPool,
}

impl Storage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
