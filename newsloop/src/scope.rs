//! Scope hashing (§4.6) and scope materialization (§4.8.1).
//!
//! The scope hash is the dedup key for both the run queue and active
//! analysis runs: two requests that would touch the same items under the
//! same model collapse to the same hash regardless of submission order.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::models::{RunParams, RunScope};
use crate::storage::Storage;

/// Canonical JSON used for hashing: field order fixed, ids sorted.
fn canonical_json(scope: &RunScope, params: &RunParams) -> serde_json::Value {
    let (scope_type, ids, start_time, end_time) = match scope {
        RunScope::Items { item_ids } => {
            let mut ids = item_ids.clone();
            ids.sort_unstable();
            ("items", ids, None, None)
        }
        RunScope::Feeds { feed_ids } => {
            let mut ids = feed_ids.clone();
            ids.sort_unstable();
            ("feeds", ids, None, None)
        }
        RunScope::Timerange { start_time, end_time } => {
            ("timerange", Vec::new(), Some(*start_time), Some(*end_time))
        }
        RunScope::Global => ("global", Vec::new(), None, None),
    };

    serde_json::json!({
        "type": scope_type,
        "ids": ids,
        "start_time": start_time,
        "end_time": end_time,
        "model_tag": params.model,
        "limit": params.clamped_limit(),
    })
}

/// SHA-256 over the canonical scope JSON, truncated to 16 hex chars. A
/// shorter digest is deliberate: this is a dedup key, not a security
/// boundary, and 16 hex chars (64 bits) makes accidental collision
/// astronomically unlikely at this system's scale.
pub fn scope_hash(scope: &RunScope, params: &RunParams) -> String {
    let value = canonical_json(scope, params);
    let bytes = serde_json::to_vec(&value).expect("canonical scope json is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

/// Resolve a scope + params into the concrete, capped list of item ids an
/// analysis run should materialize (§4.8.1).
pub async fn materialize(storage: &Storage, scope: &RunScope, params: &RunParams) -> Result<Vec<i64>> {
    let mut ids = match scope {
        RunScope::Items { item_ids } => item_ids.clone(),
        RunScope::Feeds { feed_ids } => storage.item_ids_for_feeds(feed_ids).await?,
        RunScope::Timerange { start_time, end_time } => {
            storage.item_ids_in_timerange(*start_time, *end_time).await?
        }
        RunScope::Global => storage.all_item_ids_newest_first().await?,
    };

    if params.unanalyzed_only && !params.override_existing && !ids.is_empty() {
        let analyzed = storage.already_analyzed_item_ids(&ids).await?;
        let analyzed: std::collections::HashSet<i64> = analyzed.into_iter().collect();
        ids.retain(|id| !analyzed.contains(id));
    }

    // min/max impact thresholds bound a prior analysis's impact.overall
    // score (§4.8.1). Items with no completed analysis have no score to
    // bound, so they pass through untouched rather than being excluded.
    if !ids.is_empty() && (params.min_impact_threshold.is_some() || params.max_impact_threshold.is_some()) {
        let scores = storage.latest_impact_overall(&ids).await?;
        ids.retain(|id| match scores.get(id) {
            Some(score) => {
                params.min_impact_threshold.map_or(true, |min| *score >= min)
                    && params.max_impact_threshold.map_or(true, |max| *score <= max)
            }
            None => true,
        });
    }

    let limit = params.clamped_limit() as usize;
    ids.truncate(limit);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunParams;

    fn params(model: &str) -> RunParams {
        RunParams {
            model: model.to_string(),
            rate_per_second: 1.0,
            limit: 100,
            override_existing: false,
            unanalyzed_only: false,
            min_impact_threshold: None,
            max_impact_threshold: None,
        }
    }

    #[test]
    fn same_ids_different_order_hash_equal() {
        let a = RunScope::Items { item_ids: vec![3, 1, 2] };
        let b = RunScope::Items { item_ids: vec![1, 2, 3] };
        assert_eq!(scope_hash(&a, &params("gpt")), scope_hash(&b, &params("gpt")));
    }

    #[test]
    fn different_models_hash_differently() {
        let scope = RunScope::Global;
        assert_ne!(scope_hash(&scope, &params("gpt")), scope_hash(&scope, &params("claude")));
    }

    #[test]
    fn hash_is_16_hex_chars() {
        let scope = RunScope::Global;
        let h = scope_hash(&scope, &params("gpt"));
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
