//! §4.8.2 cost model: per-model token pricing, per-item cost, and the
//! run-creation cost estimate.

use std::collections::HashMap;

use common::{ModelPrice, PricingConfig};

use crate::models::TokensUsed;

/// Average tokens per item used to produce a conservative `cost_estimate`
/// at run creation time, before any item has actually been processed.
pub const AVG_TOKENS_PER_ITEM: f64 = 500.0;

/// Soft cap (§4.8.2): exceeding this is a warning, never a hard stop.
pub const MAX_COST_PER_RUN_USD: f64 = 25.0;

/// The built-in cost table (§6), used when no pricing override is supplied
/// in configuration.
pub fn built_in_pricing() -> PricingConfig {
    let mut models = HashMap::new();
    let table: &[(&str, f64, f64, f64)] = &[
        ("gpt-5", 2.50, 20.00, 0.25),
        ("gpt-5-mini", 0.45, 3.60, 0.045),
        ("gpt-4.1", 3.50, 14.00, 0.875),
        ("gpt-4.1-mini", 0.70, 2.80, 0.175),
        ("gpt-4.1-nano", 0.20, 0.80, 0.05),
        ("gpt-4o", 4.25, 17.00, 2.125),
        ("gpt-4o-mini", 0.25, 1.00, 0.125),
    ];
    for (name, input, output, cached) in table {
        models.insert((*name).to_string(), ModelPrice { input: *input, output: *output, cached: *cached });
    }
    PricingConfig { models }
}

/// Resolve a model's price, falling back to the built-in table when the
/// supplied pricing config doesn't name the model (e.g. a fresh deployment
/// that hasn't synced its config override yet).
pub fn price_for_model<'a>(pricing: &'a PricingConfig, model: &str) -> Option<&'a ModelPrice> {
    pricing.models.get(model)
}

/// Sum over kinds of `(tokens_kind / 1e6) * price_kind`.
pub fn calculate_cost(price: &ModelPrice, tokens: TokensUsed) -> f64 {
    (tokens.input as f64 / 1_000_000.0) * price.input
        + (tokens.output as f64 / 1_000_000.0) * price.output
        + (tokens.cached as f64 / 1_000_000.0) * price.cached
}

/// Conservative run-creation estimate: average tokens per item, input price
/// only, no output/cached component (§4.8.2).
pub fn estimate_run_cost(price: &ModelPrice, item_count: i64) -> f64 {
    (item_count as f64) * (AVG_TOKENS_PER_ITEM / 1_000_000.0) * price.input
}

/// Resolve pricing with the built-in table as fallback, then estimate.
pub fn estimate_run_cost_for_model(pricing: &PricingConfig, model: &str, item_count: i64) -> f64 {
    let built_in = built_in_pricing();
    let price = price_for_model(pricing, model)
        .or_else(|| price_for_model(&built_in, model));
    match price {
        Some(p) => estimate_run_cost(p, item_count),
        None => 0.0,
    }
}

/// One model's total estimated cost for analyzing `item_count` items,
/// used by [`compare_models`].
#[derive(Debug, Clone)]
pub struct ModelComparison {
    pub model: String,
    pub total_cost_usd: f64,
    pub cost_per_item: f64,
}

/// Supplemental read-only helper (§11, grounded on `cost_estimator.py`'s
/// `compare_models`): estimate the run-creation cost across every model in
/// the built-in table plus any configured overrides, so an operator can pick
/// a model before submitting a run. Not on any critical path.
pub fn compare_models(pricing: &PricingConfig, item_count: i64) -> Vec<ModelComparison> {
    let built_in = built_in_pricing();
    let mut names: Vec<&str> = built_in.models.keys().map(|s| s.as_str()).collect();
    for name in pricing.models.keys() {
        if !built_in.models.contains_key(name) {
            names.push(name);
        }
    }
    names.sort_unstable();

    names
        .into_iter()
        .filter_map(|model| {
            let price = price_for_model(pricing, model).or_else(|| price_for_model(&built_in, model))?;
            let total = estimate_run_cost(price, item_count);
            Some(ModelComparison {
                model: model.to_string(),
                total_cost_usd: total,
                cost_per_item: if item_count > 0 { total / item_count as f64 } else { 0.0 },
            })
        })
        .collect()
}

/// Supplemental read-only helper (§11, grounded on `cost_estimator.py`'s
/// `get_budget_recommendations`): how many items a budget affords at a
/// given model's input price, plus small/medium/large batch suggestions
/// capped at the affordable maximum.
#[derive(Debug, Clone)]
pub struct BudgetRecommendation {
    pub max_items: i64,
    pub actual_cost_usd: f64,
    pub remaining_budget_usd: f64,
    pub small_batch: i64,
    pub medium_batch: i64,
    pub large_batch: i64,
}

pub fn budget_recommendation(price: &ModelPrice, budget_usd: f64) -> Option<BudgetRecommendation> {
    let cost_per_item = estimate_run_cost(price, 1);
    if cost_per_item <= 0.0 {
        return None;
    }
    let max_items = (budget_usd / cost_per_item) as i64;
    let actual_cost = max_items as f64 * cost_per_item;
    Some(BudgetRecommendation {
        max_items,
        actual_cost_usd: actual_cost,
        remaining_budget_usd: budget_usd - actual_cost,
        small_batch: max_items.min(50),
        medium_batch: max_items.min(200),
        large_batch: max_items.min(1000),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_table_covers_the_seven_models() {
        let pricing = built_in_pricing();
        assert_eq!(pricing.models.len(), 7);
        assert!(pricing.models.contains_key("gpt-4o-mini"));
    }

    #[test]
    fn calculate_cost_sums_all_three_kinds() {
        let price = ModelPrice { input: 2.0, output: 4.0, cached: 1.0 };
        let tokens = TokensUsed { input: 1_000_000, output: 500_000, cached: 1_000_000 };
        let cost = calculate_cost(&price, tokens);
        assert!((cost - (2.0 + 2.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn estimate_uses_input_price_only() {
        let price = ModelPrice { input: 2.0, output: 100.0, cached: 100.0 };
        let estimate = estimate_run_cost(&price, 2000);
        // 2000 items * 500 tokens = 1_000_000 tokens @ $2/1M = $2.00
        assert!((estimate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_built_in() {
        let empty = PricingConfig { models: HashMap::new() };
        let estimate = estimate_run_cost_for_model(&empty, "gpt-4o-mini", 2000);
        assert!(estimate > 0.0);
    }
}
