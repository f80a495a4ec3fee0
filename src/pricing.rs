//! Token pricing: map (model, token counts) to USD cost components.

use tracing::warn;

use crate::config::{ModelPrice, PricingEntry};
use crate::usage::extract::TokenUsage;
use crate::wildcard;

/// Cost breakdown for a single request, USD, rounded to 6 decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
    pub total: f64,
}

/// Round to 6 decimal places (micro-dollar precision).
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn find_price<'a>(pricing: &'a [PricingEntry], model: &str) -> Option<&'a ModelPrice> {
    let pattern = wildcard::find_first(pricing.iter().map(|e| e.pattern.as_str()), model)?;
    pricing
        .iter()
        .find(|e| e.pattern == pattern)
        .map(|e| &e.price)
}

/// Compute the cost of `usage` under the table's first matching entry.
///
/// Prices are USD per 1,000 tokens. Each category is rounded to 6 decimals;
/// the total is the unrounded sum rounded once. No matching entry yields all
/// zeros and a warning.
pub fn cost_for(pricing: &[PricingEntry], model: &str, usage: &TokenUsage) -> Cost {
    let Some(price) = find_price(pricing, model) else {
        warn!(model, "no pricing entry matches model, recording zero cost");
        return Cost::default();
    };

    let input = usage.input_tokens as f64 / 1000.0 * price.input;
    let output = usage.output_tokens as f64 / 1000.0 * price.output;
    let cache_creation = usage.cache_creation_tokens as f64 / 1000.0 * price.cache_creation;
    let cache_read = usage.cache_read_tokens as f64 / 1000.0 * price.cache_read;

    Cost {
        input: round6(input),
        output: round6(output),
        cache_creation: round6(cache_creation),
        cache_read: round6(cache_read),
        total: round6(input + output + cache_creation + cache_read),
    }
}
