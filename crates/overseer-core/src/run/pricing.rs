//! Static per-token pricing table
//!
//! Rates are USD per million tokens. Cache writes bill at 1.25x the input
//! rate and cache reads at 0.1x, per the provider's published caching
//! economics. Models missing from the table are treated as unpriced; cost
//! computation fails closed to zero rather than raising.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// USD per million tokens for one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl ModelRates {
    const fn new(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_write: input * 1.25,
            cache_read: input * 0.1,
        }
    }
}

static PRICING: Lazy<HashMap<&'static str, ModelRates>> = Lazy::new(|| {
    let opus = ModelRates::new(5.0, 25.0);
    let sonnet = ModelRates::new(3.0, 15.0);
    let haiku = ModelRates::new(1.0, 5.0);

    let mut table = HashMap::new();
    table.insert("opus", opus);
    table.insert("claude-opus-5", opus);
    table.insert("claude-opus-4-8", opus);
    table.insert("sonnet", sonnet);
    table.insert("claude-sonnet-5", sonnet);
    table.insert("claude-sonnet-4-6", sonnet);
    table.insert("haiku", haiku);
    table.insert("claude-haiku-4-5", haiku);
    table
});

/// Look up rates for a model selector. None for unknown models.
pub fn rates_for(model: &str) -> Option<ModelRates> {
    PRICING.get(model).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_share_rates() {
        assert_eq!(rates_for("opus"), rates_for("claude-opus-5"));
        assert_eq!(rates_for("sonnet"), rates_for("claude-sonnet-5"));
    }

    #[test]
    fn test_cache_rates_derived_from_input() {
        let sonnet = rates_for("sonnet").unwrap();
        assert!((sonnet.cache_write - 3.75).abs() < f64::EPSILON);
        assert!((sonnet.cache_read - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_none() {
        assert!(rates_for("gpt-7-mega").is_none());
    }
}
