//! Per-model pricing table
//!
//! Costs are USD per million tokens. Unknown model ids are a fatal
//! validation error; no default price exists to fall back onto.

use std::collections::HashMap;

use crate::error::{EdisonError, Result};

/// USD per million prompt/completion tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Pricing lookup keyed by (provider, model)
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<(String, String), ModelPrice>,
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    /// The built-in table covering the supported providers
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("openai", "gpt-4o", 2.50, 10.00);
        table.insert("openai", "gpt-4o-mini", 0.15, 0.60);
        table.insert("openai", "gpt-4.1", 2.00, 8.00);
        table.insert("openai", "gpt-4.1-mini", 0.40, 1.60);
        table.insert("anthropic", "claude-sonnet-4", 3.00, 15.00);
        table.insert("anthropic", "claude-sonnet-4-5", 3.00, 15.00);
        table.insert("anthropic", "claude-haiku-4-5", 1.00, 5.00);
        table.insert("anthropic", "claude-opus-4-1", 15.00, 75.00);
        table.insert("mock", "m1", 0.0, 0.0);
        table
    }

    pub fn insert(&mut self, provider: &str, model: &str, input_per_mtok: f64, output_per_mtok: f64) {
        self.prices.insert(
            (provider.to_string(), model.to_string()),
            ModelPrice {
                input_per_mtok,
                output_per_mtok,
            },
        );
    }

    /// Look up a price; unknown model ids are a validation error
    pub fn price(&self, provider: &str, model: &str) -> Result<ModelPrice> {
        self.prices
            .get(&(provider.to_string(), model.to_string()))
            .copied()
            .ok_or_else(|| EdisonError::Validation(format!("no pricing entry for {provider}/{model}")))
    }

    /// Pure cost estimate from token counts
    pub fn estimate_cost(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Result<f64> {
        let price = self.price(provider, model)?;
        Ok(prompt_tokens as f64 * price.input_per_mtok / 1_000_000.0
            + completion_tokens as f64 * price.output_per_mtok / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_cost() {
        let table = PricingTable::builtin();
        let cost = table.estimate_cost("openai", "gpt-4o", 1_000_000, 0).unwrap();
        assert!((cost - 2.50).abs() < 1e-9);

        let cost = table.estimate_cost("openai", "gpt-4o", 500_000, 100_000).unwrap();
        assert!((cost - (1.25 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_validation_error() {
        let table = PricingTable::builtin();
        let result = table.estimate_cost("openai", "gpt-99", 100, 100);
        assert!(matches!(result, Err(EdisonError::Validation(_))));

        let result = table.estimate_cost("nobody", "gpt-4o", 100, 100);
        assert!(matches!(result, Err(EdisonError::Validation(_))));
    }

    #[test]
    fn test_sonnet_aliases_share_a_rate() {
        let table = PricingTable::builtin();
        let a = table.price("anthropic", "claude-sonnet-4").unwrap();
        let b = table.price("anthropic", "claude-sonnet-4-5").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mock_is_free() {
        let table = PricingTable::builtin();
        assert_eq!(table.estimate_cost("mock", "m1", 1_000_000, 1_000_000).unwrap(), 0.0);
    }
}
