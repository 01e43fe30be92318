//! Cost calculation from model pricing.

use std::collections::HashMap;

use crate::config::ModelRate;
use crate::pipeline::TokenUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
}

impl RequestCost {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
    }
}

/// `rate(model).x * tokens / 1e6`, USD per 1M tokens. An unrecognized model
/// yields all-zero costs; the caller is responsible for emitting the
/// accompanying warning event.
pub fn compute_cost(
    model: &str,
    usage: &TokenUsage,
    pricing: &HashMap<String, ModelRate>,
) -> Option<RequestCost> {
    let rate = pricing.get(model)?;
    Some(RequestCost {
        input_cost: usage.input_tokens as f64 * rate.input / 1_000_000.0,
        output_cost: usage.output_tokens as f64 * rate.output / 1_000_000.0,
        cache_creation_cost: usage.cache_creation_tokens as f64 * rate.cache_creation / 1_000_000.0,
        cache_read_cost: usage.cache_read_tokens as f64 * rate.cache_read / 1_000_000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_identity_holds_to_ten_decimal_digits() {
        let mut pricing = HashMap::new();
        pricing.insert(
            "claude-3-5-haiku-20241022".to_string(),
            ModelRate {
                input: 3.0,
                output: 15.0,
                cache_creation: 3.75,
                cache_read: 0.3,
            },
        );
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cache_creation_tokens: 5,
            cache_read_tokens: 7,
        };
        let cost = compute_cost("claude-3-5-haiku-20241022", &usage, &pricing).unwrap();
        let expected_total = (10.0 * 3.0 + 20.0 * 15.0 + 5.0 * 3.75 + 7.0 * 0.3) / 1_000_000.0;
        assert!((cost.total() - expected_total).abs() < 1e-10);
    }

    #[test]
    fn unknown_model_yields_none() {
        let pricing = HashMap::new();
        let usage = TokenUsage::default();
        assert!(compute_cost("unknown-model", &usage, &pricing).is_none());
    }
}
