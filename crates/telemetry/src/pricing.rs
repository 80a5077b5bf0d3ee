//! Per-model token prices.
//!
//! Prices are in USD per 1 million tokens. Models missing from the table
//! cost 0.0, so an unpriced model still yields a valid (zero) cost.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

const DEFAULT_PRICES: &[(&str, f64, f64)] = &[
    // Z.ai
    ("zai/glm-4.7", 0.6, 2.2),
    ("zai/glm-4.6", 0.6, 2.2),
    ("zai/glm-4.5", 0.6, 2.2),
    ("zai/glm-4.5-air", 0.2, 1.1),
    ("zai/glm-4.5-flash", 0.0, 0.0),
    // Anthropic
    ("anthropic/claude-sonnet-4", 3.0, 15.0),
    ("anthropic/claude-opus-4", 15.0, 75.0),
    ("anthropic/claude-3.5-haiku", 0.8, 4.0),
    // OpenAI
    ("openai/gpt-4o", 2.5, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.6),
    ("openai/o3-mini", 1.1, 4.4),
    // DeepSeek
    ("deepseek/deepseek-v3", 0.27, 1.1),
];

impl PricingTable {
    pub fn with_defaults() -> Self {
        let prices = DEFAULT_PRICES
            .iter()
            .map(|(name, input, output)| (name.to_string(), ModelPricing::new(*input, *output)))
            .collect();
        Self {
            prices: RwLock::new(prices),
        }
    }

    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        prices.get(model).copied()
    }

    /// Add or replace pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        prices.insert(model.into(), pricing);
    }

    /// Cost for a model call, or 0.0 if the model is not priced.
    ///
    /// Matching order: exact name, then bare names compared with the routing
    /// prefix dropped on both sides (`anthropic/glm-4.7` finds `zai/glm-4.7`),
    /// then the longest bare key that prefixes the model
    /// (`glm-4.5-air-0111` finds `glm-4.5-air`).
    pub fn compute_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());

        if let Some(p) = prices.get(model) {
            return p.cost(input_tokens, output_tokens);
        }

        let model_lower = model.to_lowercase();
        let bare_model = bare(&model_lower);

        let mut exact: Option<(&str, &ModelPricing)> = None;
        let mut best: Option<(&str, &ModelPricing)> = None;
        for (key, pricing) in prices.iter() {
            let key_lower = key.to_lowercase();
            let bare_key = bare(&key_lower);
            // Keys iterate in arbitrary order; keep the smallest key for stable results.
            if bare_key == bare_model && exact.is_none_or(|(k, _)| key.as_str() < k) {
                exact = Some((key.as_str(), pricing));
            }
            if bare_model.starts_with(bare_key) {
                let longer = best.is_none_or(|(k, _)| bare(k).len() < bare_key.len());
                if longer {
                    best = Some((key.as_str(), pricing));
                }
            }
        }

        match exact.or(best) {
            Some((_, p)) => p.cost(input_tokens, output_tokens),
            None => 0.0,
        }
    }

    /// All known model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = prices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.prices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn bare(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}
