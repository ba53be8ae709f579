//! Routing-tier metadata for common LLM models.
//!
//! Prices are in USD per 1 million tokens and collapse into a coarse
//! billing-tier label that run results and audit records carry. Custom
//! pricing can be added at runtime.

use promptloom_core::message::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (f64::from(usage.input_tokens) * self.input_per_m
            + f64::from(usage.output_tokens) * self.output_per_m)
            / 1_000_000.0
    }
}

/// Coarse billing-tier label derived from pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTier {
    /// Under $1 per 1M input tokens.
    Economy,
    /// $1 to $10 per 1M input tokens.
    Standard,
    /// $10 and above per 1M input tokens.
    Premium,
}

impl std::fmt::Display for RoutingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Economy => write!(f, "economy"),
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl RoutingTier {
    fn from_pricing(pricing: &ModelPricing) -> Self {
        if pricing.input_per_m >= 10.0 {
            Self::Premium
        } else if pricing.input_per_m >= 1.0 {
            Self::Standard
        } else {
            Self::Economy
        }
    }
}

/// Thread-safe pricing/tier table with built-in defaults and overrides.
pub struct TierTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl TierTable {
    /// Create a table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── Anthropic ──────────────────────────────────────────────
        prices.insert(
            "claude-sonnet-4-20250514".into(),
            ModelPricing::new(3.0, 15.0),
        );
        prices.insert(
            "claude-opus-4-20250514".into(),
            ModelPricing::new(15.0, 75.0),
        );
        prices.insert(
            "claude-3-5-sonnet-20241022".into(),
            ModelPricing::new(3.0, 15.0),
        );
        prices.insert(
            "claude-haiku-35-20241022".into(),
            ModelPricing::new(0.8, 4.0),
        );

        // ── OpenAI ─────────────────────────────────────────────────
        prices.insert("gpt-4o".into(), ModelPricing::new(2.5, 10.0));
        prices.insert("gpt-4o-mini".into(), ModelPricing::new(0.15, 0.6));
        prices.insert("o1".into(), ModelPricing::new(15.0, 60.0));
        prices.insert("o3-mini".into(), ModelPricing::new(1.1, 4.4));

        // ── Google ─────────────────────────────────────────────────
        prices.insert("gemini-2.0-flash".into(), ModelPricing::new(0.1, 0.4));
        prices.insert("gemini-1.5-pro".into(), ModelPricing::new(1.25, 5.0));

        // ── DeepSeek ───────────────────────────────────────────────
        prices.insert("deepseek-v3".into(), ModelPricing::new(0.27, 1.1));
        prices.insert("deepseek-r1".into(), ModelPricing::new(0.55, 2.19));

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(model.into(), pricing);
        }
    }

    /// Look up pricing. Falls back to a prefix match so dated model ids
    /// ("claude-sonnet-4-20250514") resolve from a bare family name too.
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().ok()?;
        if let Some(p) = prices.get(model) {
            return Some(*p);
        }
        prices
            .iter()
            .find(|(known, _)| model.starts_with(known.as_str()) || known.starts_with(model))
            .map(|(_, p)| *p)
    }

    /// The billing tier for a model. Unknown models are treated as
    /// standard so audit records never lack a label.
    pub fn tier_for(&self, model: &str) -> RoutingTier {
        self.pricing_for(model)
            .map(|p| RoutingTier::from_pricing(&p))
            .unwrap_or(RoutingTier::Standard)
    }

    /// Estimated cost in USD for a model and usage, when pricing is known.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        self.pricing_for(model).map(|p| p.cost(usage))
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_computation() {
        let pricing = ModelPricing::new(3.0, 15.0);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
        };
        assert!((pricing.cost(&usage) - 4.5).abs() < 1e-9);
    }

    #[test]
    fn tiers_from_defaults() {
        let table = TierTable::with_defaults();
        assert_eq!(table.tier_for("claude-opus-4-20250514"), RoutingTier::Premium);
        assert_eq!(
            table.tier_for("claude-sonnet-4-20250514"),
            RoutingTier::Standard
        );
        assert_eq!(table.tier_for("gpt-4o-mini"), RoutingTier::Economy);
    }

    #[test]
    fn unknown_model_defaults_to_standard() {
        let table = TierTable::empty();
        assert_eq!(table.tier_for("some-local-model"), RoutingTier::Standard);
    }

    #[test]
    fn prefix_match_resolves_dated_ids() {
        let table = TierTable::empty();
        table.set("claude-sonnet-4", ModelPricing::new(3.0, 15.0));
        assert!(table.pricing_for("claude-sonnet-4-20250514").is_some());
        assert_eq!(
            table.tier_for("claude-sonnet-4-20250514"),
            RoutingTier::Standard
        );
    }

    #[test]
    fn override_replaces_pricing() {
        let table = TierTable::with_defaults();
        table.set("gpt-4o", ModelPricing::new(20.0, 80.0));
        assert_eq!(table.tier_for("gpt-4o"), RoutingTier::Premium);
    }

    #[test]
    fn tier_display() {
        assert_eq!(RoutingTier::Economy.to_string(), "economy");
        assert_eq!(RoutingTier::Standard.to_string(), "standard");
        assert_eq!(RoutingTier::Premium.to_string(), "premium");
    }
}
