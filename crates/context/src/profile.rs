//! Budget profiles — per-agent token budgeting configuration.
//!
//! A profile carries the agent's context window size, the output reserve,
//! and a fixed-shape record of six per-component token ceilings. Profiles
//! are created lazily with defaults when an agent is first seen and are
//! persisted by the store crate; raw budget maps coming from callers or
//! stored rows are normalized here before use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-component token ceilings. Fixed shape: exactly these six components
/// are recognized; normalization never introduces other keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentBudgets {
    /// Immutable system + developer prefix (checked, never trimmed)
    pub system: u32,
    /// Long-term memory text
    pub memory: u32,
    /// Conversation history turns
    pub history: u32,
    /// Retrieved documents
    pub retrieval: u32,
    /// Tool execution outputs
    pub tool_results: u32,
    /// Slack subtracted from the usable window before any content
    pub safety_margin: u32,
}

/// Current default budgets for newly-created profiles.
pub const DEFAULT_BUDGETS: ComponentBudgets = ComponentBudgets {
    system: 2000,
    memory: 1200,
    history: 6000,
    retrieval: 2400,
    tool_results: 2000,
    safety_margin: 256,
};

/// The budget set shipped before the defaults were re-tuned. Stored
/// profiles that still carry exactly this set are treated as "no override
/// supplied" and upgraded to the current defaults. This shim is deletable
/// once no persisted profiles contain these values; note that a hand-tuned
/// map recreating the full set field-for-field is indistinguishable from
/// the stale default and will also be upgraded.
pub const LEGACY_DEFAULT_BUDGETS: ComponentBudgets = ComponentBudgets {
    system: 1500,
    memory: 800,
    history: 4000,
    retrieval: 1600,
    tool_results: 1200,
    safety_margin: 128,
};

impl Default for ComponentBudgets {
    fn default() -> Self {
        DEFAULT_BUDGETS
    }
}

impl ComponentBudgets {
    /// The six recognized component names, in canonical order.
    pub const KEYS: [&'static str; 6] = [
        "system",
        "memory",
        "history",
        "retrieval",
        "tool_results",
        "safety_margin",
    ];

    fn get(&self, key: &str) -> Option<u32> {
        match key {
            "system" => Some(self.system),
            "memory" => Some(self.memory),
            "history" => Some(self.history),
            "retrieval" => Some(self.retrieval),
            "tool_results" => Some(self.tool_results),
            "safety_margin" => Some(self.safety_margin),
            _ => None,
        }
    }
}

/// Normalize a raw budget map into the fixed-shape record.
///
/// - A map that equals the known legacy default set field-for-field (all
///   six keys, exact values, nothing extra) is discarded entirely in favor
///   of the current defaults.
/// - Every recognized key is coerced to a non-negative integer; conversion
///   failures and negative values fall back to the current default.
/// - Unrecognized keys are ignored.
pub fn normalize_budgets(raw: &HashMap<String, serde_json::Value>) -> ComponentBudgets {
    if is_legacy_default_set(raw) {
        tracing::debug!("discarding legacy default budget set, using current defaults");
        return DEFAULT_BUDGETS;
    }

    ComponentBudgets {
        system: coerced(raw, "system", DEFAULT_BUDGETS.system),
        memory: coerced(raw, "memory", DEFAULT_BUDGETS.memory),
        history: coerced(raw, "history", DEFAULT_BUDGETS.history),
        retrieval: coerced(raw, "retrieval", DEFAULT_BUDGETS.retrieval),
        tool_results: coerced(raw, "tool_results", DEFAULT_BUDGETS.tool_results),
        safety_margin: coerced(raw, "safety_margin", DEFAULT_BUDGETS.safety_margin),
    }
}

fn coerced(raw: &HashMap<String, serde_json::Value>, key: &str, default: u32) -> u32 {
    raw.get(key).and_then(coerce_non_negative).unwrap_or(default)
}

/// Coerce a JSON value to a non-negative integer token count.
fn coerce_non_negative(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u32::try_from(u).ok()
            } else if let Some(f) = n.as_f64() {
                (f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX)).then(|| f as u32)
            } else {
                None
            }
        }
        serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn is_legacy_default_set(raw: &HashMap<String, serde_json::Value>) -> bool {
    raw.len() == ComponentBudgets::KEYS.len()
        && ComponentBudgets::KEYS.iter().all(|key| {
            let legacy = LEGACY_DEFAULT_BUDGETS.get(key);
            raw.get(*key).and_then(coerce_non_negative) == legacy
        })
}

/// Process-level defaults a new profile inherits (resolved from config by
/// the caller; kept here so the store crate need not depend on config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDefaults {
    pub model: String,
    pub provider: String,
    pub context_window_tokens: u32,
    pub reserved_output_tokens: u32,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            provider: "anthropic".into(),
            context_window_tokens: 200_000,
            reserved_output_tokens: 4096,
        }
    }
}

/// Per-agent budgeting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetProfile {
    /// Agent identity this profile belongs to
    pub name: String,

    /// Model requests are built for (also the estimator's model hint)
    pub model: String,

    /// Provider the dispatch layer routes to
    pub provider: String,

    /// Total model context size, in tokens
    pub context_window_tokens: u32,

    /// Tokens carved out for the model's answer
    pub reserved_output_tokens: u32,

    /// Per-component ceilings
    pub budgets: ComponentBudgets,
}

impl BudgetProfile {
    /// Create a fresh profile for an agent from process-level defaults.
    pub fn new(name: impl Into<String>, defaults: &ProfileDefaults) -> Self {
        Self {
            name: name.into(),
            model: defaults.model.clone(),
            provider: defaults.provider.clone(),
            context_window_tokens: defaults.context_window_tokens,
            reserved_output_tokens: defaults.reserved_output_tokens,
            budgets: DEFAULT_BUDGETS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map_of(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn legacy_map() -> HashMap<String, serde_json::Value> {
        map_of(&[
            ("system", json!(1500)),
            ("memory", json!(800)),
            ("history", json!(4000)),
            ("retrieval", json!(1600)),
            ("tool_results", json!(1200)),
            ("safety_margin", json!(128)),
        ])
    }

    #[test]
    fn empty_map_yields_defaults() {
        let budgets = normalize_budgets(&HashMap::new());
        assert_eq!(budgets, DEFAULT_BUDGETS);
    }

    #[test]
    fn legacy_set_discarded_entirely() {
        let budgets = normalize_budgets(&legacy_map());
        assert_eq!(budgets, DEFAULT_BUDGETS);
    }

    #[test]
    fn near_legacy_set_kept() {
        let mut raw = legacy_map();
        raw.insert("history".into(), json!(4001));
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.history, 4001);
        assert_eq!(budgets.system, 1500);
    }

    #[test]
    fn legacy_values_with_extra_key_kept() {
        let mut raw = legacy_map();
        raw.insert("unrelated".into(), json!(1));
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.system, LEGACY_DEFAULT_BUDGETS.system);
    }

    #[test]
    fn partial_map_filled_from_defaults() {
        let raw = map_of(&[("history", json!(1234))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.history, 1234);
        assert_eq!(budgets.system, DEFAULT_BUDGETS.system);
        assert_eq!(budgets.safety_margin, DEFAULT_BUDGETS.safety_margin);
    }

    #[test]
    fn negative_value_falls_back() {
        let raw = map_of(&[("memory", json!(-50))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.memory, DEFAULT_BUDGETS.memory);
    }

    #[test]
    fn garbage_value_falls_back() {
        let raw = map_of(&[("retrieval", json!("plenty")), ("system", json!(null))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.retrieval, DEFAULT_BUDGETS.retrieval);
        assert_eq!(budgets.system, DEFAULT_BUDGETS.system);
    }

    #[test]
    fn numeric_string_coerced() {
        let raw = map_of(&[("tool_results", json!("750"))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.tool_results, 750);
    }

    #[test]
    fn whole_float_coerced() {
        let raw = map_of(&[("system", json!(1800.0))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.system, 1800);
    }

    #[test]
    fn fractional_float_falls_back() {
        let raw = map_of(&[("system", json!(1800.5))]);
        let budgets = normalize_budgets(&raw);
        assert_eq!(budgets.system, DEFAULT_BUDGETS.system);
    }

    #[test]
    fn unknown_keys_never_survive() {
        let raw = map_of(&[("mystery", json!(42))]);
        let budgets = normalize_budgets(&raw);
        // The fixed-shape record has no slot for unknown keys.
        assert_eq!(budgets, DEFAULT_BUDGETS);
        let json = serde_json::to_value(budgets).unwrap();
        assert!(json.get("mystery").is_none());
    }

    #[test]
    fn new_profile_inherits_defaults() {
        let profile = BudgetProfile::new("maintenance", &ProfileDefaults::default());
        assert_eq!(profile.name, "maintenance");
        assert_eq!(profile.budgets, DEFAULT_BUDGETS);
        assert!(profile.reserved_output_tokens < profile.context_window_tokens);
    }

    #[test]
    fn profile_serialization_roundtrip() {
        let profile = BudgetProfile::new("billing", &ProfileDefaults::default());
        let json = serde_json::to_string(&profile).unwrap();
        let roundtrip: BudgetProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip, profile);
    }
}
