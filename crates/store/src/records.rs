//! Persistence record shapes — one run record and one context snapshot per
//! `run()` call, both write-once.

use chrono::{DateTime, Utc};
use promptloom_context::profile::ComponentBudgets;
use promptloom_context::result::{BuildResult, BuildStatus, ComponentTokens, TrimEntry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable audit record of one dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run id (idempotency key for the append).
    pub id: String,

    /// Agent this run belongs to.
    pub agent: String,

    pub model: String,
    pub provider: String,

    /// Final status: build status, or `error` on transport failure.
    pub status: BuildStatus,

    /// Present iff status is `blocked` or `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Billing-tier label resolved from the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_tier: Option<String>,

    /// The builder's estimate for the assembled request.
    pub estimated_input_tokens: usize,

    /// Provider-reported usage, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_output_tokens: Option<u32>,

    /// Full trimming audit trail from the build.
    pub trimming_applied: Vec<TrimEntry>,

    /// Per-component accounting from the build.
    pub component_tokens: ComponentTokens,

    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Start a record from a build result; usage and final status are
    /// filled in by the dispatch layer before the append.
    pub fn from_build(agent: &str, build: &BuildResult) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            model: build.model.clone(),
            provider: build.provider.clone(),
            status: build.status,
            error: build.error.clone(),
            routing_tier: None,
            estimated_input_tokens: build.input_tokens_estimated,
            measured_input_tokens: None,
            measured_output_tokens: None,
            trimming_applied: build.trimming_applied.clone(),
            component_tokens: build.component_tokens,
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time capture of the resolved budgets for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// The run this snapshot belongs to.
    pub run_id: String,

    pub agent: String,

    /// Budgets in effect for the build.
    pub budgets: ComponentBudgets,

    pub context_window_tokens: u32,
    pub reserved_output_tokens: u32,

    /// Headroom the build left unused.
    pub headroom: usize,

    pub created_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn new(run_id: &str, agent: &str, budgets: ComponentBudgets, build: &BuildResult) -> Self {
        Self {
            run_id: run_id.to_string(),
            agent: agent.to_string(),
            budgets,
            context_window_tokens: build.context_window_tokens,
            reserved_output_tokens: build.reserved_output_tokens,
            headroom: build.headroom,
            created_at: Utc::now(),
        }
    }
}
