//! Build result types — the output contract of the request builder.
//!
//! Everything here is serde-serializable because run records persist the
//! trimming audit trail and component accounting verbatim.

use promptloom_core::message::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a build (and, in dispatch, of a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Everything fit without trimming.
    Ok,
    /// At least one trimming stage fired; the request still fits.
    Trimmed,
    /// Configuration or capacity error; no request was produced.
    Blocked,
    /// Transport/provider failure (dispatch only; never set by `build`).
    Error,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Trimmed => write!(f, "trimmed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl BuildStatus {
    /// Parse the wire name back into a status (inverse of `Display`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "trimmed" => Some(Self::Trimmed),
            "blocked" => Some(Self::Blocked),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Which trimming stage fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimAction {
    /// Oldest whole history turns dropped.
    DropHistoryBefore,
    /// Retrieval items dropped from the end and/or the survivor truncated.
    ReduceRetrieval,
    /// Tool outputs truncated (head/tail, then binary search).
    TruncateToolOutputs,
    /// Memory collapsed / summarized / truncated.
    SummarizeMemory,
}

impl std::fmt::Display for TrimAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropHistoryBefore => write!(f, "drop_history_before"),
            Self::ReduceRetrieval => write!(f, "reduce_retrieval"),
            Self::TruncateToolOutputs => write!(f, "truncate_tool_outputs"),
            Self::SummarizeMemory => write!(f, "summarize_memory"),
        }
    }
}

/// One trimming stage that actually fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimEntry {
    pub action: TrimAction,
    pub before_tokens: usize,
    pub after_tokens: usize,

    /// How many whole turns were dropped (history stage only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_turns: Option<usize>,

    /// Which item ids were dropped, in drop order (retrieval stage only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_ids: Vec<String>,
}

/// Per-component token counts after trimming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentTokens {
    pub system: usize,
    pub memory: usize,
    pub history: usize,
    pub retrieval: usize,
    pub tool_results: usize,
    pub user_message: usize,
}

/// A short head/tail excerpt of a component's final text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPreview {
    pub head: String,
    pub tail: String,
}

/// Provenance of what survived trimming, for audit and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedSummary {
    /// Ids of the history messages that survived, in order.
    pub history_message_ids: Vec<String>,

    /// Ids of the retrieval items that survived, in order.
    pub retrieval_ids: Vec<String>,

    /// Ids of the tool results that survived, in order.
    pub tool_result_ids: Vec<String>,

    /// Head/tail previews keyed by component name.
    pub previews: BTreeMap<String, ComponentPreview>,
}

/// The full output contract of one `build()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildStatus,

    /// Present iff status is `blocked` or `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Final ordered message sequence, ready to send. Empty when blocked.
    pub messages: Vec<ChatMessage>,

    pub component_tokens: ComponentTokens,

    pub included: IncludedSummary,

    /// One entry per stage that fired, in pipeline order.
    pub trimming_applied: Vec<TrimEntry>,

    /// Estimated token count of the assembled sequence.
    pub input_tokens_estimated: usize,

    /// Window capacity left after input and reserved output.
    pub headroom: usize,

    // Resolved profile values used for this build.
    pub model: String,
    pub provider: String,
    pub context_window_tokens: u32,
    pub reserved_output_tokens: u32,
}

impl BuildResult {
    /// A blocked result: no messages, an explanatory error, zeroed counts.
    pub(crate) fn blocked(
        model: &str,
        provider: &str,
        context_window_tokens: u32,
        reserved_output_tokens: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: BuildStatus::Blocked,
            error: Some(error.into()),
            messages: Vec::new(),
            component_tokens: ComponentTokens::default(),
            included: IncludedSummary::default(),
            trimming_applied: Vec::new(),
            input_tokens_estimated: 0,
            headroom: 0,
            model: model.to_string(),
            provider: provider.to_string(),
            context_window_tokens,
            reserved_output_tokens,
        }
    }

    /// True when a request was produced and may be dispatched.
    pub fn is_sendable(&self) -> bool {
        matches!(self.status, BuildStatus::Ok | BuildStatus::Trimmed)
    }
}
