//! Request assembly pipeline — the core architectural component.
//!
//! Takes unbounded candidate content plus a budget profile and produces a
//! bounded, fully-ordered message sequence, trimming in a strict fixed
//! order:
//!
//! 1. **Window sanity** — reserved output must fit inside the window
//! 2. **Usable budget** — window minus reserved minus safety margin
//! 3. **Immutable prefix** — system + developer checked, never trimmed
//! 4. **History** — oldest whole turns dropped first
//! 5. **Retrieval** — items dropped from the end, survivor truncated
//! 6. **Tool results** — head/tail truncation, then binary search
//! 7. **Memory** — collapse, sentence summary, then binary search
//! 8. **Assembly** in fixed component order, user message always last
//! 9. **Final verification** against the usable budget
//!
//! # Determinism
//!
//! Assembly is deterministic: identical inputs always produce identical
//! messages, component counts, and trimming entries. No random or
//! time-dependent logic is used; injected context messages carry fixed ids.

use crate::estimator::{MESSAGE_BASE_TOKENS, MESSAGE_OVERHEAD_TOKENS, TokenEstimator};
use crate::profile::{BudgetProfile, normalize_budgets};
use crate::result::{
    BuildResult, BuildStatus, ComponentPreview, ComponentTokens, IncludedSummary, TrimAction,
    TrimEntry,
};
use promptloom_core::message::{ChatMessage, ContentItem, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MEMORY_HEADER: &str = "[Memory]\n";
const RETRIEVAL_HEADER: &str = "[Retrieved Context]\n";
const TOOL_RESULTS_HEADER: &str = "[Tool Results]\n";
const TRUNCATION_MARKER: &str = "...(truncated)...";

/// Hard cap on binary-search probes during character truncation. Bounded by
/// construction so worst-case cost stays easy to reason about.
const MAX_TRUNCATE_PROBES: usize = 18;

/// Head/tail line counts for tool output truncation.
const HEAD_LINES_KEPT: usize = 3;
const TAIL_LINES_KEPT: usize = 6;

/// Preview excerpt length for the provenance record.
const PREVIEW_CHARS: usize = 48;

/// All candidate content for a single build. Owned by the caller; the
/// builder never mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildInput {
    /// Non-negotiable behavioral rules. Never trimmed.
    pub system_prompt: String,

    /// Caller-level instructions layered under the system prompt. Never
    /// trimmed.
    pub developer_prompt: String,

    /// Long-term memory text. Summarizable.
    pub memory: String,

    /// Prior conversation, oldest first. Trimmable by whole turns.
    pub history: Vec<ChatMessage>,

    /// Retrieved documents, highest priority first. Items may be dropped
    /// from the end or truncated.
    pub retrieval: Vec<ContentItem>,

    /// Tool execution outputs. Truncatable.
    pub tool_results: Vec<ContentItem>,

    /// The new user message. Always included last, never trimmed.
    pub user_message: String,
}

/// Per-call overrides for administrative tooling; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_output_tokens: Option<u32>,

    /// Raw budget map; normalized exactly like a stored one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets: Option<HashMap<String, serde_json::Value>>,
}

/// The request builder. Stateless apart from the estimator's encoder
/// cache — create one and reuse it across agents and threads.
pub struct RequestBuilder {
    estimator: TokenEstimator,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            estimator: TokenEstimator::new(),
        }
    }

    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Run the full trimming pipeline. Never panics and never returns an
    /// `Err`: every failure mode is represented in the returned status.
    pub fn build(
        &self,
        profile: &BudgetProfile,
        input: &BuildInput,
        overrides: Option<&BuildOverrides>,
    ) -> BuildResult {
        let window = overrides
            .and_then(|o| o.context_window_tokens)
            .unwrap_or(profile.context_window_tokens);
        let reserved = overrides
            .and_then(|o| o.reserved_output_tokens)
            .unwrap_or(profile.reserved_output_tokens);
        let budgets = match overrides.and_then(|o| o.budgets.as_ref()) {
            Some(raw) => normalize_budgets(raw),
            None => profile.budgets,
        };
        let hint = profile.model.as_str();

        // 1. Window sanity check.
        if reserved >= window {
            return BuildResult::blocked(
                &profile.model,
                &profile.provider,
                window,
                reserved,
                format!(
                    "reserved output tokens ({reserved}) must be smaller than the context window ({window})"
                ),
            );
        }

        // 2. Usable budget.
        let usable = i64::from(window) - i64::from(reserved) - i64::from(budgets.safety_margin);
        if usable <= 0 {
            return BuildResult::blocked(
                &profile.model,
                &profile.provider,
                window,
                reserved,
                format!(
                    "no usable input budget: window {window} minus reserved {reserved} minus safety margin {} leaves {usable} tokens",
                    budgets.safety_margin
                ),
            );
        }
        let max_input = usable as usize;

        // 3. Immutable prefix check.
        let system_tokens = self.estimator.count_text(&input.system_prompt, hint);
        let developer_tokens = self.estimator.count_text(&input.developer_prompt, hint);
        let prefix_tokens = system_tokens + developer_tokens;
        if prefix_tokens > budgets.system as usize {
            return BuildResult::blocked(
                &profile.model,
                &profile.provider,
                window,
                reserved,
                format!(
                    "system/developer prefix measures {prefix_tokens} tokens ({system_tokens} system + {developer_tokens} developer), exceeding the system budget of {}",
                    budgets.system
                ),
            );
        }

        let mut trimming: Vec<TrimEntry> = Vec::new();

        // 4–7. Trimming stages, in contract order.
        let (kept_history, history_tokens) =
            self.trim_history(&input.history, budgets.history as usize, hint, &mut trimming);
        let (kept_retrieval, retrieval_tokens) = self.trim_retrieval(
            &input.retrieval,
            budgets.retrieval as usize,
            hint,
            &mut trimming,
        );
        let (kept_tools, tool_tokens) = self.trim_tool_results(
            &input.tool_results,
            budgets.tool_results as usize,
            hint,
            &mut trimming,
        );
        let (memory_text, memory_tokens) =
            self.trim_memory(&input.memory, budgets.memory as usize, hint, &mut trimming);

        // 8. Assembly, fixed component order, user message always last.
        let mut messages: Vec<ChatMessage> = Vec::new();
        if !input.system_prompt.is_empty() {
            messages.push(ChatMessage::with_id(
                "system",
                Role::System,
                input.system_prompt.clone(),
            ));
        }
        if !input.developer_prompt.is_empty() {
            messages.push(ChatMessage::with_id(
                "developer",
                Role::System,
                input.developer_prompt.clone(),
            ));
        }
        if !memory_text.is_empty() {
            messages.push(ChatMessage::with_id(
                "memory",
                Role::System,
                format!("{MEMORY_HEADER}{memory_text}"),
            ));
        }
        messages.extend(kept_history.iter().cloned());
        if !kept_retrieval.is_empty() {
            messages.push(ChatMessage::with_id(
                "retrieval",
                Role::System,
                Self::render_block(RETRIEVAL_HEADER, &kept_retrieval),
            ));
        }
        if !kept_tools.is_empty() {
            messages.push(ChatMessage::with_id(
                "tool_results",
                Role::System,
                Self::render_block(TOOL_RESULTS_HEADER, &kept_tools),
            ));
        }
        messages.push(ChatMessage::with_id(
            "user",
            Role::User,
            input.user_message.clone(),
        ));

        let component_tokens = ComponentTokens {
            system: prefix_tokens,
            memory: memory_tokens,
            history: history_tokens,
            retrieval: retrieval_tokens,
            tool_results: tool_tokens,
            user_message: self.estimator.count_text(&input.user_message, hint)
                + MESSAGE_OVERHEAD_TOKENS,
        };
        let included =
            Self::included_summary(input, &kept_history, &kept_retrieval, &kept_tools, &memory_text);

        // 9. Final verification — trimming is bounded by construction, but
        // the ceiling is re-checked against the assembled sequence.
        let total = self.estimator.count_messages(&messages, hint);
        if total > max_input {
            tracing::warn!(
                agent = %profile.name,
                total,
                max_input,
                "assembled request exceeds the usable budget after trimming"
            );
            let mut result = BuildResult::blocked(
                &profile.model,
                &profile.provider,
                window,
                reserved,
                format!(
                    "assembled request measures {total} tokens, exceeding the usable input budget of {max_input}"
                ),
            );
            result.trimming_applied = trimming;
            result.component_tokens = component_tokens;
            result.input_tokens_estimated = total;
            return result;
        }

        // 10. Headroom.
        let headroom = (window as usize).saturating_sub(total + reserved as usize);

        // 11. Status.
        let status = if trimming.is_empty() {
            BuildStatus::Ok
        } else {
            BuildStatus::Trimmed
        };

        BuildResult {
            status,
            error: None,
            messages,
            component_tokens,
            included,
            trimming_applied: trimming,
            input_tokens_estimated: total,
            headroom,
            model: profile.model.clone(),
            provider: profile.provider.clone(),
            context_window_tokens: window,
            reserved_output_tokens: reserved,
        }
    }

    // ── Stage 4: history ──────────────────────────────────────────────────

    fn trim_history(
        &self,
        history: &[ChatMessage],
        budget: usize,
        hint: &str,
        trimming: &mut Vec<TrimEntry>,
    ) -> (Vec<ChatMessage>, usize) {
        if history.is_empty() {
            return (Vec::new(), 0);
        }

        let turns = Self::group_turns(history);
        let before = self.turns_tokens(&turns, hint);
        if before <= budget {
            return (history.to_vec(), before);
        }

        // Drop the oldest whole turns, never splitting one.
        let mut first_kept = 0;
        let mut current = before;
        while first_kept < turns.len() && current > budget {
            first_kept += 1;
            current = self.turns_tokens(&turns[first_kept..], hint);
        }

        trimming.push(TrimEntry {
            action: TrimAction::DropHistoryBefore,
            before_tokens: before,
            after_tokens: current,
            dropped_turns: Some(first_kept),
            dropped_ids: Vec::new(),
        });

        let kept: Vec<ChatMessage> = turns[first_kept..].iter().flatten().cloned().collect();
        (kept, current)
    }

    /// Group history into turns: a user message starts a turn and carries
    /// every following non-user message; anything before the first user
    /// message forms its own oldest group.
    fn group_turns(history: &[ChatMessage]) -> Vec<Vec<ChatMessage>> {
        let mut turns: Vec<Vec<ChatMessage>> = Vec::new();
        for msg in history {
            if msg.role == Role::User || turns.is_empty() {
                turns.push(vec![msg.clone()]);
            } else if let Some(turn) = turns.last_mut() {
                turn.push(msg.clone());
            }
        }
        turns
    }

    fn turns_tokens(&self, turns: &[Vec<ChatMessage>], hint: &str) -> usize {
        let mut sum = 0;
        let mut any = false;
        for msg in turns.iter().flatten() {
            any = true;
            sum += self.estimator.count_message(msg, hint);
        }
        if any { MESSAGE_BASE_TOKENS + sum } else { 0 }
    }

    // ── Stage 5: retrieval ────────────────────────────────────────────────

    fn trim_retrieval(
        &self,
        items: &[ContentItem],
        budget: usize,
        hint: &str,
        trimming: &mut Vec<TrimEntry>,
    ) -> (Vec<ContentItem>, usize) {
        if items.is_empty() {
            return (Vec::new(), 0);
        }

        let header_tokens = self.estimator.count_text(RETRIEVAL_HEADER, hint);
        let mut kept = items.to_vec();
        let before = self.items_tokens(header_tokens, &kept, hint);
        if before <= budget {
            return (kept, before);
        }

        // Items are ordered by priority; drop from the end, but keep at
        // least one.
        let mut dropped_ids = Vec::new();
        while kept.len() > 1 && self.items_tokens(header_tokens, &kept, hint) > budget {
            if let Some(dropped) = kept.pop() {
                dropped_ids.push(dropped.id);
            }
        }

        if self.items_tokens(header_tokens, &kept, hint) > budget {
            // Single survivor still over budget: largest fitting prefix.
            let id = kept[0].id.clone();
            let item_budget = budget.saturating_sub(header_tokens);
            kept[0].content = Self::largest_fitting_prefix(&kept[0].content, |candidate| {
                self.estimator
                    .count_text(&format!("[{id}] {candidate}"), hint)
                    <= item_budget
            });
        }

        let after = self.items_tokens(header_tokens, &kept, hint);
        trimming.push(TrimEntry {
            action: TrimAction::ReduceRetrieval,
            before_tokens: before,
            after_tokens: after,
            dropped_turns: None,
            dropped_ids,
        });
        (kept, after)
    }

    // ── Stage 6: tool results ─────────────────────────────────────────────

    fn trim_tool_results(
        &self,
        items: &[ContentItem],
        budget: usize,
        hint: &str,
        trimming: &mut Vec<TrimEntry>,
    ) -> (Vec<ContentItem>, usize) {
        if items.is_empty() {
            return (Vec::new(), 0);
        }

        let header_tokens = self.estimator.count_text(TOOL_RESULTS_HEADER, hint);
        let mut kept = items.to_vec();
        let before = self.items_tokens(header_tokens, &kept, hint);
        if before <= budget {
            return (kept, before);
        }

        // Truncation-first: every item gets an equal share of the budget,
        // and only items above their share are reduced.
        let share = budget.saturating_sub(header_tokens) / kept.len();
        for item in kept.iter_mut() {
            if self.estimator.count_text(&Self::rendered_item(item), hint) <= share {
                continue;
            }
            item.content = Self::head_tail_excerpt(&item.content);
            if self.estimator.count_text(&Self::rendered_item(item), hint) > share {
                let id = item.id.clone();
                item.content = Self::largest_fitting_prefix(&item.content, |candidate| {
                    self.estimator
                        .count_text(&format!("[{id}] {candidate}"), hint)
                        <= share
                });
            }
        }

        let after = self.items_tokens(header_tokens, &kept, hint);
        trimming.push(TrimEntry {
            action: TrimAction::TruncateToolOutputs,
            before_tokens: before,
            after_tokens: after,
            dropped_turns: None,
            dropped_ids: Vec::new(),
        });
        (kept, after)
    }

    /// Keep the first and last lines of an over-long output, with an
    /// explicit marker where the middle was cut.
    fn head_tail_excerpt(text: &str) -> String {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() <= HEAD_LINES_KEPT + TAIL_LINES_KEPT {
            return text.to_string();
        }
        let mut out: Vec<&str> = Vec::with_capacity(HEAD_LINES_KEPT + TAIL_LINES_KEPT + 1);
        out.extend_from_slice(&lines[..HEAD_LINES_KEPT]);
        out.push(TRUNCATION_MARKER);
        out.extend_from_slice(&lines[lines.len() - TAIL_LINES_KEPT..]);
        out.join("\n")
    }

    // ── Stage 7: memory ───────────────────────────────────────────────────

    fn trim_memory(
        &self,
        memory: &str,
        budget: usize,
        hint: &str,
        trimming: &mut Vec<TrimEntry>,
    ) -> (String, usize) {
        if memory.is_empty() {
            return (String::new(), 0);
        }

        let header_tokens = self.estimator.count_text(MEMORY_HEADER, hint);
        let before = header_tokens + self.estimator.count_text(memory, hint);
        if before <= budget {
            return (memory.to_string(), before);
        }

        // First attempt: collapse all whitespace runs into single spaces.
        let mut text = memory.split_whitespace().collect::<Vec<_>>().join(" ");

        // Second attempt: head + tail sentence summary.
        if header_tokens + self.estimator.count_text(&text, hint) > budget {
            let sentences = Self::split_sentences(&text);
            if sentences.len() >= 3 {
                text = format!(
                    "{} {} {}",
                    sentences[0],
                    sentences[1],
                    sentences[sentences.len() - 1]
                );
            }
        }

        // Last resort: largest fitting prefix.
        if header_tokens + self.estimator.count_text(&text, hint) > budget {
            let text_budget = budget.saturating_sub(header_tokens);
            text = Self::largest_fitting_prefix(&text, |candidate| {
                self.estimator.count_text(candidate, hint) <= text_budget
            });
        }

        let after = header_tokens + self.estimator.count_text(&text, hint);
        trimming.push(TrimEntry {
            action: TrimAction::SummarizeMemory,
            before_tokens: before,
            after_tokens: after,
            dropped_turns: None,
            dropped_ids: Vec::new(),
        });
        (text, after)
    }

    /// Split on sentence terminators followed by whitespace or end of text.
    fn split_sentences(text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if matches!(c, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace())
            {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
        sentences
    }

    // ── Shared helpers ────────────────────────────────────────────────────

    fn rendered_item(item: &ContentItem) -> String {
        format!("[{}] {}", item.id, item.content)
    }

    fn render_block(header: &str, items: &[ContentItem]) -> String {
        let rendered: Vec<String> = items.iter().map(Self::rendered_item).collect();
        format!("{header}{}", rendered.join("\n"))
    }

    fn items_tokens(&self, header_tokens: usize, items: &[ContentItem], hint: &str) -> usize {
        header_tokens
            + items
                .iter()
                .map(|i| self.estimator.count_text(&Self::rendered_item(i), hint))
                .sum::<usize>()
    }

    /// Binary search for the largest character prefix accepted by `fits`,
    /// trimming trailing whitespace from the winner. At most
    /// [`MAX_TRUNCATE_PROBES`] probes; text longer than 2^18 characters is
    /// resolved to within probe granularity, always on the fitting side.
    fn largest_fitting_prefix(full: &str, fits: impl Fn(&str) -> bool) -> String {
        let chars: Vec<char> = full.chars().collect();
        let mut lo = 0usize;
        let mut hi = chars.len();
        for _ in 0..MAX_TRUNCATE_PROBES {
            if lo >= hi {
                break;
            }
            let mid = lo + (hi - lo).div_ceil(2);
            let candidate: String = chars[..mid].iter().collect();
            if fits(&candidate) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let kept: String = chars[..lo].iter().collect();
        kept.trim_end().to_string()
    }

    fn included_summary(
        input: &BuildInput,
        kept_history: &[ChatMessage],
        kept_retrieval: &[ContentItem],
        kept_tools: &[ContentItem],
        memory_text: &str,
    ) -> IncludedSummary {
        let mut included = IncludedSummary {
            history_message_ids: kept_history.iter().map(|m| m.id.clone()).collect(),
            retrieval_ids: kept_retrieval.iter().map(|i| i.id.clone()).collect(),
            tool_result_ids: kept_tools.iter().map(|i| i.id.clone()).collect(),
            previews: Default::default(),
        };

        let history_text = kept_history
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let retrieval_text = kept_retrieval
            .iter()
            .map(Self::rendered_item)
            .collect::<Vec<_>>()
            .join("\n");
        let tools_text = kept_tools
            .iter()
            .map(Self::rendered_item)
            .collect::<Vec<_>>()
            .join("\n");

        for (name, text) in [
            ("system", input.system_prompt.as_str()),
            ("developer", input.developer_prompt.as_str()),
            ("memory", memory_text),
            ("history", history_text.as_str()),
            ("retrieval", retrieval_text.as_str()),
            ("tool_results", tools_text.as_str()),
            ("user_message", input.user_message.as_str()),
        ] {
            if !text.is_empty() {
                included.previews.insert(name.to_string(), Self::preview(text));
            }
        }

        included
    }

    fn preview(text: &str) -> ComponentPreview {
        let chars: Vec<char> = text.chars().collect();
        let head: String = chars.iter().take(PREVIEW_CHARS).collect();
        let tail: String = if chars.len() > PREVIEW_CHARS {
            chars[chars.len() - PREVIEW_CHARS..].iter().collect()
        } else {
            String::new()
        };
        ComponentPreview { head, tail }
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
