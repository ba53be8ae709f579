//! Token estimation.
//!
//! Two interchangeable strategies: an exact encoder (tiktoken, behind the
//! `tiktoken` feature, cached per model hint) and a deterministic
//! character-ratio fallback that is always available. The fallback treats
//! ``` fenced code blocks as denser than prose: roughly 3 characters per
//! token inside a fence, 4 outside, both rounded up per segment.
//!
//! Estimation is pure: identical input always yields the identical count,
//! with no randomness and no dependence on wall-clock time or external
//! services. Empty text is 0 tokens.

use promptloom_core::message::ChatMessage;

#[cfg(feature = "tiktoken")]
use std::{collections::HashMap, sync::Arc, sync::RwLock};

/// Characters per token for prose in the fallback estimator.
const PROSE_CHARS_PER_TOKEN: usize = 4;

/// Characters per token inside fenced code blocks.
const CODE_CHARS_PER_TOKEN: usize = 3;

/// Per-message framing overhead (role name, delimiters, wire formatting).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Fixed base overhead for a non-empty message list.
pub const MESSAGE_BASE_TOKENS: usize = 3;

/// Token estimator with optional exact encoders cached per model hint.
pub struct TokenEstimator {
    #[cfg(feature = "tiktoken")]
    encoders: RwLock<HashMap<String, Option<Arc<tiktoken_rs::CoreBPE>>>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "tiktoken")]
            encoders: RwLock::new(HashMap::new()),
        }
    }

    /// Count tokens in a text, preferring an exact encoder for the given
    /// model hint when one is available.
    pub fn count_text(&self, text: &str, model_hint: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.exact_count(text, model_hint) {
            Some(count) => count,
            None => heuristic_count(text),
        }
    }

    /// Count tokens for a single message including its framing overhead.
    pub fn count_message(&self, message: &ChatMessage, model_hint: &str) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.count_text(&message.content, model_hint)
    }

    /// Count tokens for a message list: base overhead plus per-message
    /// framing plus each message's content. Empty input yields zero.
    pub fn count_messages(&self, messages: &[ChatMessage], model_hint: &str) -> usize {
        if messages.is_empty() {
            return 0;
        }
        MESSAGE_BASE_TOKENS
            + messages
                .iter()
                .map(|m| self.count_message(m, model_hint))
                .sum::<usize>()
    }

    #[cfg(feature = "tiktoken")]
    fn exact_count(&self, text: &str, model_hint: &str) -> Option<usize> {
        if let Ok(guard) = self.encoders.read() {
            if let Some(cached) = guard.get(model_hint) {
                return cached
                    .as_ref()
                    .map(|bpe| bpe.encode_with_special_tokens(text).len());
            }
        }

        // First sighting of this model hint: resolve once, cache the
        // outcome either way so failed lookups are not retried.
        let resolved = tiktoken_rs::get_bpe_from_model(model_hint)
            .ok()
            .map(Arc::new);
        let count = resolved
            .as_ref()
            .map(|bpe| bpe.encode_with_special_tokens(text).len());
        if let Ok(mut guard) = self.encoders.write() {
            guard.entry(model_hint.to_string()).or_insert(resolved);
        }
        count
    }

    #[cfg(not(feature = "tiktoken"))]
    fn exact_count(&self, _text: &str, _model_hint: &str) -> Option<usize> {
        None
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Character-ratio fallback: split on ``` fences, count odd segments as
/// code and even segments as prose, rounding each segment up.
fn heuristic_count(text: &str) -> usize {
    let mut total = 0;
    for (i, segment) in text.split("```").enumerate() {
        if segment.is_empty() {
            continue;
        }
        let ratio = if i % 2 == 1 {
            CODE_CHARS_PER_TOKEN
        } else {
            PROSE_CHARS_PER_TOKEN
        };
        total += segment.chars().count().div_ceil(ratio);
    }
    total
}
