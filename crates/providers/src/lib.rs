//! LLM client implementations for promptloom.
//!
//! Everything here is non-streaming by design: the dispatch layer sends an
//! assembled request and waits for the completed response.

pub mod anthropic;
pub mod openai_compat;
pub mod router;
pub mod tier;

pub use anthropic::AnthropicClient;
pub use openai_compat::OpenAiCompatClient;
pub use router::{ClientRouter, build_from_config};
pub use tier::{ModelPricing, RoutingTier, TierTable};
