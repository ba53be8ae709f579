//! # promptloom Core
//!
//! Domain types, traits, and error definitions for the promptloom
//! context-budgeting and request-assembly engine. This crate has no
//! framework dependencies — it defines the domain model that all other
//! crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator boundary is defined as a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod client;
pub mod error;
pub mod message;

// Re-export key types at crate root for ergonomics
pub use client::{ChatClient, ChatCompletion};
pub use error::{ClientError, Error, Result, StoreError};
pub use message::{ChatMessage, ContentItem, Role, TokenUsage};
