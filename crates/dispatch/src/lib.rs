//! # promptloom Dispatch
//!
//! The thin async wrapper around the synchronous request builder: resolve
//! the agent's budget profile, build, call the LLM client, and persist one
//! run record plus one context snapshot per call. Transport failures are
//! surfaced in-band; nothing raises past this boundary.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, RunResult, UsageReport, defaults_from_config};
