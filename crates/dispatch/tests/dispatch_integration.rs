//! End-to-end integration tests for the dispatch wrapper.
//!
//! These exercise the full pipeline from candidate content to persisted
//! audit record, with a scripted stub standing in for the LLM client.

use std::sync::{Arc, Mutex};

use promptloom_context::builder::BuildInput;
use promptloom_context::profile::{ComponentBudgets, ProfileDefaults};
use promptloom_context::result::BuildStatus;
use promptloom_core::client::{ChatClient, ChatCompletion};
use promptloom_core::error::ClientError;
use promptloom_core::message::{ChatMessage, ContentItem, Role, TokenUsage};
use promptloom_dispatch::Dispatcher;
use promptloom_store::{InMemoryStore, ProfileStore, RunStore};

// ── Stub client ──────────────────────────────────────────────────────────

/// A stub client that returns scripted outcomes in sequence.
struct StubClient {
    outcomes: Mutex<Vec<Result<ChatCompletion, ClientError>>>,
    call_count: Mutex<usize>,
    available: bool,
}

impl StubClient {
    fn new(outcomes: Vec<Result<ChatCompletion, ClientError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            call_count: Mutex::new(0),
            available: true,
        }
    }

    fn text(response: &str) -> Self {
        Self::new(vec![Ok(ChatCompletion {
            response: response.into(),
            usage: Some(TokenUsage {
                input_tokens: 180,
                output_tokens: 24,
            }),
            model_used: "claude-sonnet-4-20250514".into(),
            provider: "stub".into(),
        })])
    }

    fn failing(error: ClientError) -> Self {
        Self::new(vec![Err(error)])
    }

    fn unavailable() -> Self {
        let mut stub = Self::new(vec![]);
        stub.available = false;
        stub
    }

    fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl ChatClient for StubClient {
    fn name(&self) -> &str {
        "stub"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn send_chat(
        &self,
        _messages: &[ChatMessage],
        _max_output_tokens: u32,
        _temperature: f32,
    ) -> Result<ChatCompletion, ClientError> {
        let mut count = self.call_count.lock().unwrap();
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            panic!("StubClient exhausted at call #{}", *count);
        }
        *count += 1;
        outcomes.remove(0)
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

fn small_defaults() -> ProfileDefaults {
    ProfileDefaults {
        context_window_tokens: 4096,
        reserved_output_tokens: 256,
        ..ProfileDefaults::default()
    }
}

fn tight_budgets() -> ComponentBudgets {
    ComponentBudgets {
        system: 2000,
        memory: 40,
        history: 40,
        retrieval: 40,
        tool_results: 40,
        safety_margin: 40,
    }
}

fn overloaded_input() -> BuildInput {
    BuildInput {
        system_prompt: "You are the household operations assistant.".into(),
        memory: "m".repeat(600),
        history: vec![
            ChatMessage::with_id("u0", Role::User, "q".repeat(400)),
            ChatMessage::with_id("a0", Role::Assistant, "r".repeat(400)),
        ],
        retrieval: vec![
            ContentItem::new("doc1", "d".repeat(300)),
            ContentItem::new("doc2", "e".repeat(300)),
        ],
        tool_results: vec![ContentItem::new("tool1", "t".repeat(300))],
        user_message: "What's due this week?".into(),
        ..Default::default()
    }
}

fn small_input() -> BuildInput {
    BuildInput {
        system_prompt: "You are the household operations assistant.".into(),
        user_message: "Any bills due?".into(),
        ..Default::default()
    }
}

async fn stores_with_tight_profile(
    agent: &str,
    defaults: &ProfileDefaults,
) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let mut profile = store.resolve(agent, defaults).await.unwrap();
    profile.budgets = tight_budgets();
    store.update(profile).await.unwrap();
    store
}

fn dispatcher_over(
    store: &Arc<InMemoryStore>,
    client: &Arc<StubClient>,
    defaults: ProfileDefaults,
) -> Dispatcher {
    let profiles: Arc<dyn ProfileStore> = store.clone();
    let runs: Arc<dyn RunStore> = store.clone();
    let chat: Arc<dyn ChatClient> = client.clone();
    Dispatcher::new(profiles, runs, chat, defaults)
}

// ── E2E: successful run persists a matching audit record ─────────────────

#[tokio::test]
async fn successful_run_persists_record_matching_build() {
    let defaults = small_defaults();
    let store = stores_with_tight_profile("maintenance", &defaults).await;
    let client = Arc::new(StubClient::text("Handled."));
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let input = overloaded_input();

    // Reference build with the same profile; run() must persist exactly
    // this trimming output.
    let build = dispatcher.build("maintenance", &input, None).await.unwrap();
    assert_eq!(build.status, BuildStatus::Trimmed);
    assert!(!build.trimming_applied.is_empty());

    let result = dispatcher.run("maintenance", &input).await;
    assert_eq!(result.status, BuildStatus::Trimmed);
    assert_eq!(result.response.as_deref(), Some("Handled."));
    assert_eq!(result.usage.input_tokens, Some(180));
    assert_eq!(result.usage.output_tokens, Some(24));
    assert_eq!(result.routing_tier, "standard");
    assert_eq!(client.calls(), 1);

    let record = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, BuildStatus::Trimmed);
    assert_eq!(record.trimming_applied, build.trimming_applied);
    assert_eq!(record.component_tokens, build.component_tokens);
    assert_eq!(record.estimated_input_tokens, build.input_tokens_estimated);
    assert_eq!(record.measured_input_tokens, Some(180));
    assert_eq!(record.measured_output_tokens, Some(24));
    assert_eq!(record.routing_tier.as_deref(), Some("standard"));

    let snapshot = store.get_snapshot(&result.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.agent, "maintenance");
    assert_eq!(snapshot.context_window_tokens, 4096);
    assert_eq!(snapshot.budgets, tight_budgets());
    assert_eq!(snapshot.headroom, build.headroom);
}

#[tokio::test]
async fn clean_run_reports_ok_with_empty_audit_trail() {
    let defaults = small_defaults();
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(StubClient::text("The water bill, on the 12th."));
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let result = dispatcher.run("billing", &small_input()).await;
    assert_eq!(result.status, BuildStatus::Ok);
    assert!(result.error.is_none());

    let record = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, BuildStatus::Ok);
    assert!(record.trimming_applied.is_empty());

    let snapshot = store.get_snapshot(&result.run_id).await.unwrap().unwrap();
    assert!(snapshot.headroom > 0);
}

// ── E2E: blocked builds never reach the model ────────────────────────────

#[tokio::test]
async fn blocked_build_skips_model_and_persists_blocked_record() {
    // Reserved output equal to the window blocks every build.
    let defaults = ProfileDefaults {
        context_window_tokens: 4096,
        reserved_output_tokens: 4096,
        ..ProfileDefaults::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(StubClient::text("never sent"));
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let result = dispatcher.run("maintenance", &small_input()).await;
    assert_eq!(result.status, BuildStatus::Blocked);
    assert!(result.response.is_none());
    assert!(result.error.as_deref().unwrap().contains("reserved"));
    assert_eq!(client.calls(), 0);

    let record = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, BuildStatus::Blocked);
    assert!(record.error.is_some());
    assert!(record.measured_input_tokens.is_none());
}

// ── E2E: provider failures surface in-band ───────────────────────────────

#[tokio::test]
async fn provider_failure_becomes_error_status() {
    let defaults = small_defaults();
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(StubClient::failing(ClientError::Timeout(
        "deadline exceeded".into(),
    )));
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let result = dispatcher.run("maintenance", &small_input()).await;
    assert_eq!(result.status, BuildStatus::Error);
    assert!(result.response.is_none());
    assert!(result.error.as_deref().unwrap().contains("deadline exceeded"));

    let record = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, BuildStatus::Error);
    assert!(record.error.as_deref().unwrap().contains("deadline exceeded"));
}

#[tokio::test]
async fn unavailable_client_is_an_error_without_a_call() {
    let defaults = small_defaults();
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(StubClient::unavailable());
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let result = dispatcher.run("maintenance", &small_input()).await;
    assert_eq!(result.status, BuildStatus::Error);
    assert!(result.error.as_deref().unwrap().contains("not configured"));
    assert_eq!(client.calls(), 0);

    let record = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, BuildStatus::Error);
}

// ── E2E: repeated runs are independently audited ─────────────────────────

#[tokio::test]
async fn each_run_gets_its_own_record() {
    let defaults = small_defaults();
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(StubClient::new(vec![
        Ok(ChatCompletion {
            response: "first".into(),
            usage: None,
            model_used: "claude-sonnet-4-20250514".into(),
            provider: "stub".into(),
        }),
        Ok(ChatCompletion {
            response: "second".into(),
            usage: None,
            model_used: "claude-sonnet-4-20250514".into(),
            provider: "stub".into(),
        }),
    ]));
    let dispatcher = dispatcher_over(&store, &client, defaults);

    let first = dispatcher.run("maintenance", &small_input()).await;
    let second = dispatcher.run("maintenance", &small_input()).await;
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.usage, promptloom_dispatch::UsageReport::default());

    let runs = store.list_runs("maintenance", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}
