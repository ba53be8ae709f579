//! The dispatch wrapper around the request builder.
//!
//! `run()` is the only place in the system that performs I/O on the hot
//! path: one profile read, one LLM call, one audit append. Everything else
//! stays synchronous inside the builder. Persistence failures are logged
//! and never break a run that the provider answered.

use promptloom_context::builder::{BuildInput, BuildOverrides, RequestBuilder};
use promptloom_context::profile::ProfileDefaults;
use promptloom_context::result::{BuildResult, BuildStatus};
use promptloom_core::client::ChatClient;
use promptloom_core::error::StoreError;
use promptloom_providers::tier::TierTable;
use promptloom_store::records::{ContextSnapshot, RunRecord};
use promptloom_store::{ProfileStore, RunStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tier label used when no profile (and so no model) could be resolved.
const UNKNOWN_TIER: &str = "unknown";

/// Token usage as reported back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// The outcome of one `run()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Id of the persisted run record. Empty when the run failed before a
    /// record could be created.
    pub run_id: String,

    /// Build status, or `error` on transport/provider failure.
    pub status: BuildStatus,

    /// The model's response text on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Present iff status is `blocked` or `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub usage: UsageReport,

    /// Which model actually answered, when the provider reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,

    /// Billing-tier label for the requested model.
    pub routing_tier: String,
}

/// Orchestrates build → LLM call → audit persistence. All collaborators are
/// injected; there is no process-wide state.
pub struct Dispatcher {
    profiles: Arc<dyn ProfileStore>,
    runs: Arc<dyn RunStore>,
    client: Arc<dyn ChatClient>,
    builder: RequestBuilder,
    defaults: ProfileDefaults,
    tiers: TierTable,
    temperature: f32,
}

impl Dispatcher {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        runs: Arc<dyn RunStore>,
        client: Arc<dyn ChatClient>,
        defaults: ProfileDefaults,
    ) -> Self {
        Self {
            profiles,
            runs,
            client,
            builder: RequestBuilder::new(),
            defaults,
            tiers: TierTable::with_defaults(),
            temperature: 0.7,
        }
    }

    /// Wire a dispatcher from the application config: profile defaults and
    /// sampling temperature come from the config file / environment.
    pub fn from_config(
        profiles: Arc<dyn ProfileStore>,
        runs: Arc<dyn RunStore>,
        client: Arc<dyn ChatClient>,
        config: &promptloom_config::AppConfig,
    ) -> Self {
        Self::new(profiles, runs, client, defaults_from_config(config))
            .with_temperature(config.default_temperature)
    }

    /// Set the sampling temperature passed to the client.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Replace the routing-tier table.
    pub fn with_tiers(mut self, tiers: TierTable) -> Self {
        self.tiers = tiers;
        self
    }

    /// One profile read plus the pure build — no model call, nothing
    /// persisted. Administrative tooling passes `overrides` here to test
    /// alternate configurations.
    pub async fn build(
        &self,
        agent: &str,
        input: &BuildInput,
        overrides: Option<&BuildOverrides>,
    ) -> Result<BuildResult, StoreError> {
        let profile = self.profiles.resolve(agent, &self.defaults).await?;
        Ok(self.builder.build(&profile, input, overrides))
    }

    /// Build, call the model, persist the audit trail.
    ///
    /// Never returns an error: every failure mode lands in the result's
    /// `status`/`error`. Blocked builds return without contacting the model.
    pub async fn run(&self, agent: &str, input: &BuildInput) -> RunResult {
        let profile = match self.profiles.resolve(agent, &self.defaults).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(agent, error = %e, "profile resolution failed");
                return RunResult {
                    run_id: String::new(),
                    status: BuildStatus::Error,
                    response: None,
                    error: Some(format!("profile resolution failed: {e}")),
                    usage: UsageReport::default(),
                    model_used: None,
                    routing_tier: UNKNOWN_TIER.into(),
                };
            }
        };

        let build = self.builder.build(&profile, input, None);
        let routing_tier = self.tiers.tier_for(&build.model).to_string();

        let mut record = RunRecord::from_build(agent, &build);
        record.routing_tier = Some(routing_tier.clone());
        let run_id = record.id.clone();
        let snapshot = ContextSnapshot::new(&run_id, agent, profile.budgets, &build);

        if build.status == BuildStatus::Blocked {
            debug!(agent, run_id = %run_id, "build blocked, skipping model call");
            self.persist(record, snapshot).await;
            return RunResult {
                run_id,
                status: BuildStatus::Blocked,
                response: None,
                error: build.error,
                usage: UsageReport::default(),
                model_used: None,
                routing_tier,
            };
        }

        if !self.client.is_available() {
            let message = format!("client '{}' is not configured", self.client.name());
            record.status = BuildStatus::Error;
            record.error = Some(message.clone());
            self.persist(record, snapshot).await;
            return RunResult {
                run_id,
                status: BuildStatus::Error,
                response: None,
                error: Some(message),
                usage: UsageReport::default(),
                model_used: None,
                routing_tier,
            };
        }

        match self
            .client
            .send_chat(
                &build.messages,
                build.reserved_output_tokens,
                self.temperature,
            )
            .await
        {
            Ok(completion) => {
                if let Some(usage) = completion.usage {
                    record.measured_input_tokens = Some(usage.input_tokens);
                    record.measured_output_tokens = Some(usage.output_tokens);
                }
                self.persist(record, snapshot).await;
                debug!(agent, run_id = %run_id, status = %build.status, "run complete");
                RunResult {
                    run_id,
                    status: build.status,
                    response: Some(completion.response),
                    error: None,
                    usage: UsageReport {
                        input_tokens: completion.usage.map(|u| u.input_tokens),
                        output_tokens: completion.usage.map(|u| u.output_tokens),
                    },
                    model_used: Some(completion.model_used),
                    routing_tier,
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(agent, run_id = %run_id, error = %message, "model call failed");
                record.status = BuildStatus::Error;
                record.error = Some(message.clone());
                self.persist(record, snapshot).await;
                RunResult {
                    run_id,
                    status: BuildStatus::Error,
                    response: None,
                    error: Some(message),
                    usage: UsageReport::default(),
                    model_used: None,
                    routing_tier,
                }
            }
        }
    }

    async fn persist(&self, record: RunRecord, snapshot: ContextSnapshot) {
        if let Err(e) = self.runs.append_run(record).await {
            warn!(error = %e, "failed to persist run record");
        }
        if let Err(e) = self.runs.append_snapshot(snapshot).await {
            warn!(error = %e, "failed to persist context snapshot");
        }
    }
}

/// Derive profile defaults from the application config.
pub fn defaults_from_config(config: &promptloom_config::AppConfig) -> ProfileDefaults {
    ProfileDefaults {
        model: config.default_model.clone(),
        provider: config.default_provider.clone(),
        context_window_tokens: config.context_window_tokens,
        reserved_output_tokens: config.reserved_output_tokens,
    }
}
