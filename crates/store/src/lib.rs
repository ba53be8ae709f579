//! Persistence for promptloom: budget profiles and run/audit records.
//!
//! Two traits, two backends each. `ProfileStore` is the only shared mutable
//! resource in the system — reads may race with an administrator update,
//! and callers are expected to tolerate a profile snapshot going stale
//! mid-request (profile changes only affect future builds). `RunStore` is
//! append-only and idempotent per run id.

pub mod in_memory;
pub mod records;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use promptloom_context::profile::{BudgetProfile, ProfileDefaults};
use promptloom_core::error::StoreError;

pub use in_memory::InMemoryStore;
pub use records::{ContextSnapshot, RunRecord};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Persisted per-agent budget profiles.
///
/// Profiles are created lazily with defaults on first access and are never
/// deleted while the agent exists; `update` is the only mutation path.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Resolve the profile for an agent, creating it from the supplied
    /// defaults on first access. Idempotent thereafter.
    async fn resolve(
        &self,
        agent: &str,
        defaults: &ProfileDefaults,
    ) -> std::result::Result<BudgetProfile, StoreError>;

    /// Fetch a profile without creating one.
    async fn get(&self, agent: &str) -> std::result::Result<Option<BudgetProfile>, StoreError>;

    /// Replace an agent's profile.
    async fn update(&self, profile: BudgetProfile) -> std::result::Result<(), StoreError>;
}

/// Append-only run records and context snapshots.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// The backend name.
    fn name(&self) -> &str;

    /// Append a run record. Appending the same run id twice is a no-op.
    async fn append_run(&self, record: RunRecord) -> std::result::Result<(), StoreError>;

    /// Append a context snapshot. Same idempotency rule, keyed by run id.
    async fn append_snapshot(
        &self,
        snapshot: ContextSnapshot,
    ) -> std::result::Result<(), StoreError>;

    /// Fetch a run record by id.
    async fn get_run(&self, id: &str) -> std::result::Result<Option<RunRecord>, StoreError>;

    /// List an agent's run records, most recent first.
    async fn list_runs(
        &self,
        agent: &str,
        limit: usize,
    ) -> std::result::Result<Vec<RunRecord>, StoreError>;

    /// Fetch the snapshot belonging to a run.
    async fn get_snapshot(
        &self,
        run_id: &str,
    ) -> std::result::Result<Option<ContextSnapshot>, StoreError>;
}
