//! In-memory backend — useful for testing and ephemeral sessions.

use crate::records::{ContextSnapshot, RunRecord};
use crate::{ProfileStore, RunStore};
use async_trait::async_trait;
use promptloom_context::profile::{BudgetProfile, ProfileDefaults};
use promptloom_core::error::StoreError;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An in-memory backend for both profiles and run records.
pub struct InMemoryStore {
    profiles: RwLock<HashMap<String, BudgetProfile>>,
    runs: RwLock<Vec<RunRecord>>,
    snapshots: RwLock<Vec<ContextSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
            snapshots: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn resolve(
        &self,
        agent: &str,
        defaults: &ProfileDefaults,
    ) -> Result<BudgetProfile, StoreError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(agent.to_string())
            .or_insert_with(|| BudgetProfile::new(agent, defaults));
        Ok(profile.clone())
    }

    async fn get(&self, agent: &str) -> Result<Option<BudgetProfile>, StoreError> {
        Ok(self.profiles.read().await.get(agent).cloned())
    }

    async fn update(&self, profile: BudgetProfile) -> Result<(), StoreError> {
        self.profiles
            .write()
            .await
            .insert(profile.name.clone(), profile);
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append_run(&self, record: RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.iter().any(|r| r.id == record.id) {
            return Ok(());
        }
        runs.push(record);
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.iter().any(|s| s.run_id == snapshot.run_id) {
            return Ok(());
        }
        snapshots.push(snapshot);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, agent: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| r.agent == agent)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_snapshot(&self, run_id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .find(|s| s.run_id == run_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use promptloom_context::result::{BuildStatus, ComponentTokens};
    use promptloom_context::{DEFAULT_BUDGETS, profile::ComponentBudgets};

    fn make_run(id: &str, agent: &str) -> RunRecord {
        RunRecord {
            id: id.into(),
            agent: agent.into(),
            model: "claude-sonnet-4-20250514".into(),
            provider: "anthropic".into(),
            status: BuildStatus::Ok,
            error: None,
            routing_tier: Some("standard".into()),
            estimated_input_tokens: 120,
            measured_input_tokens: Some(118),
            measured_output_tokens: Some(42),
            trimming_applied: vec![],
            component_tokens: ComponentTokens::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolve_creates_profile_once() {
        let store = InMemoryStore::new();
        let defaults = ProfileDefaults::default();

        assert!(store.get("maintenance").await.unwrap().is_none());

        let first = store.resolve("maintenance", &defaults).await.unwrap();
        assert_eq!(first.name, "maintenance");
        assert_eq!(first.budgets, DEFAULT_BUDGETS);

        // Second resolve returns the same profile, even with different
        // defaults in hand.
        let other_defaults = ProfileDefaults {
            context_window_tokens: 8192,
            ..ProfileDefaults::default()
        };
        let second = store.resolve("maintenance", &other_defaults).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn update_replaces_profile() {
        let store = InMemoryStore::new();
        let defaults = ProfileDefaults::default();
        let mut profile = store.resolve("billing", &defaults).await.unwrap();

        profile.budgets = ComponentBudgets {
            history: 1234,
            ..profile.budgets
        };
        store.update(profile.clone()).await.unwrap();

        let fetched = store.get("billing").await.unwrap().unwrap();
        assert_eq!(fetched.budgets.history, 1234);
    }

    #[tokio::test]
    async fn append_run_is_idempotent_per_id() {
        let store = InMemoryStore::new();
        store.append_run(make_run("run-1", "a")).await.unwrap();
        store.append_run(make_run("run-1", "a")).await.unwrap();

        let runs = store.list_runs("a", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn list_runs_filters_by_agent_most_recent_first() {
        let store = InMemoryStore::new();
        store.append_run(make_run("run-1", "a")).await.unwrap();
        store.append_run(make_run("run-2", "b")).await.unwrap();
        store.append_run(make_run("run-3", "a")).await.unwrap();

        let runs = store.list_runs("a", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "run-3");
        assert_eq!(runs[1].id, "run-1");
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = InMemoryStore::new();
        let snapshot = ContextSnapshot {
            run_id: "run-9".into(),
            agent: "maintenance".into(),
            budgets: DEFAULT_BUDGETS,
            context_window_tokens: 200_000,
            reserved_output_tokens: 4096,
            headroom: 150_000,
            created_at: Utc::now(),
        };
        store.append_snapshot(snapshot).await.unwrap();

        let fetched = store.get_snapshot("run-9").await.unwrap().unwrap();
        assert_eq!(fetched.agent, "maintenance");
        assert_eq!(fetched.headroom, 150_000);
        assert!(store.get_snapshot("run-0").await.unwrap().is_none());
    }
}
