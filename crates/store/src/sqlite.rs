//! SQLite backend for profiles and run records.
//!
//! One database file, three tables:
//! - `profiles` — per-agent budget profiles (upsert on update)
//! - `runs` — append-only run records, primary-keyed by run id
//! - `snapshots` — append-only context snapshots, one per run
//!
//! Budget maps and trimming audit trails are stored as JSON columns; the
//! queryable dimensions (agent, status, created_at) get their own columns.

use crate::records::{ContextSnapshot, RunRecord};
use crate::{ProfileStore, RunStore};
use async_trait::async_trait;
use promptloom_context::profile::{BudgetProfile, ComponentBudgets, ProfileDefaults};
use promptloom_context::result::BuildStatus;
use promptloom_core::error::StoreError;
use promptloom_core::message::parse_rfc3339;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A production SQLite store for profiles, run records, and snapshots.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from a file path.
    ///
    /// The database and all tables are created automatically. Pass
    /// `"sqlite::memory:"` for an in-process ephemeral database (tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                agent            TEXT PRIMARY KEY,
                model            TEXT NOT NULL,
                provider         TEXT NOT NULL,
                context_window   INTEGER NOT NULL,
                reserved_output  INTEGER NOT NULL,
                budgets          TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("profiles table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id                     TEXT PRIMARY KEY,
                agent                  TEXT NOT NULL,
                model                  TEXT NOT NULL,
                provider               TEXT NOT NULL,
                status                 TEXT NOT NULL,
                error                  TEXT,
                routing_tier           TEXT,
                estimated_input        INTEGER NOT NULL,
                measured_input         INTEGER,
                measured_output        INTEGER,
                trimming_applied       TEXT NOT NULL,
                component_tokens       TEXT NOT NULL,
                created_at             TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("runs table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                run_id           TEXT PRIMARY KEY,
                agent            TEXT NOT NULL,
                budgets          TEXT NOT NULL,
                context_window   INTEGER NOT NULL,
                reserved_output  INTEGER NOT NULL,
                headroom         INTEGER NOT NULL,
                created_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("snapshots table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_agent ON runs(agent, created_at DESC)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("runs index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<BudgetProfile, StoreError> {
        let agent: String = row
            .try_get("agent")
            .map_err(|e| StoreError::QueryFailed(format!("agent column: {e}")))?;
        let model: String = row
            .try_get("model")
            .map_err(|e| StoreError::QueryFailed(format!("model column: {e}")))?;
        let provider: String = row
            .try_get("provider")
            .map_err(|e| StoreError::QueryFailed(format!("provider column: {e}")))?;
        let context_window: i64 = row
            .try_get("context_window")
            .map_err(|e| StoreError::QueryFailed(format!("context_window column: {e}")))?;
        let reserved_output: i64 = row
            .try_get("reserved_output")
            .map_err(|e| StoreError::QueryFailed(format!("reserved_output column: {e}")))?;
        let budgets_json: String = row
            .try_get("budgets")
            .map_err(|e| StoreError::QueryFailed(format!("budgets column: {e}")))?;

        // Stored budget maps go back through normalization: this is where
        // a lingering legacy default set gets upgraded on read.
        let raw = serde_json::from_str(&budgets_json)
            .map_err(|e| StoreError::QueryFailed(format!("budgets JSON: {e}")))?;
        let budgets = promptloom_context::normalize_budgets(&raw);

        Ok(BudgetProfile {
            name: agent,
            model,
            provider,
            context_window_tokens: context_window as u32,
            reserved_output_tokens: reserved_output as u32,
            budgets,
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord, StoreError> {
        let status_str: String = row
            .try_get("status")
            .map_err(|e| StoreError::QueryFailed(format!("status column: {e}")))?;
        let status = BuildStatus::parse(&status_str)
            .ok_or_else(|| StoreError::QueryFailed(format!("unknown status '{status_str}'")))?;

        let trimming_json: String = row
            .try_get("trimming_applied")
            .map_err(|e| StoreError::QueryFailed(format!("trimming_applied column: {e}")))?;
        let component_json: String = row
            .try_get("component_tokens")
            .map_err(|e| StoreError::QueryFailed(format!("component_tokens column: {e}")))?;
        let created_at_str: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::QueryFailed(format!("created_at column: {e}")))?;

        Ok(RunRecord {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?,
            agent: row
                .try_get("agent")
                .map_err(|e| StoreError::QueryFailed(format!("agent column: {e}")))?,
            model: row
                .try_get("model")
                .map_err(|e| StoreError::QueryFailed(format!("model column: {e}")))?,
            provider: row
                .try_get("provider")
                .map_err(|e| StoreError::QueryFailed(format!("provider column: {e}")))?,
            status,
            error: row.try_get("error").ok().flatten(),
            routing_tier: row.try_get("routing_tier").ok().flatten(),
            estimated_input_tokens: row
                .try_get::<i64, _>("estimated_input")
                .map_err(|e| StoreError::QueryFailed(format!("estimated_input column: {e}")))?
                as usize,
            measured_input_tokens: row
                .try_get::<Option<i64>, _>("measured_input")
                .ok()
                .flatten()
                .map(|v| v as u32),
            measured_output_tokens: row
                .try_get::<Option<i64>, _>("measured_output")
                .ok()
                .flatten()
                .map(|v| v as u32),
            trimming_applied: serde_json::from_str(&trimming_json)
                .map_err(|e| StoreError::QueryFailed(format!("trimming JSON: {e}")))?,
            component_tokens: serde_json::from_str(&component_json)
                .map_err(|e| StoreError::QueryFailed(format!("component JSON: {e}")))?,
            created_at: parse_rfc3339(&created_at_str),
        })
    }

    fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<ContextSnapshot, StoreError> {
        let budgets_json: String = row
            .try_get("budgets")
            .map_err(|e| StoreError::QueryFailed(format!("budgets column: {e}")))?;
        let budgets: ComponentBudgets = serde_json::from_str(&budgets_json)
            .map_err(|e| StoreError::QueryFailed(format!("budgets JSON: {e}")))?;
        let created_at_str: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::QueryFailed(format!("created_at column: {e}")))?;

        Ok(ContextSnapshot {
            run_id: row
                .try_get("run_id")
                .map_err(|e| StoreError::QueryFailed(format!("run_id column: {e}")))?,
            agent: row
                .try_get("agent")
                .map_err(|e| StoreError::QueryFailed(format!("agent column: {e}")))?,
            budgets,
            context_window_tokens: row
                .try_get::<i64, _>("context_window")
                .map_err(|e| StoreError::QueryFailed(format!("context_window column: {e}")))?
                as u32,
            reserved_output_tokens: row
                .try_get::<i64, _>("reserved_output")
                .map_err(|e| StoreError::QueryFailed(format!("reserved_output column: {e}")))?
                as u32,
            headroom: row
                .try_get::<i64, _>("headroom")
                .map_err(|e| StoreError::QueryFailed(format!("headroom column: {e}")))?
                as usize,
            created_at: parse_rfc3339(&created_at_str),
        })
    }

    async fn insert_profile(&self, profile: &BudgetProfile) -> Result<(), StoreError> {
        let budgets_json = serde_json::to_string(&profile.budgets)
            .map_err(|e| StoreError::Storage(format!("budgets serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO profiles (agent, model, provider, context_window, reserved_output, budgets, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(agent) DO UPDATE SET
                model = excluded.model,
                provider = excluded.provider,
                context_window = excluded.context_window,
                reserved_output = excluded.reserved_output,
                budgets = excluded.budgets,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.name)
        .bind(&profile.model)
        .bind(&profile.provider)
        .bind(i64::from(profile.context_window_tokens))
        .bind(i64::from(profile.reserved_output_tokens))
        .bind(&budgets_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("profile upsert failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn resolve(
        &self,
        agent: &str,
        defaults: &ProfileDefaults,
    ) -> Result<BudgetProfile, StoreError> {
        if let Some(existing) = self.get(agent).await? {
            return Ok(existing);
        }

        // First sighting: create with defaults. INSERT OR IGNORE tolerates
        // a concurrent creator; the re-read returns whichever row won.
        let fresh = BudgetProfile::new(agent, defaults);
        let budgets_json = serde_json::to_string(&fresh.budgets)
            .map_err(|e| StoreError::Storage(format!("budgets serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO profiles
                (agent, model, provider, context_window, reserved_output, budgets, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&fresh.name)
        .bind(&fresh.model)
        .bind(&fresh.provider)
        .bind(i64::from(fresh.context_window_tokens))
        .bind(i64::from(fresh.reserved_output_tokens))
        .bind(&budgets_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("profile insert failed: {e}")))?;

        debug!(agent, "created budget profile with defaults");

        self.get(agent)
            .await?
            .ok_or_else(|| StoreError::Storage(format!("profile for '{agent}' vanished")))
    }

    async fn get(&self, agent: &str) -> Result<Option<BudgetProfile>, StoreError> {
        let row = sqlx::query("SELECT * FROM profiles WHERE agent = ?1")
            .bind(agent)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("profile lookup: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_profile(r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, profile: BudgetProfile) -> Result<(), StoreError> {
        self.insert_profile(&profile).await
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append_run(&self, record: RunRecord) -> Result<(), StoreError> {
        let trimming_json = serde_json::to_string(&record.trimming_applied)
            .map_err(|e| StoreError::Storage(format!("trimming serialization: {e}")))?;
        let component_json = serde_json::to_string(&record.component_tokens)
            .map_err(|e| StoreError::Storage(format!("component serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO runs
                (id, agent, model, provider, status, error, routing_tier,
                 estimated_input, measured_input, measured_output,
                 trimming_applied, component_tokens, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&record.id)
        .bind(&record.agent)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.status.to_string())
        .bind(&record.error)
        .bind(&record.routing_tier)
        .bind(record.estimated_input_tokens as i64)
        .bind(record.measured_input_tokens.map(i64::from))
        .bind(record.measured_output_tokens.map(i64::from))
        .bind(&trimming_json)
        .bind(&component_json)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("run insert failed: {e}")))?;

        debug!(run_id = %record.id, status = %record.status, "appended run record");
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        let budgets_json = serde_json::to_string(&snapshot.budgets)
            .map_err(|e| StoreError::Storage(format!("budgets serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO snapshots
                (run_id, agent, budgets, context_window, reserved_output, headroom, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&snapshot.run_id)
        .bind(&snapshot.agent)
        .bind(&budgets_json)
        .bind(i64::from(snapshot.context_window_tokens))
        .bind(i64::from(snapshot.reserved_output_tokens))
        .bind(snapshot.headroom as i64)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("snapshot insert failed: {e}")))?;

        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("run lookup: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_run(r)?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, agent: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE agent = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(agent)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("run listing: {e}")))?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn get_snapshot(&self, run_id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("snapshot lookup: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_snapshot(r)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use promptloom_context::DEFAULT_BUDGETS;
    use promptloom_context::result::{ComponentTokens, TrimAction, TrimEntry};

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn make_run(id: &str, agent: &str) -> RunRecord {
        RunRecord {
            id: id.into(),
            agent: agent.into(),
            model: "claude-sonnet-4-20250514".into(),
            provider: "anthropic".into(),
            status: BuildStatus::Trimmed,
            error: None,
            routing_tier: Some("standard".into()),
            estimated_input_tokens: 300,
            measured_input_tokens: Some(290),
            measured_output_tokens: Some(60),
            trimming_applied: vec![TrimEntry {
                action: TrimAction::SummarizeMemory,
                before_tokens: 120,
                after_tokens: 40,
                dropped_turns: None,
                dropped_ids: vec![],
            }],
            component_tokens: ComponentTokens {
                system: 20,
                memory: 40,
                history: 0,
                retrieval: 0,
                tool_results: 0,
                user_message: 10,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolve_creates_and_persists_profile() {
        let store = test_store().await;
        let defaults = ProfileDefaults::default();

        let profile = store.resolve("maintenance", &defaults).await.unwrap();
        assert_eq!(profile.name, "maintenance");
        assert_eq!(profile.budgets, DEFAULT_BUDGETS);

        let fetched = store.get("maintenance").await.unwrap().unwrap();
        assert_eq!(fetched, profile);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let store = test_store().await;
        let defaults = ProfileDefaults::default();

        let first = store.resolve("billing", &defaults).await.unwrap();
        let second = store.resolve("billing", &defaults).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn update_round_trips_budgets() {
        let store = test_store().await;
        let mut profile = store
            .resolve("contractors", &ProfileDefaults::default())
            .await
            .unwrap();
        profile.budgets.retrieval = 4800;
        store.update(profile).await.unwrap();

        let fetched = store.get("contractors").await.unwrap().unwrap();
        assert_eq!(fetched.budgets.retrieval, 4800);
    }

    #[tokio::test]
    async fn stored_legacy_budgets_upgraded_on_read() {
        let store = test_store().await;
        let mut profile = store
            .resolve("legacy-agent", &ProfileDefaults::default())
            .await
            .unwrap();
        profile.budgets = promptloom_context::LEGACY_DEFAULT_BUDGETS;
        store.update(profile).await.unwrap();

        // Normalization on read discards the stale default set.
        let fetched = store.get("legacy-agent").await.unwrap().unwrap();
        assert_eq!(fetched.budgets, DEFAULT_BUDGETS);
    }

    #[tokio::test]
    async fn run_record_round_trip() {
        let store = test_store().await;
        store.append_run(make_run("run-1", "maintenance")).await.unwrap();

        let fetched = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, BuildStatus::Trimmed);
        assert_eq!(fetched.measured_output_tokens, Some(60));
        assert_eq!(fetched.trimming_applied.len(), 1);
        assert_eq!(
            fetched.trimming_applied[0].action,
            TrimAction::SummarizeMemory
        );
        assert_eq!(fetched.component_tokens.memory, 40);
    }

    #[tokio::test]
    async fn append_run_idempotent_per_id() {
        let store = test_store().await;
        store.append_run(make_run("run-1", "a")).await.unwrap();

        let mut replay = make_run("run-1", "a");
        replay.estimated_input_tokens = 999;
        store.append_run(replay).await.unwrap();

        // The original write wins; records are write-once.
        let fetched = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(fetched.estimated_input_tokens, 300);
        assert_eq!(store.list_runs("a", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_runs_respects_limit_and_agent() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .append_run(make_run(&format!("run-{i}"), "a"))
                .await
                .unwrap();
        }
        store.append_run(make_run("other", "b")).await.unwrap();

        let runs = store.list_runs("a", 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.agent == "a"));
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = test_store().await;
        let snapshot = ContextSnapshot {
            run_id: "run-7".into(),
            agent: "maintenance".into(),
            budgets: DEFAULT_BUDGETS,
            context_window_tokens: 200_000,
            reserved_output_tokens: 4096,
            headroom: 180_000,
            created_at: Utc::now(),
        };
        store.append_snapshot(snapshot).await.unwrap();

        let fetched = store.get_snapshot("run-7").await.unwrap().unwrap();
        assert_eq!(fetched.budgets, DEFAULT_BUDGETS);
        assert_eq!(fetched.headroom, 180_000);
    }
}
