//! `SQLite`-backed store.
//!
//! Uses a single `Mutex<Connection>`; every operation holds the lock for one
//! short statement sequence, which also makes read-check-write updates
//! atomic.

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use super::{check_transition, CheckpointStore, DeadLetterStore, WorkflowStore};
use crate::config::OrchestratorConfig;
use crate::core::{
    Checkpoint, CheckpointState, DeadLetterItem, RunStatus, StageId, StageRun, SymbolStageState,
    WorkflowRun,
};
use crate::errors::{StoreError, StoreResult};
use crate::utils::now_utc;

/// Idempotent DDL for the orchestrator tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    symbols TEXT NOT NULL,
    data_frequency TEXT NOT NULL,
    force INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS stage_runs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES workflow_runs(run_id),
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE (run_id, stage)
);

CREATE TABLE IF NOT EXISTS symbol_stage_states (
    run_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (run_id, symbol, stage)
);

CREATE TABLE IF NOT EXISTS dead_letter_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    run_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    stage TEXT NOT NULL,
    error TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letter_run ON dead_letter_items (run_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    state TEXT NOT NULL,
    digest TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, stage)
);
";

const RUN_COLUMNS: &str = "run_id, kind, status, symbols, data_frequency, force, \
                           created_at, updated_at, completed_at, metadata";
const STAGE_RUN_COLUMNS: &str =
    "run_id, stage, status, succeeded, failed, started_at, completed_at";
const SYMBOL_STATE_COLUMNS: &str = "run_id, symbol, stage, status, retry_count, last_error, \
                                    started_at, updated_at, completed_at";

/// `SQLite`-backed implementation of every store trait.
///
/// Create with [`SqliteStore::open`] for a file database or
/// [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens or creates a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory can't be created,
    /// or [`StoreError::Backend`] if the database can't be opened.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the schema can't be created.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        Self::with_connection(conn)
    }

    /// Opens the database named by `config.sqlite_path`, or an in-memory
    /// database when it is unset.
    ///
    /// # Errors
    ///
    /// Same as [`SqliteStore::open`].
    pub fn from_config(config: &OrchestratorConfig) -> StoreResult<Self> {
        match &config.sqlite_path {
            Some(path) => Self::open(path),
            None => Self::in_memory(),
        }
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Reads a text column and parses it with `FromStr`.
fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Reads a JSON text column.
fn json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn count(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        run_id: row.get(0)?,
        kind: parsed(row, 1)?,
        status: parsed(row, 2)?,
        symbols: json(row, 3)?,
        data_frequency: parsed(row, 4)?,
        force: row.get(5)?,
        created_at: parsed(row, 6)?,
        updated_at: parsed(row, 7)?,
        completed_at: parsed_opt(row, 8)?,
        metadata: json(row, 9)?,
    })
}

fn stage_run_from_row(row: &Row<'_>) -> rusqlite::Result<StageRun> {
    Ok(StageRun {
        run_id: row.get(0)?,
        stage: parsed(row, 1)?,
        status: parsed(row, 2)?,
        succeeded: count(row, 3)?,
        failed: count(row, 4)?,
        started_at: parsed(row, 5)?,
        completed_at: parsed_opt(row, 6)?,
    })
}

fn symbol_state_from_row(row: &Row<'_>) -> rusqlite::Result<SymbolStageState> {
    Ok(SymbolStageState {
        run_id: row.get(0)?,
        symbol: row.get(1)?,
        stage: parsed(row, 2)?,
        status: parsed(row, 3)?,
        retry_count: row.get(4)?,
        last_error: row.get(5)?,
        started_at: parsed(row, 6)?,
        updated_at: parsed(row, 7)?,
        completed_at: parsed_opt(row, 8)?,
    })
}

fn load_stage_run(conn: &Connection, run_id: &str, stage: StageId) -> StoreResult<Option<StageRun>> {
    conn.query_row(
        &format!("SELECT {STAGE_RUN_COLUMNS} FROM stage_runs WHERE run_id = ?1 AND stage = ?2"),
        params![run_id, stage.as_str()],
        stage_run_from_row,
    )
    .optional()
    .map_err(StoreError::backend)
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let conn = self.lock_conn();
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO workflow_runs ({RUN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    run.run_id,
                    run.kind.as_str(),
                    run.status.as_str(),
                    serde_json::to_string(&run.symbols)?,
                    run.data_frequency.as_str(),
                    run.force,
                    run.created_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&run.metadata)?,
                ],
            )
            .map_err(StoreError::backend)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(run.run_id.clone()));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = ?1"),
            params![run_id],
            run_from_row,
        )
        .optional()
        .map_err(StoreError::backend)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) -> StoreResult<WorkflowRun> {
        let conn = self.lock_conn();
        let mut run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))?;

        if run.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized(run_id.to_string()));
        }
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                key: run_id.to_string(),
                from: run.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = now_utc();
        run.status = status;
        run.updated_at = now;
        run.completed_at = Some(now);
        run.metadata.extend(metadata);

        conn.execute(
            "UPDATE workflow_runs SET status = ?2, updated_at = ?3, completed_at = ?4, metadata = ?5 \
             WHERE run_id = ?1",
            params![
                run_id,
                status.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
                serde_json::to_string(&run.metadata)?,
            ],
        )
        .map_err(StoreError::backend)?;
        Ok(run)
    }

    async fn start_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<StageRun> {
        let stage_run = StageRun::started(run_id, stage);
        let conn = self.lock_conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO stage_runs (run_id, stage, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id,
                    stage.as_str(),
                    stage_run.status.as_str(),
                    stage_run.started_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::backend)?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(format!("stage run {run_id}/{stage}")));
        }
        Ok(stage_run)
    }

    async fn complete_stage_run(
        &self,
        run_id: &str,
        stage: StageId,
        status: RunStatus,
        succeeded: usize,
        failed: usize,
    ) -> StoreResult<StageRun> {
        let conn = self.lock_conn();
        let updated = conn
            .execute(
                "UPDATE stage_runs SET status = ?3, succeeded = ?4, failed = ?5, completed_at = ?6 \
                 WHERE run_id = ?1 AND stage = ?2",
                params![
                    run_id,
                    stage.as_str(),
                    status.as_str(),
                    to_i64(succeeded),
                    to_i64(failed),
                    now_utc().to_rfc3339(),
                ],
            )
            .map_err(StoreError::backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("stage run {run_id}/{stage}")));
        }
        load_stage_run(&conn, run_id, stage)?
            .ok_or_else(|| StoreError::NotFound(format!("stage run {run_id}/{stage}")))
    }

    async fn get_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<Option<StageRun>> {
        let conn = self.lock_conn();
        load_stage_run(&conn, run_id, stage)
    }

    async fn list_stage_runs(&self, run_id: &str) -> StoreResult<Vec<StageRun>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STAGE_RUN_COLUMNS} FROM stage_runs WHERE run_id = ?1 ORDER BY seq"
            ))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![run_id], stage_run_from_row)
            .map_err(StoreError::backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)
    }

    async fn put_symbol_state(&self, state: &SymbolStageState) -> StoreResult<()> {
        let conn = self.lock_conn();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM symbol_stage_states \
                 WHERE run_id = ?1 AND symbol = ?2 AND stage = ?3",
                params![state.run_id, state.symbol, state.stage.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?;
        let current = current
            .map(|s| s.parse())
            .transpose()
            .map_err(StoreError::backend)?;
        check_transition(current, state)?;

        conn.execute(
            &format!(
                "INSERT INTO symbol_stage_states ({SYMBOL_STATE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (run_id, symbol, stage) DO UPDATE SET \
                 status = excluded.status, retry_count = excluded.retry_count, \
                 last_error = excluded.last_error, updated_at = excluded.updated_at, \
                 completed_at = excluded.completed_at"
            ),
            params![
                state.run_id,
                state.symbol,
                state.stage.as_str(),
                state.status.as_str(),
                state.retry_count,
                state.last_error,
                state.started_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                state.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_symbol_state(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
    ) -> StoreResult<Option<SymbolStageState>> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!(
                "SELECT {SYMBOL_STATE_COLUMNS} FROM symbol_stage_states \
                 WHERE run_id = ?1 AND symbol = ?2 AND stage = ?3"
            ),
            params![run_id, symbol, stage.as_str()],
            symbol_state_from_row,
        )
        .optional()
        .map_err(StoreError::backend)
    }

    async fn list_symbol_states(
        &self,
        run_id: &str,
        stage: StageId,
    ) -> StoreResult<Vec<SymbolStageState>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SYMBOL_STATE_COLUMNS} FROM symbol_stage_states \
                 WHERE run_id = ?1 AND stage = ?2 ORDER BY symbol"
            ))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![run_id, stage.as_str()], symbol_state_from_row)
            .map_err(StoreError::backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)
    }
}

#[async_trait]
impl DeadLetterStore for SqliteStore {
    async fn add_failed_item(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
        error: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> StoreResult<DeadLetterItem> {
        let item = DeadLetterItem::new(run_id, symbol, stage, error, context);
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO dead_letter_items (id, run_id, symbol, stage, error, context, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                item.run_id,
                item.symbol,
                item.stage.as_str(),
                item.error,
                serde_json::to_string(&item.context)?,
                item.created_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::backend)?;
        Ok(item)
    }

    async fn list_items(&self, run_id: Option<&str>) -> StoreResult<Vec<DeadLetterItem>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, symbol, stage, error, context, created_at \
                 FROM dead_letter_items WHERE (?1 IS NULL OR run_id = ?1) ORDER BY seq",
            )
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(DeadLetterItem {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    symbol: row.get(2)?,
                    stage: parsed(row, 3)?,
                    error: row.get(4)?,
                    context: json(row, 5)?,
                    created_at: parsed(row, 6)?,
                })
            })
            .map_err(StoreError::backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        stage: StageId,
        state: CheckpointState,
    ) -> StoreResult<Checkpoint> {
        let checkpoint = Checkpoint::new(run_id, stage, state)?;
        let payload = serde_json::to_string(&checkpoint.state)?;

        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        tx.execute(
            "DELETE FROM checkpoints WHERE run_id = ?1 AND stage = ?2",
            params![run_id, stage.as_str()],
        )
        .map_err(StoreError::backend)?;
        tx.execute(
            "INSERT INTO checkpoints (run_id, stage, state, digest, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                stage.as_str(),
                payload,
                checkpoint.digest,
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)?;
        Ok(checkpoint)
    }

    async fn load_checkpoint(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT run_id, stage, state, digest, created_at FROM checkpoints \
             WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![run_id],
            |row| {
                Ok(Checkpoint {
                    run_id: row.get(0)?,
                    stage: parsed(row, 1)?,
                    state: json(row, 2)?,
                    digest: row.get(3)?,
                    created_at: parsed(row, 4)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataFrequency, RunKind, SymbolStatus};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn run(run_id: &str) -> WorkflowRun {
        WorkflowRun::new(
            run_id,
            RunKind::OnDemand,
            vec!["AAPL".to_string(), "MSFT".to_string()],
            DataFrequency::Weekly,
            true,
        )
        .with_metadata("upstream_run_id", serde_json::json!("r0"))
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_finalize() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_run(&run("r1")).await.unwrap();
        assert!(matches!(
            store.create_run(&run("r1")).await,
            Err(StoreError::Duplicate(_))
        ));

        let loaded = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.kind, RunKind::OnDemand);
        assert_eq!(loaded.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(loaded.data_frequency, DataFrequency::Weekly);
        assert!(loaded.force);
        assert_eq!(loaded.metadata["upstream_run_id"], "r0");

        let mut metadata = HashMap::new();
        metadata.insert("symbols_failed".to_string(), serde_json::json!(1));
        store
            .finalize_run("r1", RunStatus::Failed, metadata)
            .await
            .unwrap();

        let loaded = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.metadata["symbols_failed"], 1);
        assert_eq!(loaded.metadata["upstream_run_id"], "r0");

        assert!(matches!(
            store.finalize_run("r1", RunStatus::Completed, HashMap::new()).await,
            Err(StoreError::AlreadyFinalized(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_runs_ordered() {
        let store = SqliteStore::in_memory().unwrap();
        store.start_stage_run("r1", StageId::Ingestion).await.unwrap();
        store.start_stage_run("r1", StageId::Indicators).await.unwrap();
        assert!(matches!(
            store.start_stage_run("r1", StageId::Ingestion).await,
            Err(StoreError::Duplicate(_))
        ));

        let done = store
            .complete_stage_run("r1", StageId::Indicators, RunStatus::Failed, 0, 2)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.failed, 2);

        let listed = store.list_stage_runs("r1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].stage, StageId::Ingestion);
        assert_eq!(listed[0].status, RunStatus::Running);

        assert!(matches!(
            store
                .complete_stage_run("r1", StageId::Signals, RunStatus::Completed, 0, 0)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_symbol_state_upsert_is_monotonic() {
        let store = SqliteStore::in_memory().unwrap();
        let mut state = SymbolStageState::running("r1", "GOOGL", StageId::Ingestion);
        store.put_symbol_state(&state).await.unwrap();
        state.mark_retrying(2, "connection reset");
        store.put_symbol_state(&state).await.unwrap();
        state.mark_completed();
        store.put_symbol_state(&state).await.unwrap();

        let stored = store
            .get_symbol_state("r1", "GOOGL", StageId::Ingestion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SymbolStatus::Completed);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("connection reset"));

        let resurrect = SymbolStageState::running("r1", "GOOGL", StageId::Ingestion);
        assert!(matches!(
            store.put_symbol_state(&resurrect).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store
            .put_symbol_state(&SymbolStageState::running("r1", "AAPL", StageId::Ingestion))
            .await
            .unwrap();
        let symbols: Vec<String> = store
            .list_symbol_states("r1", StageId::Ingestion)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.symbol)
            .collect();
        assert_eq!(symbols, vec!["AAPL", "GOOGL"]);
    }

    #[tokio::test]
    async fn test_dead_letters_and_checkpoints_persist_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("tickerflow.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut context = HashMap::new();
            context.insert("retry_count".to_string(), serde_json::json!(2));
            store
                .add_failed_item("r1", "BADSYM", StageId::Ingestion, "unknown ticker", context)
                .await
                .unwrap();

            store
                .save_checkpoint(
                    "r1",
                    StageId::Indicators,
                    CheckpointState {
                        symbols: vec!["AAPL".to_string(), "BADSYM".to_string()],
                        data_frequency: DataFrequency::Daily,
                        force: false,
                        kind: RunKind::Scheduled,
                        check_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
                        completed_stages: vec![StageId::Ingestion],
                        remaining_stages: vec![StageId::Indicators, StageId::Signals],
                        error: Some("store offline".to_string()),
                    },
                )
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let items = reopened.list_items(Some("r1")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].symbol, "BADSYM");
        assert_eq!(items[0].context["retry_count"], 2);
        assert!(reopened.list_items(Some("r2")).await.unwrap().is_empty());

        let checkpoint = reopened.load_checkpoint("r1").await.unwrap().unwrap();
        assert_eq!(checkpoint.stage, StageId::Indicators);
        assert_eq!(checkpoint.state.symbols, vec!["AAPL", "BADSYM"]);
        assert!(checkpoint.verify());
    }

    #[tokio::test]
    async fn test_from_config_uses_sqlite_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.sqlite_path = Some(dir.path().join("runs.db"));

        {
            let store = SqliteStore::from_config(&config).unwrap();
            store.create_run(&run("r1")).await.unwrap();
        }
        assert!(dir.path().join("runs.db").exists());

        let reopened = SqliteStore::from_config(&config).unwrap();
        assert!(reopened.get_run("r1").await.unwrap().is_some());

        let ephemeral = SqliteStore::from_config(&OrchestratorConfig::default()).unwrap();
        assert!(ephemeral.get_run("r1").await.unwrap().is_none());
    }
}
