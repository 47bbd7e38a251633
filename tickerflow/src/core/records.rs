//! Persisted records: runs, stage runs, symbol states, dead letters, checkpoints.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{DataFrequency, RunKind, RunStatus, StageId, SymbolStatus};
use crate::utils::{content_digest, generate_uuid, now_utc, Timestamp};

/// One invocation of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run identifier.
    pub run_id: String,
    /// What triggered the run.
    pub kind: RunKind,
    /// Current status.
    pub status: RunStatus,
    /// Symbols requested for the run.
    pub symbols: Vec<String>,
    /// Data frequency mode passed to stage functions.
    pub data_frequency: DataFrequency,
    /// Whether stage functions should refresh data that is already current.
    pub force: bool,
    /// When the run was created.
    pub created_at: Timestamp,
    /// When the run was last updated.
    pub updated_at: Timestamp,
    /// When the run reached a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Free-form metadata (aggregate counts, errors, upstream run).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowRun {
    /// Creates a new run in the `running` status.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        kind: RunKind,
        symbols: Vec<String>,
        data_frequency: DataFrequency,
        force: bool,
    ) -> Self {
        let now = now_utc();
        Self {
            run_id: run_id.into(),
            kind,
            status: RunStatus::Running,
            symbols,
            data_frequency,
            force,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One execution of one stage within a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    /// Parent run.
    pub run_id: String,
    /// The stage executed.
    pub stage: StageId,
    /// Current status.
    pub status: RunStatus,
    /// Symbols that completed the stage.
    pub succeeded: usize,
    /// Symbols that were dead-lettered in the stage.
    pub failed: usize,
    /// When the stage started.
    pub started_at: Timestamp,
    /// When the stage finished.
    pub completed_at: Option<Timestamp>,
}

impl StageRun {
    /// Creates a stage run in the `running` status.
    #[must_use]
    pub fn started(run_id: impl Into<String>, stage: StageId) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            status: RunStatus::Running,
            succeeded: 0,
            failed: 0,
            started_at: now_utc(),
            completed_at: None,
        }
    }
}

/// Idempotency record for one (run, symbol, stage) unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolStageState {
    /// Parent run.
    pub run_id: String,
    /// The symbol processed.
    pub symbol: String,
    /// The stage applied.
    pub stage: StageId,
    /// Current status.
    pub status: SymbolStatus,
    /// Number of retries performed so far.
    pub retry_count: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// When the unit started.
    pub started_at: Timestamp,
    /// When the unit was last updated.
    pub updated_at: Timestamp,
    /// When the unit reached a terminal status.
    pub completed_at: Option<Timestamp>,
}

impl SymbolStageState {
    /// Creates a unit in the `running` status.
    #[must_use]
    pub fn running(run_id: impl Into<String>, symbol: impl Into<String>, stage: StageId) -> Self {
        let now = now_utc();
        Self {
            run_id: run_id.into(),
            symbol: symbol.into(),
            stage,
            status: SymbolStatus::Running,
            retry_count: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves the unit to `retrying` with the given retry count and error.
    pub fn mark_retrying(&mut self, retry_count: u32, error: impl Into<String>) {
        self.status = SymbolStatus::Retrying;
        self.retry_count = retry_count;
        self.last_error = Some(error.into());
        self.updated_at = now_utc();
    }

    /// Moves the unit to `completed`.
    pub fn mark_completed(&mut self) {
        let now = now_utc();
        self.status = SymbolStatus::Completed;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Moves the unit to `failed` with the final error.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = now_utc();
        self.status = SymbolStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// A permanently failed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    /// Unique item identifier.
    pub id: String,
    /// Run the failure happened in.
    pub run_id: String,
    /// The failed symbol.
    pub symbol: String,
    /// The failed stage.
    pub stage: StageId,
    /// Final error detail.
    pub error: String,
    /// Context such as gate name, gate action, and retry count.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// When the item was recorded.
    pub created_at: Timestamp,
}

impl DeadLetterItem {
    /// Creates a new dead-letter item.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        symbol: impl Into<String>,
        stage: StageId,
        error: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: generate_uuid().to_string(),
            run_id: run_id.into(),
            symbol: symbol.into(),
            stage,
            error: error.into(),
            context,
            created_at: now_utc(),
        }
    }
}

/// Everything needed to re-invoke a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// The full original symbol list.
    pub symbols: Vec<String>,
    /// Data frequency mode of the run.
    pub data_frequency: DataFrequency,
    /// Force flag of the run.
    pub force: bool,
    /// Kind of the failed run.
    pub kind: RunKind,
    /// Check date the gates used.
    pub check_date: NaiveDate,
    /// Stages whose stage runs completed before the failure.
    pub completed_stages: Vec<StageId>,
    /// Stages still to execute, starting with the one that failed.
    pub remaining_stages: Vec<StageId>,
    /// The error that stopped the run.
    pub error: Option<String>,
}

/// A resumability snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run the snapshot belongs to.
    pub run_id: String,
    /// Last stage the run was working on.
    pub stage: StageId,
    /// Resume payload.
    pub state: CheckpointState,
    /// SHA-256 digest of the serialized state.
    pub digest: String,
    /// When the snapshot was written.
    pub created_at: Timestamp,
}

impl Checkpoint {
    /// Creates a checkpoint and computes its digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    pub fn new(
        run_id: impl Into<String>,
        stage: StageId,
        state: CheckpointState,
    ) -> Result<Self, serde_json::Error> {
        let digest = content_digest(&state)?;
        Ok(Self {
            run_id: run_id.into(),
            stage,
            state,
            digest,
            created_at: now_utc(),
        })
    }

    /// Returns true if the stored digest matches the state.
    #[must_use]
    pub fn verify(&self) -> bool {
        content_digest(&self.state).is_ok_and(|d| d == self.digest)
    }
}
