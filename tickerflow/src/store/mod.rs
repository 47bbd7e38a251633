//! Persistence for runs, stage runs, symbol states, dead letters, and
//! checkpoints.
//!
//! Three object-safe traits split the concerns the orchestrator depends on.
//! [`InMemoryStore`] implements all of them for tests and embedding; the
//! `sqlite` feature adds a durable [`SqliteStore`].

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::core::{
    Checkpoint, CheckpointState, DeadLetterItem, RunStatus, StageId, StageRun, SymbolStageState,
    SymbolStatus, WorkflowRun,
};
use crate::errors::{StoreError, StoreResult};

/// Run, stage-run, and symbol-state persistence.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persists a new run. Fails with `Duplicate` if the id exists.
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    /// Loads a run.
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>>;

    /// Sets the terminal status of a run and merges `metadata` into it.
    ///
    /// Fails with `AlreadyFinalized` if the run is already terminal.
    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) -> StoreResult<WorkflowRun>;

    /// Records the start of a stage within a run.
    async fn start_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<StageRun>;

    /// Records the final status and counts of a stage run.
    async fn complete_stage_run(
        &self,
        run_id: &str,
        stage: StageId,
        status: RunStatus,
        succeeded: usize,
        failed: usize,
    ) -> StoreResult<StageRun>;

    /// Loads one stage run.
    async fn get_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<Option<StageRun>>;

    /// Lists a run's stage runs in start order.
    async fn list_stage_runs(&self, run_id: &str) -> StoreResult<Vec<StageRun>>;

    /// Inserts or updates the state of a (run, symbol, stage) unit.
    ///
    /// Fails with `InvalidTransition` if the stored state is terminal.
    async fn put_symbol_state(&self, state: &SymbolStageState) -> StoreResult<()>;

    /// Loads the state of one unit.
    async fn get_symbol_state(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
    ) -> StoreResult<Option<SymbolStageState>>;

    /// Lists the unit states of one stage in a run, ordered by symbol.
    async fn list_symbol_states(
        &self,
        run_id: &str,
        stage: StageId,
    ) -> StoreResult<Vec<SymbolStageState>>;
}

/// Append-only store of permanently failed units.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Records a failed unit and returns the stored item.
    async fn add_failed_item(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
        error: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> StoreResult<DeadLetterItem>;

    /// Lists items in insertion order, optionally for one run.
    async fn list_items(&self, run_id: Option<&str>) -> StoreResult<Vec<DeadLetterItem>>;
}

/// Resumability snapshots keyed by (run, stage).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Writes the snapshot for (run, stage), replacing an earlier one.
    async fn save_checkpoint(
        &self,
        run_id: &str,
        stage: StageId,
        state: CheckpointState,
    ) -> StoreResult<Checkpoint>;

    /// Loads the most recent snapshot of a run.
    async fn load_checkpoint(&self, run_id: &str) -> StoreResult<Option<Checkpoint>>;
}

/// Rejects an update that would move a unit out of a terminal status.
pub(crate) fn check_transition(
    current: Option<SymbolStatus>,
    next: &SymbolStageState,
) -> StoreResult<()> {
    match current {
        Some(from) if !from.can_transition_to(next.status) => Err(StoreError::InvalidTransition {
            key: format!("{}/{}/{}", next.run_id, next.symbol, next.stage),
            from: from.to_string(),
            to: next.status.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transition() {
        let mut state = SymbolStageState::running("r", "AAPL", StageId::Ingestion);
        assert!(check_transition(None, &state).is_ok());
        assert!(check_transition(Some(SymbolStatus::Retrying), &state).is_ok());

        state.mark_completed();
        assert!(check_transition(Some(SymbolStatus::Running), &state).is_ok());

        let err = check_transition(
            Some(SymbolStatus::Completed),
            &SymbolStageState::running("r", "AAPL", StageId::Ingestion),
        )
        .unwrap_err();
        assert!(err.to_string().contains("r/AAPL/ingestion"));
    }
}
