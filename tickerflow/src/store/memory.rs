//! In-memory store backend.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{check_transition, CheckpointStore, DeadLetterStore, WorkflowStore};
use crate::core::{
    Checkpoint, CheckpointState, DeadLetterItem, RunStatus, StageId, StageRun, SymbolStageState,
    WorkflowRun,
};
use crate::errors::{StoreError, StoreResult};
use crate::utils::now_utc;

type SymbolKey = (String, String, StageId);

/// Keeps every record in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: DashMap<String, WorkflowRun>,
    stage_runs: RwLock<Vec<StageRun>>,
    symbol_states: DashMap<SymbolKey, SymbolStageState>,
    dead_letters: RwLock<Vec<DeadLetterItem>>,
    checkpoints: RwLock<Vec<Checkpoint>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        match self.runs.entry(run.run_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(run.run_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) -> StoreResult<WorkflowRun> {
        let mut run = self
            .runs
            .get_mut(run_id)
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
        Ok(run.clone())
    }

    async fn start_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<StageRun> {
        let mut stage_runs = self.stage_runs.write();
        if stage_runs
            .iter()
            .any(|s| s.run_id == run_id && s.stage == stage)
        {
            return Err(StoreError::Duplicate(format!("stage run {run_id}/{stage}")));
        }
        let stage_run = StageRun::started(run_id, stage);
        stage_runs.push(stage_run.clone());
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
        let mut stage_runs = self.stage_runs.write();
        let stage_run = stage_runs
            .iter_mut()
            .find(|s| s.run_id == run_id && s.stage == stage)
            .ok_or_else(|| StoreError::NotFound(format!("stage run {run_id}/{stage}")))?;

        stage_run.status = status;
        stage_run.succeeded = succeeded;
        stage_run.failed = failed;
        stage_run.completed_at = Some(now_utc());
        Ok(stage_run.clone())
    }

    async fn get_stage_run(&self, run_id: &str, stage: StageId) -> StoreResult<Option<StageRun>> {
        Ok(self
            .stage_runs
            .read()
            .iter()
            .find(|s| s.run_id == run_id && s.stage == stage)
            .cloned())
    }

    async fn list_stage_runs(&self, run_id: &str) -> StoreResult<Vec<StageRun>> {
        Ok(self
            .stage_runs
            .read()
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn put_symbol_state(&self, state: &SymbolStageState) -> StoreResult<()> {
        let key = (state.run_id.clone(), state.symbol.clone(), state.stage);
        match self.symbol_states.entry(key) {
            Entry::Occupied(mut slot) => {
                check_transition(Some(slot.get().status), state)?;
                slot.insert(state.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
            }
        }
        Ok(())
    }

    async fn get_symbol_state(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
    ) -> StoreResult<Option<SymbolStageState>> {
        Ok(self
            .symbol_states
            .get(&(run_id.to_string(), symbol.to_string(), stage))
            .map(|s| s.value().clone()))
    }

    async fn list_symbol_states(
        &self,
        run_id: &str,
        stage: StageId,
    ) -> StoreResult<Vec<SymbolStageState>> {
        let mut states: Vec<SymbolStageState> = self
            .symbol_states
            .iter()
            .filter(|entry| entry.key().0 == run_id && entry.key().2 == stage)
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(states)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn add_failed_item(
        &self,
        run_id: &str,
        symbol: &str,
        stage: StageId,
        error: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> StoreResult<DeadLetterItem> {
        let item = DeadLetterItem::new(run_id, symbol, stage, error, context);
        self.dead_letters.write().push(item.clone());
        Ok(item)
    }

    async fn list_items(&self, run_id: Option<&str>) -> StoreResult<Vec<DeadLetterItem>> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .filter(|item| run_id.map_or(true, |id| item.run_id == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        stage: StageId,
        state: CheckpointState,
    ) -> StoreResult<Checkpoint> {
        let checkpoint = Checkpoint::new(run_id, stage, state)?;
        let mut checkpoints = self.checkpoints.write();
        checkpoints.retain(|c| !(c.run_id == run_id && c.stage == stage));
        checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn load_checkpoint(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .iter()
            .rev()
            .find(|c| c.run_id == run_id)
            .cloned())
    }
}
