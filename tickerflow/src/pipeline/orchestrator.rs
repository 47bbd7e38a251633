//! Top-level workflow coordination.
//!
//! The orchestrator owns the run record: it creates it, drives the stage
//! plan through the [`StageExecutor`], enforces dependency edges between
//! stages, and finalizes the run exactly once. Callers always receive a
//! [`WorkflowResult`]; run-level errors are flattened into it and, unless the
//! failure was a declared gate abort, a checkpoint is left behind so the
//! remaining work can be resumed.

use chrono::NaiveDate;
use futures::FutureExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::descriptor::{StageDescriptor, WorkflowDefinition};
use super::executor::{panic_message, RunContext, StageExecutor, StageOutcome};
use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::core::{
    Checkpoint, CheckpointState, DataFrequency, RunKind, RunStatus, StageId, StageRun,
    SymbolStatus, WorkflowResult, WorkflowRun,
};
use crate::errors::{StageDependencyUnmet, WorkflowError};
use crate::events::{EventKind, EventSink, NoOpEventSink, WorkflowEvent};
use crate::store::{CheckpointStore, DeadLetterStore, WorkflowStore};
use crate::utils::{generate_run_id, normalize_symbols, now_utc};

/// Metadata key linking a run to the run it continues.
const UPSTREAM_RUN_KEY: &str = "upstream_run_id";

/// Upper bound on upstream links followed when resolving a dependency.
const MAX_UPSTREAM_HOPS: usize = 16;

/// Parameters of one workflow invocation.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// What triggered the run.
    pub kind: RunKind,
    /// Requested symbols, normalized before any stage runs.
    pub symbols: Vec<String>,
    /// Data frequency mode.
    pub data_frequency: DataFrequency,
    /// Force refresh flag.
    pub force: bool,
    /// Trading date for gates; today (UTC) when unset.
    pub check_date: Option<NaiveDate>,
    /// Stages to execute; every stage when unset.
    pub stages: Option<Vec<StageId>>,
    /// Run whose completed stages satisfy dependencies outside `stages`.
    pub upstream_run_id: Option<String>,
    /// Cancellation token for this run.
    pub cancel: Option<Arc<CancellationToken>>,
}

impl WorkflowRequest {
    /// Creates a request for every stage with daily bars.
    #[must_use]
    pub fn new<S: AsRef<str>>(kind: RunKind, symbols: &[S]) -> Self {
        Self {
            kind,
            symbols: symbols.iter().map(|s| s.as_ref().to_string()).collect(),
            data_frequency: DataFrequency::default(),
            force: false,
            check_date: None,
            stages: None,
            upstream_run_id: None,
            cancel: None,
        }
    }

    /// Sets the data frequency mode.
    #[must_use]
    pub const fn with_frequency(mut self, data_frequency: DataFrequency) -> Self {
        self.data_frequency = data_frequency;
        self
    }

    /// Sets the force flag.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Pins the trading date gates check.
    #[must_use]
    pub const fn with_check_date(mut self, check_date: NaiveDate) -> Self {
        self.check_date = Some(check_date);
        self
    }

    /// Restricts the run to a subset of stages.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageId>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Names the run that satisfies dependencies outside the selected stages.
    #[must_use]
    pub fn with_upstream_run(mut self, run_id: impl Into<String>) -> Self {
        self.upstream_run_id = Some(run_id.into());
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Bookkeeping for one run while it executes.
#[derive(Debug, Default)]
struct Progress {
    symbols: Vec<String>,
    plan: Vec<StageId>,
    current: Option<StageId>,
    completed: Vec<StageId>,
    required_succeeded: Vec<HashSet<String>>,
}

impl Progress {
    fn record(&mut self, descriptor: &StageDescriptor, outcome: StageOutcome) {
        self.completed.push(descriptor.id);
        if descriptor.required {
            self.required_succeeded
                .push(outcome.succeeded.into_iter().collect());
        }
    }

    /// Symbols that completed every required stage executed so far.
    fn symbols_succeeded(&self) -> usize {
        if self.completed.is_empty() {
            return 0;
        }
        self.symbols
            .iter()
            .filter(|symbol| self.required_succeeded.iter().all(|set| set.contains(*symbol)))
            .count()
    }

    /// The current stage and every planned stage after it.
    fn remaining(&self) -> Vec<StageId> {
        match self.current {
            Some(current) => self
                .plan
                .iter()
                .copied()
                .skip_while(|id| *id != current)
                .collect(),
            None => Vec::new(),
        }
    }

    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        let succeeded = self.symbols_succeeded();
        HashMap::from([
            ("symbols_processed".to_string(), json!(self.symbols.len())),
            ("symbols_succeeded".to_string(), json!(succeeded)),
            (
                "symbols_failed".to_string(),
                json!(self.symbols.len().saturating_sub(succeeded)),
            ),
            ("stages_completed".to_string(), json!(self.completed)),
        ])
    }
}

/// Coordinates workflow runs over a stage definition.
pub struct Orchestrator {
    definition: WorkflowDefinition,
    store: Arc<dyn WorkflowStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over a store implementing every persistence trait.
    #[must_use]
    pub fn new<S>(definition: WorkflowDefinition, store: Arc<S>) -> Self
    where
        S: WorkflowStore + DeadLetterStore + CheckpointStore + 'static,
    {
        Self::from_parts(definition, store.clone(), store.clone(), store)
    }

    /// Creates an orchestrator over separate stores.
    #[must_use]
    pub fn from_parts(
        definition: WorkflowDefinition,
        store: Arc<dyn WorkflowStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            definition,
            store,
            dead_letters,
            checkpoints,
            events: Arc::new(NoOpEventSink),
            config: OrchestratorConfig::default(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the workflow definition.
    #[must_use]
    pub const fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Runs every stage for `symbols`.
    pub async fn execute_workflow<S: AsRef<str>>(
        &self,
        kind: RunKind,
        symbols: &[S],
        data_frequency: DataFrequency,
        force: bool,
    ) -> WorkflowResult {
        let request = WorkflowRequest::new(kind, symbols)
            .with_frequency(data_frequency)
            .with_force(force);
        self.execute(request).await
    }

    /// Runs a workflow request under a fresh run id.
    pub async fn execute(&self, request: WorkflowRequest) -> WorkflowResult {
        let run_id = generate_run_id();
        let span = info_span!("workflow", run_id = %run_id, kind = %request.kind);
        self.run(run_id, request).instrument(span).await
    }

    /// Starts a recovery run for the remaining stages of a checkpoint.
    ///
    /// Dependencies on stages the failed run completed are read from that run.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the checkpoint digest does not match its
    /// state or nothing remains to run.
    pub async fn resume(&self, checkpoint: &Checkpoint) -> Result<WorkflowResult, WorkflowError> {
        if !checkpoint.verify() {
            return Err(WorkflowError::InvalidRequest(format!(
                "checkpoint digest mismatch for run {}",
                checkpoint.run_id
            )));
        }
        let state = &checkpoint.state;
        if state.remaining_stages.is_empty() {
            return Err(WorkflowError::InvalidRequest(format!(
                "checkpoint for run {} has no remaining stages",
                checkpoint.run_id
            )));
        }

        info!(
            upstream_run_id = %checkpoint.run_id,
            stage = %checkpoint.stage,
            remaining = ?state.remaining_stages,
            "Resuming from checkpoint"
        );
        let request = WorkflowRequest::new(RunKind::Recovery, &state.symbols)
            .with_frequency(state.data_frequency)
            .with_force(state.force)
            .with_check_date(state.check_date)
            .with_stages(state.remaining_stages.clone())
            .with_upstream_run(checkpoint.run_id.as_str());
        Ok(self.execute(request).await)
    }

    /// Loads the latest checkpoint of `run_id` and resumes from it.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the checkpoint cannot be loaded and
    /// `InvalidRequest` if the run has none.
    pub async fn resume_run(&self, run_id: &str) -> Result<WorkflowResult, WorkflowError> {
        let checkpoint = self
            .checkpoints
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| WorkflowError::InvalidRequest(format!("no checkpoint for run {run_id}")))?;
        self.resume(&checkpoint).await
    }

    async fn run(&self, run_id: String, request: WorkflowRequest) -> WorkflowResult {
        let started = Instant::now();
        let check_date = request
            .check_date
            .unwrap_or_else(|| now_utc().date_naive());
        let normalized = normalize_symbols(&request.symbols);

        let recorded_symbols = normalized
            .as_ref()
            .map_or_else(|_| request.symbols.clone(), Clone::clone);
        let mut run = WorkflowRun::new(
            &run_id,
            request.kind,
            recorded_symbols,
            request.data_frequency,
            request.force,
        )
        .with_metadata("check_date", json!(check_date));
        if let Some(upstream) = &request.upstream_run_id {
            run = run.with_metadata(UPSTREAM_RUN_KEY, json!(upstream));
        }
        if let Err(e) = self.store.create_run(&run).await {
            let err = WorkflowError::from(e);
            error!(error = %err, "Failed to create workflow run");
            return WorkflowResult::failed(run_id, &err, 0, 0, Vec::new());
        }

        info!(
            symbols = run.symbols.len(),
            frequency = %request.data_frequency,
            force = request.force,
            %check_date,
            "Workflow started"
        );
        self.events
            .emit(
                WorkflowEvent::new(EventKind::WorkflowStarted, &run_id)
                    .with_data("kind", json!(request.kind))
                    .with_data("symbols", json!(run.symbols.len())),
            )
            .await;

        let ctx = RunContext {
            run_id,
            data_frequency: request.data_frequency,
            force: request.force,
            check_date,
        };
        let cancel = request
            .cancel
            .clone()
            .unwrap_or_else(|| Arc::new(CancellationToken::new()));

        let mut progress = Progress::default();
        let driven = match normalized {
            Ok(symbols) => {
                progress.symbols = symbols;
                AssertUnwindSafe(self.drive(&ctx, &request, &cancel, &mut progress))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(WorkflowError::Internal(format!(
                            "panic: {}",
                            panic_message(payload.as_ref())
                        )))
                    })
            }
            Err(e) => Err(WorkflowError::InvalidRequest(e.to_string())),
        };
        let finished = match driven {
            Ok(()) => self.finish(&ctx, &progress, started).await,
            Err(err) => Err(err),
        };

        match finished {
            Ok(result) => result,
            Err(err) => self.fail(&ctx, &request, &progress, err).await,
        }
    }

    /// Executes the planned stages in declared order.
    async fn drive(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        cancel: &Arc<CancellationToken>,
        progress: &mut Progress,
    ) -> Result<(), WorkflowError> {
        let plan = self
            .definition
            .plan(request.stages.as_deref())
            .map_err(|e| WorkflowError::InvalidRequest(format!("{e}: {:?}", e.stages)))?;
        if plan.is_empty() {
            return Err(WorkflowError::InvalidRequest("no stages selected".to_string()));
        }
        progress.plan = plan.iter().map(|d| d.id).collect();

        let executor = self.executor(cancel.clone());
        for descriptor in plan {
            progress.current = Some(descriptor.id);
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
                ));
            }

            let candidates = self
                .candidates(ctx, request.upstream_run_id.as_deref(), progress, descriptor)
                .await?;
            debug!(
                stage = %descriptor.id,
                candidates = candidates.len(),
                "Resolved stage candidates"
            );

            let outcome = executor.execute_stage(ctx, descriptor, &candidates).await?;
            if !descriptor.required && !outcome.failed.is_empty() {
                warn!(
                    stage = %descriptor.id,
                    failed = outcome.failed.len(),
                    "Optional stage finished with failures"
                );
            }
            progress.record(descriptor, outcome);
        }
        progress.current = None;
        Ok(())
    }

    /// Filters the run's symbols to those that completed every dependency.
    ///
    /// Fails if a dependency's stage run did not complete.
    async fn candidates(
        &self,
        ctx: &RunContext,
        upstream: Option<&str>,
        progress: &Progress,
        descriptor: &StageDescriptor,
    ) -> Result<Vec<String>, WorkflowError> {
        let mut candidates = progress.symbols.clone();

        for &dependency in &descriptor.depends_on {
            let stage_run = if progress.completed.contains(&dependency) {
                self.store.get_stage_run(&ctx.run_id, dependency).await?
            } else {
                self.locate_dependency(upstream, dependency).await?
            };

            let stage_run = match stage_run {
                Some(stage_run) if stage_run.status == RunStatus::Completed => stage_run,
                Some(stage_run) => {
                    return Err(StageDependencyUnmet::new(
                        descriptor.id,
                        dependency,
                        format!("stage run in {} is {}", stage_run.run_id, stage_run.status),
                    )
                    .into());
                }
                None => {
                    return Err(StageDependencyUnmet::new(
                        descriptor.id,
                        dependency,
                        "no stage run found",
                    )
                    .into());
                }
            };

            let completed: HashSet<String> = self
                .store
                .list_symbol_states(&stage_run.run_id, dependency)
                .await?
                .into_iter()
                .filter(|state| state.status == SymbolStatus::Completed)
                .map(|state| state.symbol)
                .collect();
            candidates.retain(|symbol| completed.contains(symbol));
        }

        Ok(candidates)
    }

    /// Follows upstream links until a stage run for `stage` is found.
    async fn locate_dependency(
        &self,
        upstream: Option<&str>,
        stage: StageId,
    ) -> Result<Option<StageRun>, WorkflowError> {
        let mut next = upstream.map(str::to_string);
        let mut hops = 0;

        while let Some(run_id) = next {
            if hops == MAX_UPSTREAM_HOPS {
                warn!(%stage, "Upstream run chain too long");
                break;
            }
            hops += 1;

            if let Some(stage_run) = self.store.get_stage_run(&run_id, stage).await? {
                return Ok(Some(stage_run));
            }
            next = self.store.get_run(&run_id).await?.and_then(|run| {
                run.metadata
                    .get(UPSTREAM_RUN_KEY)
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            });
        }

        Ok(None)
    }

    fn executor(&self, cancel: Arc<CancellationToken>) -> StageExecutor {
        StageExecutor::new(self.store.clone(), self.dead_letters.clone())
            .with_retry_policy(self.config.retry.clone())
            .with_max_concurrency(self.config.max_concurrency)
            .with_default_timeout(self.config.stage_timeout())
            .with_event_sink(self.events.clone())
            .with_cancellation_token(cancel)
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        progress: &Progress,
        started: Instant,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.store
            .finalize_run(&ctx.run_id, RunStatus::Completed, progress.metadata())
            .await?;

        let result = WorkflowResult::completed(
            &ctx.run_id,
            progress.symbols.len(),
            progress.symbols_succeeded(),
            progress.completed.clone(),
        );
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            succeeded = result.symbols_succeeded,
            failed = result.symbols_failed,
            duration_ms,
            "Workflow completed"
        );
        self.events
            .emit(
                WorkflowEvent::new(EventKind::WorkflowCompleted, &ctx.run_id)
                    .with_data("symbols_succeeded", json!(result.symbols_succeeded))
                    .with_data("symbols_failed", json!(result.symbols_failed))
                    .with_data("duration_ms", json!(duration_ms)),
            )
            .await;
        Ok(result)
    }

    /// Converts a run-level error into a failed run and result.
    async fn fail(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        progress: &Progress,
        err: WorkflowError,
    ) -> WorkflowResult {
        error!(
            error = %err,
            error_kind = err.kind(),
            stage = ?progress.current,
            "Workflow failed"
        );

        let checkpoint_stage = progress.current.or_else(|| progress.completed.last().copied());
        if let Some(stage) = checkpoint_stage.filter(|_| err.needs_checkpoint()) {
            let state = CheckpointState {
                symbols: progress.symbols.clone(),
                data_frequency: ctx.data_frequency,
                force: ctx.force,
                kind: request.kind,
                check_date: ctx.check_date,
                completed_stages: progress.completed.clone(),
                remaining_stages: progress.remaining(),
                error: Some(err.to_string()),
            };
            match self.checkpoints.save_checkpoint(&ctx.run_id, stage, state).await {
                Ok(checkpoint) => info!(%stage, digest = %checkpoint.digest, "Checkpoint saved"),
                Err(e) => error!(%stage, error = %e, "Failed to save checkpoint"),
            }
        }

        let mut metadata = progress.metadata();
        metadata.insert("error".to_string(), json!(err.to_string()));
        metadata.insert("error_kind".to_string(), json!(err.kind()));
        if let Some(stage) = progress.current {
            metadata.insert("failed_stage".to_string(), json!(stage));
        }
        if let Err(e) = self
            .store
            .finalize_run(&ctx.run_id, RunStatus::Failed, metadata)
            .await
        {
            error!(error = %e, "Failed to finalize failed run");
        }

        let mut event = WorkflowEvent::new(EventKind::WorkflowFailed, &ctx.run_id)
            .with_data("error", json!(err.to_string()))
            .with_data("error_kind", json!(err.kind()));
        if let Some(stage) = progress.current {
            event = event.for_stage(stage);
        }
        self.events.emit(event).await;

        WorkflowResult::failed(
            &ctx.run_id,
            &err,
            progress.symbols.len(),
            progress.symbols_succeeded(),
            progress.completed.clone(),
        )
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.definition.stage_ids())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{NoOpStage, StageFn};

    fn descriptor(id: StageId, required: bool) -> StageDescriptor {
        let runner: Arc<dyn StageFn> = Arc::new(NoOpStage::new(id.as_str()));
        if required {
            StageDescriptor::required(id, runner)
        } else {
            StageDescriptor::optional(id, runner)
        }
    }

    fn outcome(stage: StageId, succeeded: &[&str]) -> StageOutcome {
        StageOutcome {
            stage,
            succeeded: succeeded.iter().map(|s| (*s).to_string()).collect(),
            failed: Vec::new(),
            not_started: Vec::new(),
        }
    }

    #[test]
    fn test_request_builder() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();
        let request = WorkflowRequest::new(RunKind::OnDemand, &["aapl"])
            .with_frequency(DataFrequency::Weekly)
            .with_force(true)
            .with_check_date(day)
            .with_stages(vec![StageId::Signals])
            .with_upstream_run("run-0");

        assert_eq!(request.symbols, vec!["aapl"]);
        assert_eq!(request.data_frequency, DataFrequency::Weekly);
        assert!(request.force);
        assert_eq!(request.check_date, Some(day));
        assert_eq!(request.upstream_run_id.as_deref(), Some("run-0"));
        assert!(request.cancel.is_none());
    }

    #[test]
    fn test_progress_counts_required_stages_only() {
        let mut progress = Progress {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "BAD".to_string()],
            ..Progress::default()
        };
        assert_eq!(progress.symbols_succeeded(), 0);

        progress.record(
            &descriptor(StageId::Ingestion, true),
            outcome(StageId::Ingestion, &["AAPL", "MSFT"]),
        );
        progress.record(
            &descriptor(StageId::Financials, false),
            outcome(StageId::Financials, &[]),
        );
        assert_eq!(progress.symbols_succeeded(), 2);
        assert_eq!(progress.completed, vec![StageId::Ingestion, StageId::Financials]);

        let metadata = progress.metadata();
        assert_eq!(metadata["symbols_failed"], 1);
        assert_eq!(metadata["stages_completed"], json!(["ingestion", "financials"]));
    }

    #[test]
    fn test_progress_optional_only_counts_every_symbol() {
        let mut progress = Progress {
            symbols: vec!["AAPL".to_string()],
            ..Progress::default()
        };
        progress.record(
            &descriptor(StageId::GrowthMetrics, false),
            outcome(StageId::GrowthMetrics, &[]),
        );
        assert_eq!(progress.symbols_succeeded(), 1);
    }

    #[test]
    fn test_progress_remaining_starts_at_current() {
        let progress = Progress {
            plan: vec![StageId::Ingestion, StageId::Indicators, StageId::Signals],
            current: Some(StageId::Indicators),
            ..Progress::default()
        };
        assert_eq!(progress.remaining(), vec![StageId::Indicators, StageId::Signals]);
        assert!(Progress::default().remaining().is_empty());
    }
}
