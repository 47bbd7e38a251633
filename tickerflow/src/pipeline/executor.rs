//! Idempotent per-symbol stage execution.
//!
//! The executor applies one stage to a set of symbols. Per-symbol failures
//! are recovered locally: retried under the [`RetryPolicy`], then written to
//! the dead-letter store. Only gate aborts, store failures, and cancellation
//! leave the executor as errors.

use chrono::NaiveDate;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use super::descriptor::StageDescriptor;
use super::retry::RetryPolicy;
use crate::cancellation::CancellationToken;
use crate::core::{DataFrequency, RunStatus, StageId, SymbolStageState, SymbolStatus};
use crate::errors::{GateFailed, StageError, WorkflowError};
use crate::events::{EventKind, EventSink, NoOpEventSink, WorkflowEvent};
use crate::gates::GateAction;
use crate::stages::StageInput;
use crate::store::{DeadLetterStore, WorkflowStore};

/// Run-wide parameters passed to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// The run being executed.
    pub run_id: String,
    /// Data frequency mode.
    pub data_frequency: DataFrequency,
    /// Force refresh flag.
    pub force: bool,
    /// Trading date checked by gates.
    pub check_date: NaiveDate,
}

impl RunContext {
    fn input_for(&self, symbol: &str) -> StageInput {
        StageInput {
            symbol: symbol.to_string(),
            run_id: self.run_id.clone(),
            data_frequency: self.data_frequency,
            force: self.force,
            check_date: self.check_date,
        }
    }
}

/// Per-symbol result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// The stage executed.
    pub stage: StageId,
    /// Symbols that completed.
    pub succeeded: Vec<String>,
    /// Symbols that ended `failed`.
    pub failed: Vec<String>,
    /// Symbols never started because the stage halted.
    pub not_started: Vec<String>,
}

impl StageOutcome {
    fn new(stage: StageId) -> Self {
        Self {
            stage,
            succeeded: Vec::new(),
            failed: Vec::new(),
            not_started: Vec::new(),
        }
    }
}

/// Terminal status of one (symbol, stage) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Completed,
    Failed,
}

/// Result of one stage-function invocation plus its gate.
enum Attempt {
    Passed,
    Stage(StageError),
    Gate(GateFailed),
}

/// Applies stage functions, gates, and the retry policy to symbols.
pub struct StageExecutor {
    store: Arc<dyn WorkflowStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    max_concurrency: usize,
    default_timeout: Option<Duration>,
}

impl StageExecutor {
    /// Creates an executor with the default retry policy, sequential
    /// execution, and no events.
    #[must_use]
    pub fn new(store: Arc<dyn WorkflowStore>, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            dead_letters,
            retry: RetryPolicy::default(),
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            max_concurrency: 1,
            default_timeout: None,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the run-scoped cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets how many symbols may be processed at once. Zero is treated as one.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the timeout for stages that do not declare their own.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Executes one stage for `symbols`.
    ///
    /// Records a stage run, processes every symbol, and records the final
    /// stage run status with aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns `GateFailed` when a gate aborts, `Store` when persistence
    /// fails, and `Cancelled` when the token fires. New symbols stop
    /// starting on the first of these; in-flight symbols finish.
    pub async fn execute_stage(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        symbols: &[String],
    ) -> Result<StageOutcome, WorkflowError> {
        let stage = descriptor.id;
        let started = Instant::now();

        self.store.start_stage_run(&ctx.run_id, stage).await?;
        self.events
            .emit(
                WorkflowEvent::new(EventKind::StageStarted, &ctx.run_id)
                    .for_stage(stage)
                    .with_data("symbols", json!(symbols.len()))
                    .with_data("required", json!(descriptor.required)),
            )
            .await;
        info!(
            run_id = %ctx.run_id,
            stage = %stage,
            symbols = symbols.len(),
            "Stage started"
        );

        let mut outcome = StageOutcome::new(stage);
        let mut halt: Option<WorkflowError> = None;
        let mut pending = symbols.iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while halt.is_none() && !self.cancel.is_cancelled() && in_flight.len() < self.max_concurrency {
                let Some(symbol) = pending.next() else { break };
                let span = info_span!("symbol", run_id = %ctx.run_id, stage = %stage, symbol = %symbol);
                in_flight.push(self.process_symbol(ctx, descriptor, symbol).instrument(span));
            }

            let Some((symbol, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(UnitOutcome::Completed) => outcome.succeeded.push(symbol),
                Ok(UnitOutcome::Failed) => outcome.failed.push(symbol),
                Err(err) => {
                    outcome.failed.push(symbol);
                    halt.get_or_insert(err);
                }
            }
        }
        outcome.not_started = pending.cloned().collect();

        if halt.is_none() && self.cancel.is_cancelled() {
            halt = Some(WorkflowError::Cancelled(
                self.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }

        let status = if halt.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let recorded = self
            .store
            .complete_stage_run(
                &ctx.run_id,
                stage,
                status,
                outcome.succeeded.len(),
                outcome.failed.len(),
            )
            .await;
        if let Err(e) = recorded {
            warn!(run_id = %ctx.run_id, stage = %stage, error = %e, "Failed to record stage run");
            halt.get_or_insert(e.into());
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let kind = if halt.is_some() {
            EventKind::StageFailed
        } else {
            EventKind::StageCompleted
        };
        let mut event = WorkflowEvent::new(kind, &ctx.run_id)
            .for_stage(stage)
            .with_data("succeeded", json!(outcome.succeeded.len()))
            .with_data("failed", json!(outcome.failed.len()))
            .with_data("duration_ms", json!(elapsed_ms));
        if let Some(err) = &halt {
            event = event.with_data("error", json!(err.to_string()));
        }
        self.events.emit(event).await;

        match halt {
            Some(err) => {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %stage,
                    error = %err,
                    not_started = outcome.not_started.len(),
                    "Stage halted"
                );
                Err(err)
            }
            None => {
                info!(
                    run_id = %ctx.run_id,
                    stage = %stage,
                    succeeded = outcome.succeeded.len(),
                    failed = outcome.failed.len(),
                    duration_ms = elapsed_ms,
                    "Stage completed"
                );
                Ok(outcome)
            }
        }
    }

    async fn process_symbol(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        symbol: &str,
    ) -> (String, Result<UnitOutcome, WorkflowError>) {
        let result = self.run_unit(ctx, descriptor, symbol).await;
        (symbol.to_string(), result)
    }

    async fn run_unit(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        symbol: &str,
    ) -> Result<UnitOutcome, WorkflowError> {
        let existing = self
            .store
            .get_symbol_state(&ctx.run_id, symbol, descriptor.id)
            .await?;
        let mut state = match existing {
            Some(state) if state.status == SymbolStatus::Completed => {
                debug!("Unit already completed, skipping");
                return Ok(UnitOutcome::Completed);
            }
            Some(state) if state.status == SymbolStatus::Failed => {
                debug!("Unit already failed, skipping");
                return Ok(UnitOutcome::Failed);
            }
            Some(state) => state,
            None => {
                let state = SymbolStageState::running(&ctx.run_id, symbol, descriptor.id);
                self.store.put_symbol_state(&state).await?;
                state
            }
        };

        let input = ctx.input_for(symbol);
        loop {
            let reason = match self.attempt(ctx, descriptor, &input).await {
                Attempt::Passed => {
                    state.mark_completed();
                    self.store.put_symbol_state(&state).await?;
                    self.events
                        .emit(
                            WorkflowEvent::new(EventKind::SymbolCompleted, &ctx.run_id)
                                .for_stage(descriptor.id)
                                .for_symbol(symbol)
                                .with_data("retry_count", json!(state.retry_count)),
                        )
                        .await;
                    debug!(retry_count = state.retry_count, "Unit completed");
                    return Ok(UnitOutcome::Completed);
                }
                Attempt::Stage(err) => {
                    if !self.retry.should_retry(&err, state.retry_count) {
                        let mut context = HashMap::new();
                        context.insert("error_kind".to_string(), json!(err.kind()));
                        self.dead_letter(ctx, descriptor, &mut state, err.to_string(), context)
                            .await?;
                        return Ok(UnitOutcome::Failed);
                    }
                    err.to_string()
                }
                Attempt::Gate(failure) => {
                    let retryable = failure.action == GateAction::Retry
                        && self.retry.has_attempts_left(state.retry_count);
                    if !retryable {
                        let mut context = HashMap::new();
                        context.insert("error_kind".to_string(), json!("gate_failed"));
                        context.insert("gate".to_string(), json!(failure.gate_name));
                        context.insert("gate_action".to_string(), json!(failure.action));
                        self.dead_letter(ctx, descriptor, &mut state, failure.to_string(), context)
                            .await?;
                        if failure.action == GateAction::Abort {
                            return Err(failure.into());
                        }
                        return Ok(UnitOutcome::Failed);
                    }
                    failure.to_string()
                }
            };

            let retry = state.retry_count + 1;
            let delay = self.retry.wait_for_retry(retry);
            state.mark_retrying(retry, reason.as_str());
            self.store.put_symbol_state(&state).await?;

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(
                attempt = retry + 1,
                max_attempts = self.retry.max_attempts,
                delay_ms,
                error = %reason,
                "Retrying unit after backoff"
            );
            self.events
                .emit(
                    WorkflowEvent::new(EventKind::SymbolRetrying, &ctx.run_id)
                        .for_stage(descriptor.id)
                        .for_symbol(symbol)
                        .with_data("retry_count", json!(retry))
                        .with_data("delay_ms", json!(delay_ms))
                        .with_data("error", json!(reason)),
                )
                .await;

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => {
                    let mut context = HashMap::new();
                    context.insert("error_kind".to_string(), json!("cancelled"));
                    context.insert("cancelled".to_string(), json!(true));
                    let error = format!("cancelled during backoff after: {reason}");
                    self.dead_letter(ctx, descriptor, &mut state, error, context).await?;
                    return Ok(UnitOutcome::Failed);
                }
            }
        }
    }

    /// Invokes the stage function once and, on success, the gate.
    ///
    /// Both calls share the stage timeout and are isolated from panics.
    async fn attempt(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        input: &StageInput,
    ) -> Attempt {
        let limit = descriptor.timeout.or(self.default_timeout);
        match guarded(descriptor.runner.run(input), limit).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) | Err(err) => return Attempt::Stage(err),
        }

        let Some(gate) = &descriptor.gate else {
            return Attempt::Passed;
        };
        match guarded(gate.check(&input.symbol, ctx.check_date, &ctx.run_id), limit).await {
            Ok(result) => result
                .into_failure(gate.name(), &input.symbol)
                .map_or(Attempt::Passed, Attempt::Gate),
            Err(err) => {
                warn!(gate = gate.name(), error = %err, "Gate check did not complete");
                Attempt::Stage(err)
            }
        }
    }

    /// Writes the dead-letter item, then marks the unit failed.
    async fn dead_letter(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        state: &mut SymbolStageState,
        error: String,
        mut context: HashMap<String, serde_json::Value>,
    ) -> Result<(), WorkflowError> {
        context.insert("retry_count".to_string(), json!(state.retry_count));
        self.dead_letters
            .add_failed_item(&ctx.run_id, &state.symbol, descriptor.id, &error, context)
            .await?;

        warn!(retry_count = state.retry_count, error = %error, "Unit dead-lettered");
        self.events
            .emit(
                WorkflowEvent::new(EventKind::SymbolFailed, &ctx.run_id)
                    .for_stage(descriptor.id)
                    .for_symbol(state.symbol.as_str())
                    .with_data("retry_count", json!(state.retry_count))
                    .with_data("error", json!(error)),
            )
            .await;

        state.mark_failed(error);
        self.store.put_symbol_state(state).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("retry", &self.retry)
            .field("max_concurrency", &self.max_concurrency)
            .field("default_timeout", &self.default_timeout)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Awaits `call` under an optional timeout, converting a panic into an error.
async fn guarded<F: Future>(call: F, limit: Option<Duration>) -> Result<F::Output, StageError> {
    let call = AssertUnwindSafe(call).catch_unwind();
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| StageError::Timeout(limit))?,
        None => call.await,
    };
    result.map_err(|payload| StageError::Panicked(panic_message(payload.as_ref())))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::gates::{FnGate, Gate, GateResult};
    use crate::stages::{FnStage, StageFn};
    use crate::store::InMemoryStore;
    use crate::testing::{ScriptedStage, StaticGate};
    use pretty_assertions::assert_eq;

    fn ctx() -> RunContext {
        RunContext {
            run_id: "run-1".to_string(),
            data_frequency: DataFrequency::Daily,
            force: false,
            check_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn executor(store: &Arc<InMemoryStore>) -> StageExecutor {
        StageExecutor::new(store.clone(), store.clone()).with_retry_policy(fast_retry(3))
    }

    #[tokio::test]
    async fn test_permanent_failure_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_permanently("BADSYM", "unknown ticker"));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL", "BADSYM"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["AAPL"]);
        assert_eq!(outcome.failed, vec!["BADSYM"]);
        assert_eq!(stage.calls("BADSYM"), 1);

        let items = store.list_items(Some("run-1")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].symbol, "BADSYM");
        assert_eq!(items[0].context["error_kind"], "permanent");

        let stage_run = store.get_stage_run("run-1", StageId::Ingestion).await.unwrap().unwrap();
        assert_eq!(stage_run.status, RunStatus::Completed);
        assert_eq!((stage_run.succeeded, stage_run.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_success() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_transiently("GOOGL", 2));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["GOOGL"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["GOOGL"]);
        assert_eq!(stage.calls("GOOGL"), 3);
        let state = store
            .get_symbol_state("run-1", "GOOGL", StageId::Ingestion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SymbolStatus::Completed);
        assert_eq!(state.retry_count, 2);
        assert!(store.list_items(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters_once() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_transiently("MSFT", 10));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["MSFT"]))
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["MSFT"]);
        assert_eq!(stage.calls("MSFT"), 3);
        let items = store.list_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].context["retry_count"], 2);
        assert_eq!(items[0].context["error_kind"], "transient");
    }

    #[tokio::test]
    async fn test_gate_skip_dead_letters_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("indicators"));
        let gate = Arc::new(StaticGate::new("indicator_gate").with_result("AAPL", GateResult::skip("NaN RSI")));
        let descriptor =
            StageDescriptor::required(StageId::Indicators, stage.clone()).with_gate(gate.clone());

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL", "MSFT"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["MSFT"]);
        assert_eq!(outcome.failed, vec!["AAPL"]);
        assert_eq!(stage.calls("AAPL"), 1);
        assert_eq!(gate.calls("AAPL"), 1);

        let items = store.list_items(None).await.unwrap();
        assert_eq!(items[0].context["gate"], "indicator_gate");
        assert_eq!(items[0].context["gate_action"], "skip");
    }

    #[tokio::test]
    async fn test_gate_retry_respects_attempt_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest"));
        let gate = Arc::new(StaticGate::new("freshness").with_result("AAPL", GateResult::retry("no record yet")));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone()).with_gate(gate.clone());

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["AAPL"]);
        assert_eq!(stage.calls("AAPL"), 3);
        assert_eq!(gate.calls("AAPL"), 3);
        assert_eq!(store.list_items(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_abort_stops_stage() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("indicators"));
        let gate = Arc::new(StaticGate::new("indicator_gate").with_result("AAPL", GateResult::abort("ledger offline")));
        let descriptor = StageDescriptor::required(StageId::Indicators, stage.clone()).with_gate(gate);

        let err = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL", "MSFT"]))
            .await
            .unwrap_err();

        assert!(err.is_gate_abort());
        assert_eq!(stage.calls("MSFT"), 0);
        let stage_run = store.get_stage_run("run-1", StageId::Indicators).await.unwrap().unwrap();
        assert_eq!(stage_run.status, RunStatus::Failed);
        assert_eq!(store.list_items(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_unit_is_not_rerun() {
        let store = Arc::new(InMemoryStore::new());
        let mut done = SymbolStageState::running("run-1", "AAPL", StageId::Ingestion);
        done.mark_completed();
        store.put_symbol_state(&done).await.unwrap();

        let stage = Arc::new(ScriptedStage::new("ingest"));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());
        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["AAPL"]);
        assert_eq!(stage.calls("AAPL"), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let store = Arc::new(InMemoryStore::new());
        let stage: Arc<dyn StageFn> = Arc::new(crate::stages::AsyncFnStage::new(
            "slow",
            |_input: StageInput| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        ));
        let descriptor = StageDescriptor::optional(StageId::Financials, stage)
            .with_timeout(Duration::from_millis(5));

        let outcome = StageExecutor::new(store.clone(), store.clone())
            .with_retry_policy(fast_retry(2))
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["AAPL"]);
        let items = store.list_items(None).await.unwrap();
        assert_eq!(items[0].context["error_kind"], "timeout");
        assert_eq!(items[0].context["retry_count"], 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(FnStage::new("explodes", |input: &StageInput| {
            if input.symbol == "TSLA" {
                panic!("division by zero");
            }
            Ok(())
        }));
        let descriptor = StageDescriptor::optional(StageId::GrowthMetrics, stage);

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["TSLA", "AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["AAPL"]);
        assert_eq!(outcome.failed, vec!["TSLA"]);
        let items = store.list_items(None).await.unwrap();
        assert!(items[0].error.contains("division by zero"));
    }

    #[tokio::test]
    async fn test_panicking_gate_fails_only_its_symbol() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest"));
        let gate = Arc::new(FnGate::new("fragile", |symbol: &str, _, _| {
            if symbol == "AAPL" {
                panic!("ledger index out of range");
            }
            GateResult::pass()
        }));
        let descriptor =
            StageDescriptor::required(StageId::Ingestion, stage.clone()).with_gate(gate);

        let outcome = executor(&store)
            .execute_stage(&ctx(), &descriptor, &symbols(&["MSFT", "AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec!["MSFT"]);
        assert_eq!(outcome.failed, vec!["AAPL"]);
        assert_eq!(stage.calls("AAPL"), 1);
        let items = store.list_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].error.contains("ledger index out of range"));
        assert_eq!(items[0].context["error_kind"], "panicked");
    }

    #[tokio::test]
    async fn test_hung_gate_times_out() {
        #[derive(Debug)]
        struct HungGate;

        #[async_trait::async_trait]
        impl Gate for HungGate {
            fn name(&self) -> &str {
                "hung"
            }

            async fn check(&self, _symbol: &str, _date: NaiveDate, _run_id: &str) -> GateResult {
                std::future::pending().await
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest"));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone())
            .with_gate(Arc::new(HungGate))
            .with_timeout(Duration::from_millis(10));

        let outcome = executor(&store)
            .with_retry_policy(fast_retry(2))
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["AAPL"]);
        assert_eq!(stage.calls("AAPL"), 2);
        let items = store.list_items(None).await.unwrap();
        assert_eq!(items[0].context["error_kind"], "timeout");
    }

    #[tokio::test]
    async fn test_concurrent_execution_processes_all_symbols() {
        let store = Arc::new(InMemoryStore::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_permanently("BAD", "nope"));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());
        let list = symbols(&["A", "B", "C", "BAD", "D", "E"]);

        let outcome = executor(&store)
            .with_max_concurrency(3)
            .execute_stage(&ctx(), &descriptor, &list)
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 5);
        assert_eq!(outcome.failed, vec!["BAD"]);
        assert_eq!(stage.total_calls(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_token_starts_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let token = Arc::new(CancellationToken::new());
        token.cancel("shutdown");
        let stage = Arc::new(ScriptedStage::new("ingest"));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());

        let err = executor(&store)
            .with_cancellation_token(token)
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Cancelled(ref reason) if reason == "shutdown"));
        assert_eq!(stage.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_dead_letters() {
        let store = Arc::new(InMemoryStore::new());
        let token = Arc::new(CancellationToken::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_transiently("AAPL", 5));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage.clone());
        let exec = StageExecutor::new(store.clone(), store.clone())
            .with_retry_policy(RetryPolicy::new().with_base_delay_ms(10_000).with_max_delay_ms(10_000))
            .with_cancellation_token(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("operator stop");
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            exec.execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"])),
        )
        .await
        .unwrap()
        .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err.kind(), "cancelled");
        assert_eq!(stage.calls("AAPL"), 1);
        let items = store.list_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].context["cancelled"], true);
    }

    #[tokio::test]
    async fn test_emits_lifecycle_events() {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let stage = Arc::new(ScriptedStage::new("ingest").fail_transiently("AAPL", 1));
        let gate = Arc::new(FnGate::new("always", |_, _, _| GateResult::pass()));
        let descriptor = StageDescriptor::required(StageId::Ingestion, stage).with_gate(gate);

        executor(&store)
            .with_event_sink(events.clone())
            .execute_stage(&ctx(), &descriptor, &symbols(&["AAPL"]))
            .await
            .unwrap();

        assert_eq!(
            events.kinds(),
            vec![
                EventKind::StageStarted,
                EventKind::SymbolRetrying,
                EventKind::SymbolCompleted,
                EventKind::StageCompleted,
            ]
        );
    }
}
