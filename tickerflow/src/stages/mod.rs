//! Stage functions.
//!
//! A stage function performs one stage's work for one symbol: fetch and
//! upsert bars, compute indicators, generate signals. The executor owns
//! retries, gates, and bookkeeping around it.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

use crate::core::DataFrequency;
use crate::errors::StageError;

/// Everything a stage function receives for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInput {
    /// The symbol to process.
    pub symbol: String,
    /// The enclosing run.
    pub run_id: String,
    /// Data frequency mode of the run.
    pub data_frequency: DataFrequency,
    /// Whether to refresh data that is already current.
    pub force: bool,
    /// The trading date gates will check.
    pub check_date: NaiveDate,
}

/// Work performed by a stage for one symbol.
#[async_trait]
pub trait StageFn: Send + Sync + Debug {
    /// Returns a name for logs.
    fn name(&self) -> &str;

    /// Runs the stage for `input.symbol`.
    ///
    /// Must be idempotent per (symbol, date): re-running after a partial
    /// failure overwrites rather than duplicates.
    async fn run(&self, input: &StageInput) -> Result<(), StageError>;
}

/// A closure-based stage function.
pub struct FnStage<F>
where
    F: Fn(&StageInput) -> Result<(), StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageInput) -> Result<(), StageError> + Send + Sync,
{
    /// Creates a closure-based stage function.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageInput) -> Result<(), StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StageFn for FnStage<F>
where
    F: Fn(&StageInput) -> Result<(), StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &StageInput) -> Result<(), StageError> {
        (self.func)(input)
    }
}

/// An async closure-based stage function.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    name: String,
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    /// Creates an async closure-based stage function.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _future: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> StageFn for AsyncFnStage<F, Fut>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &StageInput) -> Result<(), StageError> {
        (self.func)(input.clone()).await
    }
}

/// A stage function that always succeeds.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a no-op stage function.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl StageFn for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _input: &StageInput) -> Result<(), StageError> {
        Ok(())
    }
}
