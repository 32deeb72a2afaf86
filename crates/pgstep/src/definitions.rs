//! Migration Definitions - Core types shared by the parser and the runner
//!
//! Defines MigrationStep, the ledger record, the run report and the
//! StepSource abstraction the runner pulls steps from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MigrateResult;

/// Maximum byte length of a step name, matching the ledger column
pub const MAX_STEP_NAME_LEN: usize = 255;

/// A single SQL statement to execute as one migration step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Name of the block this statement belongs to, i.e. "v1->v2"
    pub name: String,
    /// 1-based position of the statement within its named block
    pub sequence_no: u32,
    /// The statement itself, terminated with `;`
    pub sql: String,
}

impl MigrationStep {
    pub fn new(name: impl Into<String>, sequence_no: u32, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence_no,
            sql: sql.into(),
        }
    }

    /// The "no more steps" marker
    pub fn end() -> Self {
        Self {
            name: String::new(),
            sequence_no: 0,
            sql: String::new(),
        }
    }

    /// A step with an empty name marks the end of the migration
    pub fn is_end(&self) -> bool {
        self.name.is_empty()
    }
}

/// A row of the migrations ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Global step index
    pub id: u32,
    pub name: String,
    pub sequence: u32,
    /// Commit time assigned by the server
    pub executed_at: DateTime<Utc>,
}

/// A step applied during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedStep {
    pub index: u32,
    pub name: String,
    pub sequence_no: u32,
}

/// Result of running migrations
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// First index requested from the step source
    pub resume_index: u32,
    /// Steps committed by this run, in order
    pub applied: Vec<AppliedStep>,
    /// Wall time spent inside the locked region
    pub elapsed: Duration,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Index the next run will start at
    pub fn next_index(&self) -> u32 {
        self.resume_index + self.applied.len() as u32
    }
}

/// Provides migration steps to the runner on demand.
///
/// The runner calls `step` with strictly increasing indices starting at the
/// resume point. After a failed run the same index is requested again, so
/// implementations must return the same step for a given index every time.
#[async_trait]
pub trait StepSource: Send {
    /// Get the step at `index` (1-based), or `None` when there are no more steps
    async fn step(&mut self, index: u32) -> MigrateResult<Option<MigrationStep>>;
}

/// Step source backed by a pre-parsed list of steps, i.e. a script file
#[derive(Debug, Clone, Default)]
pub struct ScriptSteps {
    steps: Vec<MigrationStep>,
}

impl ScriptSteps {
    pub fn new(steps: Vec<MigrationStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }
}

impl From<Vec<MigrationStep>> for ScriptSteps {
    fn from(steps: Vec<MigrationStep>) -> Self {
        Self::new(steps)
    }
}

#[async_trait]
impl StepSource for ScriptSteps {
    async fn step(&mut self, index: u32) -> MigrateResult<Option<MigrationStep>> {
        let position = (index as usize).checked_sub(1);
        Ok(position.and_then(|p| self.steps.get(p)).cloned())
    }
}

/// Step source wrapping a synchronous closure
pub struct StepFn<F> {
    f: F,
}

/// Build a step source from a closure mapping an index to a step
pub fn step_fn<F>(f: F) -> StepFn<F>
where
    F: FnMut(u32) -> MigrateResult<Option<MigrationStep>> + Send,
{
    StepFn { f }
}

#[async_trait]
impl<F> StepSource for StepFn<F>
where
    F: FnMut(u32) -> MigrateResult<Option<MigrationStep>> + Send,
{
    async fn step(&mut self, index: u32) -> MigrateResult<Option<MigrationStep>> {
        (self.f)(index)
    }
}

#[async_trait]
impl<S: StepSource + ?Sized> StepSource for &mut S {
    async fn step(&mut self, index: u32) -> MigrateResult<Option<MigrationStep>> {
        (**self).step(index).await
    }
}

#[async_trait]
impl<S: StepSource + ?Sized> StepSource for Box<S> {
    async fn step(&mut self, index: u32) -> MigrateResult<Option<MigrationStep>> {
        (**self).step(index).await
    }
}
