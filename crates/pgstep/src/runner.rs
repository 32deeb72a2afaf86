//! Migration Runner - Applies migration steps exactly once
//!
//! A run takes the advisory lock for its (database, ledger table) pair,
//! makes sure the ledger exists, resumes one past the last committed step
//! and then pulls steps from a [`StepSource`] until it reports the end.
//! Each step and its ledger row are committed in one transaction, so a
//! failed step leaves no trace and the next run retries the same index.

use std::future::Future;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::definitions::{AppliedStep, MigrationReport, MigrationStep, StepSource, MAX_STEP_NAME_LEN};
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::LedgerTable;
use crate::lock::{lock_key, TargetIdentity};
use crate::session::MigrationSession;

/// Phases of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Locking,
    Preparing,
    Resolving,
    Running(u32),
    Done,
    Failed,
}

/// Executes migration steps against one ledger table
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    ledger: LedgerTable,
    lock_key: i64,
}

impl MigrationRunner {
    /// Create a runner for the given target and ledger table name
    pub fn new(target: &TargetIdentity, ledger_table: impl Into<String>) -> Self {
        let ledger = LedgerTable::new(ledger_table);
        let lock_key = lock_key(target, ledger.name());
        Self { ledger, lock_key }
    }

    pub fn ledger(&self) -> &LedgerTable {
        &self.ledger
    }

    /// Advisory lock key shared by every run against this target and table
    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Run all pending steps on `session`
    pub async fn run<S, P>(&self, session: &mut S, source: &mut P) -> MigrateResult<MigrationReport>
    where
        S: MigrationSession + ?Sized,
        P: StepSource + ?Sized,
    {
        self.run_until(session, source, std::future::pending::<()>()).await
    }

    /// Run all pending steps, aborting when `cancel` completes.
    ///
    /// On cancellation the session is aborted: the server stops the running
    /// statement, rolls back the step transaction and drops the lock, held
    /// or still queued. The session cannot be reused and
    /// `MigrateError::Cancelled` is returned.
    pub async fn run_until<S, P, C>(
        &self,
        session: &mut S,
        source: &mut P,
        cancel: C,
    ) -> MigrateResult<MigrationReport>
    where
        S: MigrationSession + ?Sized,
        P: StepSource + ?Sized,
        C: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let mut locked = false;
        tokio::pin!(cancel);

        let outcome = {
            let protocol = self.locked_run(&mut *session, source, &mut locked, started);
            tokio::select! {
                result = protocol => Some(result),
                _ = &mut cancel => None,
            }
        };

        let Some(outcome) = outcome else {
            warn!("Migration on {} cancelled, aborting its session", self.ledger.quoted());
            if let Err(err) = session.abort().await {
                error!("Failed to abort cancelled migration session: {}", err);
            }
            return Err(MigrateError::Cancelled);
        };

        if !locked {
            if let Err(err) = &outcome {
                debug!(phase = ?MigrationPhase::Failed, "Migration aborted before locking: {}", err);
            }
            return outcome;
        }

        let released = session.release_lock(self.lock_key).await;
        debug!("Released migration lock {}", self.lock_key);

        match (outcome, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(err)) => {
                error!("Failed to release migration lock {}: {}", self.lock_key, err);
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!("Failed to release migration lock {}: {}", self.lock_key, release_err);
                Err(err)
            }
        }
    }

    async fn locked_run<S, P>(
        &self,
        session: &mut S,
        source: &mut P,
        locked: &mut bool,
        started: Instant,
    ) -> MigrateResult<MigrationReport>
    where
        S: MigrationSession + ?Sized,
        P: StepSource + ?Sized,
    {
        debug!(phase = ?MigrationPhase::Locking, "Acquiring migration lock {}", self.lock_key);
        session.acquire_lock(self.lock_key).await?;
        *locked = true;

        debug!(phase = ?MigrationPhase::Preparing, "Ensuring ledger table {}", self.ledger.quoted());
        self.ledger.ensure_table(session).await?;

        let resume_index = self.ledger.resume_index(session).await?;
        debug!(phase = ?MigrationPhase::Resolving, "Resuming migrations at step {}", resume_index);

        let mut index = resume_index;
        let mut applied = Vec::new();
        loop {
            let step = match source.step(index).await? {
                Some(step) if !step.is_end() => step,
                _ => break,
            };
            validate_step(index, &step)?;

            debug!(phase = ?MigrationPhase::Running(index), "Applying step {}", index);
            if let Err(err) = self.apply_step(session, index, &step).await {
                error!(
                    phase = ?MigrationPhase::Failed,
                    "Migration step {} ({} #{}) failed: {}",
                    index, step.name, step.sequence_no, err
                );
                return Err(err);
            }
            info!("Applied migration step {} ({} #{})", index, step.name, step.sequence_no);

            applied.push(AppliedStep {
                index,
                name: step.name,
                sequence_no: step.sequence_no,
            });
            index = index
                .checked_add(1)
                .ok_or_else(|| MigrateError::InvalidStep { index, reason: "step index overflow".to_string() })?;
        }

        let report = MigrationReport {
            resume_index,
            applied,
            elapsed: started.elapsed(),
        };
        debug!(phase = ?MigrationPhase::Done, "Migrations on {} complete", self.ledger.quoted());
        info!(
            "Applied {} migration step(s) in {}ms",
            report.applied_count(),
            report.elapsed.as_millis()
        );
        Ok(report)
    }

    /// Execute one step and record it, both in a single transaction
    async fn apply_step<S>(&self, session: &mut S, index: u32, step: &MigrationStep) -> MigrateResult<()>
    where
        S: MigrationSession + ?Sized,
    {
        let mut tx = session.begin_transaction().await?;

        let mut result = tx.execute(&step.sql, &[]).await.map(|_| ());
        if result.is_ok() {
            result = self.ledger.record_step(tx.as_mut(), index, step).await;
        }

        match result {
            Ok(()) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Failed to roll back migration step {}: {}", index, rollback_err);
                }
                Err(err)
            }
        }
    }
}

fn validate_step(index: u32, step: &MigrationStep) -> MigrateResult<()> {
    if step.name.len() > MAX_STEP_NAME_LEN {
        return Err(MigrateError::InvalidStep {
            index,
            reason: format!("name is longer than {} bytes", MAX_STEP_NAME_LEN),
        });
    }
    if step.sql.trim().is_empty() {
        return Err(MigrateError::InvalidStep {
            index,
            reason: "empty SQL statement".to_string(),
        });
    }
    Ok(())
}
