//! Database Integration - PostgreSQL pool and migration entry points
//!
//! `PgDatabase` owns the connection pool for one target database. Each
//! migration run checks out a dedicated session from the pool and keeps it
//! for the whole run.

use std::future::Future;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::config::ConnectionConfig;
use crate::definitions::{LedgerRecord, MigrationReport, MigrationStep, ScriptSteps, StepSource};
use crate::error::{MigrateError, MigrateResult, StoreError, StoreErrorKind};
use crate::ledger::LedgerTable;
use crate::lock::TargetIdentity;
use crate::observer::ErrorObserver;
use crate::postgres::PgSession;
use crate::runner::MigrationRunner;
use crate::session::MigrationConnection;

/// A migration target backed by a PostgreSQL pool
pub struct PgDatabase {
    pool: PgPool,
    database_name: String,
    identity: TargetIdentity,
    observer: ErrorObserver,
}

impl PgDatabase {
    /// Connect using the given configuration
    pub async fn connect(config: &ConnectionConfig) -> MigrateResult<Self> {
        Self::connect_with_observer(config, ErrorObserver::silent()).await
    }

    /// Connect, reporting fatal store errors to `observer`
    pub async fn connect_with_observer(config: &ConnectionConfig, observer: ErrorObserver) -> MigrateResult<Self> {
        debug!(
            "Creating database pool for {}: max={}, timeout={}s",
            config.display_target(),
            config.max_connections,
            config.acquire_timeout.as_secs()
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options())
            .await
            .map_err(|e| {
                error!("Failed to create database pool: {}", e);
                StoreError::from_sqlx("Failed to create database pool", e)
            });
        let pool = observer.track(pool)?;

        info!("Connected to {}", config.display_target());
        Ok(Self::from_pool(pool, config.database.clone(), observer))
    }

    /// Connect from a `postgres://` URL
    pub async fn from_url(url: &str) -> MigrateResult<Self> {
        let config = ConnectionConfig::from_url(url)?;
        Self::connect(&config).await
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, database_name: impl Into<String>, observer: ErrorObserver) -> Self {
        let database_name = database_name.into();
        let identity = TargetIdentity::from_database_name(&database_name);
        Self {
            pool,
            database_name,
            identity,
            observer,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub fn observer(&self) -> &ErrorObserver {
        &self.observer
    }

    /// Check out a dedicated session from the pool
    pub async fn session(&self) -> MigrateResult<PgSession> {
        if self.pool.is_closed() {
            return Err(MigrateError::Store(StoreError::new(
                StoreErrorKind::Connection,
                "Database pool is closed",
            )));
        }

        PgSession::open(&self.pool, self.observer.clone()).await
    }

    /// Runner for the given ledger table on this database
    pub fn runner(&self, ledger_table: &str) -> MigrationRunner {
        MigrationRunner::new(&self.identity, ledger_table)
    }

    /// Apply every pending step from `source`
    pub async fn run_migrations<P>(&self, ledger_table: &str, source: &mut P) -> MigrateResult<MigrationReport>
    where
        P: StepSource + ?Sized,
    {
        let mut session = self.session().await?;
        self.runner(ledger_table).run(&mut session, source).await
    }

    /// Apply pending steps until `cancel` completes
    pub async fn run_migrations_until<P, C>(
        &self,
        ledger_table: &str,
        source: &mut P,
        cancel: C,
    ) -> MigrateResult<MigrationReport>
    where
        P: StepSource + ?Sized,
        C: Future<Output = ()> + Send,
    {
        let mut session = self.session().await?;
        self.runner(ledger_table).run_until(&mut session, source, cancel).await
    }

    /// Apply the pending steps of a parsed script
    pub async fn run_script(&self, ledger_table: &str, steps: Vec<MigrationStep>) -> MigrateResult<MigrationReport> {
        let mut source = ScriptSteps::new(steps);
        self.run_migrations(ledger_table, &mut source).await
    }

    /// List the steps recorded in the ledger table without creating it
    pub async fn applied_steps(&self, ledger_table: &str) -> MigrateResult<Vec<LedgerRecord>> {
        let mut session = self.session().await?;
        LedgerTable::new(ledger_table).applied_records(&mut session).await
    }

    /// Execute a single statement outside of any migration
    pub async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        let mut session = self.session().await?;
        session.execute(sql, &[]).await
    }

    /// Close the pool and reset the error state
    pub async fn close(&self) {
        self.pool.close().await;
        self.observer.clear();
        info!("Database pool for {} closed", self.database_name);
    }
}
