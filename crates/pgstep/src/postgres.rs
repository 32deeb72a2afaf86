//! PostgreSQL Session Implementation
//!
//! Implements the session traits on a single pooled sqlx connection. The
//! advisory lock is session scoped, so the lock, the ledger queries and the
//! step transactions must all run on this one connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgPool, PgRow};
use sqlx::{Column, Postgres, Row, TypeInfo};
use tracing::{debug, error, warn};

use crate::error::{MigrateError, MigrateResult, StoreError, StoreErrorKind};
use crate::lock::AdvisoryLock;
use crate::observer::ErrorObserver;
use crate::session::{DatabaseRow, DatabaseValue, MigrationConnection, MigrationTransaction};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const ABORT_TIMEOUT: Duration = Duration::from_secs(10);

/// A migration session holding one pooled PostgreSQL connection.
///
/// If the session is dropped while it holds (or waits for) an advisory lock
/// the connection is detached from the pool and closed, which makes the
/// server release the lock. An interrupted session is aborted by terminating
/// its server process from a separate connection.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    backend_pid: i32,
    connect_options: Arc<PgConnectOptions>,
    observer: ErrorObserver,
    held_locks: Vec<i64>,
    lock_pending: bool,
}

impl PgSession {
    /// Check out a connection from `pool` and record its server process id
    pub async fn open(pool: &PgPool, observer: ErrorObserver) -> MigrateResult<Self> {
        let mut conn = observer.track(pool.acquire().await.map_err(|e| {
            error!("Failed to acquire database connection: {}", e);
            StoreError::from_sqlx("Failed to acquire database connection", e)
        }))?;

        let backend_pid = observer.track(
            sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| StoreError::from_sqlx("Failed to read backend pid", e)),
        )?;
        debug!("Opened migration session on backend {}", backend_pid);

        Ok(Self {
            conn: Some(conn),
            backend_pid,
            connect_options: pool.connect_options(),
            observer,
            held_locks: Vec::new(),
            lock_pending: false,
        })
    }

    /// Server process id of the session's connection
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Advisory locks currently held by this session
    pub fn held_locks(&self) -> &[i64] {
        &self.held_locks
    }

    fn connection(&mut self) -> MigrateResult<&mut PgConnection> {
        if self.lock_pending {
            return Err(interrupted_error());
        }
        self.conn.as_deref_mut().ok_or_else(closed_error)
    }
}

/// Terminate a server process from a fresh connection outside the pool
async fn terminate_backend(options: &PgConnectOptions, pid: i32) -> Result<bool, sqlx::Error> {
    let mut conn = <PgConnection as sqlx::Connection>::connect_with(options).await?;
    let terminated = sqlx::query_scalar::<_, bool>("SELECT pg_terminate_backend($1)")
        .bind(pid)
        .fetch_one(&mut conn)
        .await;
    if let Err(err) = sqlx::Connection::close(conn).await {
        debug!("Failed to close abort connection: {}", err);
    }
    terminated
}

#[async_trait]
impl MigrationConnection for PgSession {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let conn = self.connection()?;
        let result = bind_all(sqlx::query(sql), params).execute(&mut *conn).await;

        self.observer.track(
            result
                .map(|r| r.rows_affected())
                .map_err(|e| StoreError::from_sqlx("Query execution failed", e)),
        )
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Option<DatabaseRow>> {
        let conn = self.connection()?;
        let result = bind_all(sqlx::query(sql), params).fetch_optional(&mut *conn).await;

        let row = self
            .observer
            .track(result.map_err(|e| StoreError::from_sqlx("Query fetch failed", e)))?;
        row.as_ref().map(pg_row_to_database_row).transpose()
    }

    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Vec<DatabaseRow>> {
        let conn = self.connection()?;
        let result = bind_all(sqlx::query(sql), params).fetch_all(&mut *conn).await;

        let rows = self
            .observer
            .track(result.map_err(|e| StoreError::from_sqlx("Query fetch failed", e)))?;
        rows.iter().map(pg_row_to_database_row).collect()
    }

    async fn begin_transaction<'a>(&'a mut self) -> MigrateResult<Box<dyn MigrationTransaction + 'a>> {
        let observer = self.observer.clone();
        let conn = self.connection()?;
        let tx = observer.track(
            sqlx::Connection::begin(conn)
                .await
                .map_err(|e| StoreError::from_sqlx("Failed to begin transaction", e)),
        )?;

        Ok(Box::new(PgStepTransaction::new(tx, observer)))
    }

    async fn abort(&mut self) -> MigrateResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let held = std::mem::take(&mut self.held_locks);
        self.lock_pending = false;
        warn!(
            "Aborting session on backend {} (advisory locks {:?})",
            self.backend_pid, held
        );

        let terminated = tokio::time::timeout(
            ABORT_TIMEOUT,
            terminate_backend(&self.connect_options, self.backend_pid),
        )
        .await;
        drop(conn.detach());

        match terminated {
            Ok(Ok(true)) => {
                debug!("Terminated backend {}", self.backend_pid);
                Ok(())
            }
            Ok(Ok(false)) => {
                debug!("Backend {} had already exited", self.backend_pid);
                Ok(())
            }
            Ok(Err(err)) => Err(MigrateError::Store(StoreError::from_sqlx(
                "Failed to terminate backend",
                err,
            ))),
            Err(_) => Err(MigrateError::Store(StoreError::new(
                StoreErrorKind::Connection,
                format!("Timed out terminating backend {}", self.backend_pid),
            ))),
        }
    }
}

#[async_trait]
impl AdvisoryLock for PgSession {
    async fn acquire_lock(&mut self, key: i64) -> MigrateResult<()> {
        if self.lock_pending {
            return Err(interrupted_error());
        }
        let conn = self.conn.as_deref_mut().ok_or_else(closed_error)?;
        self.lock_pending = true;
        let result = sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await;
        self.lock_pending = false;

        match result {
            Ok(_) => {
                self.held_locks.push(key);
                debug!("Acquired advisory lock {}", key);
                Ok(())
            }
            Err(err) => {
                let err = StoreError::from_sqlx("Failed to acquire advisory lock", err);
                let message = err.to_string();
                let _ = self.observer.track::<()>(Err(err));
                Err(MigrateError::lock(key, message))
            }
        }
    }

    async fn release_lock(&mut self, key: i64) -> MigrateResult<()> {
        let conn = self.connection()?;
        let result = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await;

        match result {
            Ok(row) => {
                if let Some(pos) = self.held_locks.iter().position(|k| *k == key) {
                    self.held_locks.remove(pos);
                }
                let released: bool = row.try_get(0).unwrap_or(false);
                if !released {
                    warn!("Advisory lock {} was not held by this session", key);
                }
                self.observer.clear();
                Ok(())
            }
            Err(err) => {
                let err = StoreError::from_sqlx("Failed to release advisory lock", err);
                let message = err.to_string();
                let _ = self.observer.track::<()>(Err(err));
                Err(MigrateError::lock(key, message))
            }
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.held_locks.is_empty() && !self.lock_pending {
            return;
        }
        if let Some(conn) = self.conn.take() {
            warn!(
                "Session dropped while holding advisory locks {:?}, closing its connection",
                self.held_locks
            );
            drop(conn.detach());
        }
    }
}

/// A step transaction borrowed from a [`PgSession`]
pub struct PgStepTransaction<'c> {
    tx: Option<sqlx::Transaction<'c, Postgres>>,
    observer: ErrorObserver,
}

impl<'c> PgStepTransaction<'c> {
    pub fn new(tx: sqlx::Transaction<'c, Postgres>, observer: ErrorObserver) -> Self {
        Self { tx: Some(tx), observer }
    }
}

fn closed_error() -> MigrateError {
    MigrateError::Store(StoreError::new(StoreErrorKind::Connection, "Session is closed"))
}

fn interrupted_error() -> MigrateError {
    MigrateError::Store(StoreError::new(
        StoreErrorKind::Connection,
        "Session has an interrupted lock request and must be aborted",
    ))
}

fn completed_error() -> MigrateError {
    MigrateError::Store(StoreError::new(StoreErrorKind::Generic, "Transaction already completed"))
}

#[async_trait]
impl<'c> MigrationTransaction for PgStepTransaction<'c> {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let tx = self.tx.as_mut().ok_or_else(completed_error)?;
        let result = bind_all(sqlx::query(sql), params).execute(&mut **tx).await;

        self.observer.track(
            result
                .map(|r| r.rows_affected())
                .map_err(|e| StoreError::from_sqlx("Query execution failed", e)),
        )
    }

    async fn commit(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self.tx.take().ok_or_else(completed_error)?;
        self.observer.track(
            tx.commit()
                .await
                .map_err(|e| StoreError::from_sqlx("Transaction commit failed", e)),
        )
    }

    async fn rollback(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self.tx.take().ok_or_else(completed_error)?;
        self.observer.track(
            tx.rollback()
                .await
                .map_err(|e| StoreError::from_sqlx("Transaction rollback failed", e)),
        )
    }
}

fn bind_all<'q>(mut query: PgQuery<'q>, params: &[DatabaseValue]) -> PgQuery<'q> {
    for param in params {
        query = bind_database_value(query, param);
    }
    query
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(query: PgQuery<'q>, value: &DatabaseValue) -> PgQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

fn pg_row_to_database_row(row: &PgRow) -> MigrateResult<DatabaseRow> {
    let mut columns = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        columns.push((column.name().to_string(), postgres_value_to_database_value(row, index)?));
    }
    Ok(DatabaseRow::new(columns))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> MigrateResult<DatabaseValue> {
    let type_name = row.columns()[index].type_info().name();
    let read_error = |e: sqlx::Error| {
        MigrateError::Store(StoreError::new(
            StoreErrorKind::Generic,
            format!("Failed to read {} column {}: {}", type_name, index, e),
        ))
    };

    let value: DatabaseValue = match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(read_error)?
            .map(i32::from)
            .into(),
        "INT4" => row.try_get::<Option<i32>, _>(index).map_err(read_error)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index).map_err(read_error)?.into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(read_error)?
            .map(|naive| Utc.from_utc_datetime(&naive))
            .into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map_err(read_error)?
            .into(),
        _ => row.try_get::<Option<String>, _>(index).map_err(read_error)?.into(),
    };
    Ok(value)
}
