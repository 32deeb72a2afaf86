//! In-memory migration store
//!
//! Understands the ledger statements issued by [`LedgerTable`] and records
//! every other statement verbatim. Advisory locks are reentrant per session
//! and block across sessions, like PostgreSQL session locks. Used by the
//! test suites to exercise the runner without a server.
//!
//! [`LedgerTable`]: crate::ledger::LedgerTable

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::definitions::LedgerRecord;
use crate::error::{MigrateError, MigrateResult, StoreError, StoreErrorKind};
use crate::lock::AdvisoryLock;
use crate::session::{DatabaseRow, DatabaseValue, MigrationConnection, MigrationTransaction};

const CREATE_PREFIX: &str = "CREATE TABLE IF NOT EXISTS ";
const INSERT_PREFIX: &str = "INSERT INTO ";
const LAST_ID_PREFIX: &str = "SELECT id FROM ";
const LIST_PREFIX: &str = "SELECT id, name, sequence, executedAt FROM ";
const LOCK_SQL: &str = "SELECT pg_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";

#[derive(Debug, Default)]
struct StoreState {
    /// Ledger rows keyed by quoted table name
    tables: HashMap<String, Vec<LedgerRecord>>,
    /// Committed non-ledger statements, in order
    executed: Vec<String>,
    /// Lock key to (session id, reentrancy count)
    locks: HashMap<i64, (u64, usize)>,
    failures: Vec<String>,
    next_session: u64,
    rollbacks: usize,
}

/// Shared in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    released: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open a new session; each one behaves like a separate connection
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut state = self.state();
            state.next_session += 1;
            state.next_session
        };
        MemorySession {
            id,
            store: self.clone(),
            held: Vec::new(),
            closed: false,
        }
    }

    /// Make every statement containing `fragment` fail.
    ///
    /// Lock calls are matched as `SELECT pg_advisory_lock($1)` and
    /// `SELECT pg_advisory_unlock($1)`.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.state().failures.push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Committed non-ledger statements, in order
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Ledger rows of a table, by its quoted name
    pub fn ledger_rows(&self, quoted_table: &str) -> Vec<LedgerRecord> {
        self.state().tables.get(quoted_table).cloned().unwrap_or_default()
    }

    pub fn has_table(&self, quoted_table: &str) -> bool {
        self.state().tables.contains_key(quoted_table)
    }

    /// Highest committed ledger id of a table
    pub fn max_id(&self, quoted_table: &str) -> Option<u32> {
        self.state()
            .tables
            .get(quoted_table)
            .and_then(|rows| rows.iter().map(|r| r.id).max())
    }

    /// Session currently holding `key`
    pub fn lock_holder(&self, key: i64) -> Option<u64> {
        self.state().locks.get(&key).map(|(session, _)| *session)
    }

    pub fn rollback_count(&self) -> usize {
        self.state().rollbacks
    }

    fn check_failure(&self, sql: &str) -> Result<(), StoreError> {
        if self.state().failures.iter().any(|f| sql.contains(f.as_str())) {
            return Err(StoreError::with_code("42601", format!("injected failure in: {}", sql)));
        }
        Ok(())
    }

    /// Apply a batch of operations, all or nothing
    fn apply(&self, ops: Vec<PendingOp>) -> Result<(), StoreError> {
        let mut state = self.state();

        for (pos, op) in ops.iter().enumerate() {
            if let PendingOp::Ledger { table, record } = op {
                let rows = state.tables.get(table).ok_or_else(|| missing_table(table))?;
                let pending_duplicate = ops[..pos].iter().any(
                    |p| matches!(p, PendingOp::Ledger { table: t, record: r } if t == table && r.id == record.id),
                );
                if pending_duplicate || rows.iter().any(|r| r.id == record.id) {
                    return Err(duplicate_id(table, record.id));
                }
            }
        }

        for op in ops {
            match op {
                PendingOp::Statement(sql) => state.executed.push(sql),
                PendingOp::Ledger { table, record } => state.tables.entry(table).or_default().push(record),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Statement(String),
    Ledger { table: String, record: LedgerRecord },
}

/// A connection to a [`MemoryStore`]
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    store: MemoryStore,
    held: Vec<i64>,
    closed: bool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> MigrateResult<()> {
        if self.closed {
            return Err(MigrateError::Store(StoreError::new(
                StoreErrorKind::Connection,
                "Session is closed",
            )));
        }
        Ok(())
    }

    /// Parse a statement into an operation without applying it
    fn plan(&self, sql: &str, params: &[DatabaseValue]) -> Result<PendingOp, StoreError> {
        self.store.check_failure(sql)?;

        if let Some(table) = sql.strip_prefix(INSERT_PREFIX).and_then(leading_identifier) {
            let id = param_u32(params, 0, "id")?;
            let name = params
                .get(1)
                .and_then(DatabaseValue::as_str)
                .ok_or_else(|| bad_param("name"))?
                .to_string();
            let sequence = param_u32(params, 2, "sequence")?;
            return Ok(PendingOp::Ledger {
                table: table.to_string(),
                record: LedgerRecord {
                    id,
                    name,
                    sequence,
                    executed_at: Utc::now(),
                },
            });
        }
        Ok(PendingOp::Statement(sql.to_string()))
    }
}

#[async_trait]
impl MigrationConnection for MemorySession {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        self.ensure_open()?;
        if let Some(table) = sql.strip_prefix(CREATE_PREFIX).and_then(leading_identifier) {
            self.store.check_failure(sql)?;
            self.store.state().tables.entry(table.to_string()).or_default();
            return Ok(0);
        }

        let op = self.plan(sql, params)?;
        self.store.apply(vec![op])?;
        Ok(1)
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Option<DatabaseRow>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[DatabaseValue]) -> MigrateResult<Vec<DatabaseRow>> {
        self.ensure_open()?;
        self.store.check_failure(sql)?;
        let state = self.store.state();

        if let Some(table) = sql.strip_prefix(LAST_ID_PREFIX).and_then(leading_identifier) {
            let rows = state.tables.get(table).ok_or_else(|| missing_table(table))?;
            return Ok(rows
                .iter()
                .map(|r| r.id)
                .max()
                .map(|id| DatabaseRow::new(vec![("id".to_string(), DatabaseValue::Int32(id as i32))]))
                .into_iter()
                .collect());
        }

        if let Some(table) = sql.strip_prefix(LIST_PREFIX).and_then(leading_identifier) {
            let mut rows = state.tables.get(table).ok_or_else(|| missing_table(table))?.clone();
            rows.sort_by_key(|r| r.id);
            return Ok(rows
                .into_iter()
                .map(|r| {
                    DatabaseRow::new(vec![
                        ("id".to_string(), DatabaseValue::Int32(r.id as i32)),
                        ("name".to_string(), DatabaseValue::String(r.name)),
                        ("sequence".to_string(), DatabaseValue::Int32(r.sequence as i32)),
                        ("executedat".to_string(), DatabaseValue::DateTime(r.executed_at)),
                    ])
                })
                .collect());
        }

        Err(MigrateError::Store(StoreError::new(
            StoreErrorKind::Generic,
            format!("unsupported query: {}", sql),
        )))
    }

    async fn begin_transaction<'a>(&'a mut self) -> MigrateResult<Box<dyn MigrationTransaction + 'a>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryTransaction {
            session: self,
            pending: Vec::new(),
            finished: false,
        }))
    }

    async fn abort(&mut self) -> MigrateResult<()> {
        self.closed = true;
        for key in std::mem::take(&mut self.held) {
            release(&self.store, self.id, key);
        }
        Ok(())
    }
}

#[async_trait]
impl AdvisoryLock for MemorySession {
    async fn acquire_lock(&mut self, key: i64) -> MigrateResult<()> {
        self.ensure_open()?;
        self.store
            .check_failure(LOCK_SQL)
            .map_err(|err| MigrateError::lock(key, err.to_string()))?;
        loop {
            let notified = self.store.released.notified();
            {
                let mut state = self.store.state();
                match state.locks.get_mut(&key) {
                    None => {
                        state.locks.insert(key, (self.id, 1));
                        self.held.push(key);
                        return Ok(());
                    }
                    Some((owner, count)) if *owner == self.id => {
                        *count += 1;
                        self.held.push(key);
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    async fn release_lock(&mut self, key: i64) -> MigrateResult<()> {
        self.ensure_open()?;
        self.store
            .check_failure(UNLOCK_SQL)
            .map_err(|err| MigrateError::lock(key, err.to_string()))?;
        if let Some(pos) = self.held.iter().position(|k| *k == key) {
            self.held.remove(pos);
            release(&self.store, self.id, key);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        for key in std::mem::take(&mut self.held) {
            release(&self.store, self.id, key);
        }
    }
}

fn release(store: &MemoryStore, session: u64, key: i64) {
    let mut state = store.state();
    if let Some((owner, count)) = state.locks.get_mut(&key) {
        if *owner == session {
            *count -= 1;
            if *count == 0 {
                state.locks.remove(&key);
            }
        }
    }
    drop(state);
    store.released.notify_waiters();
}

/// Buffers writes until commit; dropping it discards them
pub struct MemoryTransaction<'a> {
    session: &'a mut MemorySession,
    pending: Vec<PendingOp>,
    finished: bool,
}

#[async_trait]
impl<'a> MigrationTransaction for MemoryTransaction<'a> {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let op = self.session.plan(sql, params)?;
        if let PendingOp::Ledger { table, record } = &op {
            let duplicate_pending = self.pending.iter().any(|p| {
                matches!(p, PendingOp::Ledger { table: t, record: r } if t == table && r.id == record.id)
            });
            let state = self.session.store.state();
            let rows = state.tables.get(table).ok_or_else(|| missing_table(table))?;
            if duplicate_pending || rows.iter().any(|r| r.id == record.id) {
                return Err(MigrateError::Store(duplicate_id(table, record.id)));
            }
        }
        self.pending.push(op);
        Ok(1)
    }

    async fn commit(mut self: Box<Self>) -> MigrateResult<()> {
        self.finished = true;
        let pending = std::mem::take(&mut self.pending);
        self.session.store.apply(pending)?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> MigrateResult<()> {
        self.finished = true;
        self.pending.clear();
        self.session.store.state().rollbacks += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.session.store.state().rollbacks += 1;
        }
    }
}

/// The double-quoted identifier at the start of `rest`
fn leading_identifier(rest: &str) -> Option<&str> {
    let bytes = rest.as_bytes();
    if bytes.first() != Some(&b'"') {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return Some(&rest[..=i]);
        }
        i += 1;
    }
    None
}

fn param_u32(params: &[DatabaseValue], index: usize, name: &str) -> Result<u32, StoreError> {
    params
        .get(index)
        .and_then(DatabaseValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| bad_param(name))
}

fn bad_param(name: &str) -> StoreError {
    StoreError::new(StoreErrorKind::Generic, format!("missing or invalid parameter '{}'", name))
}

fn missing_table(table: &str) -> StoreError {
    StoreError::with_code("42P01", format!("relation {} does not exist", table))
}

fn duplicate_id(table: &str, id: u32) -> StoreError {
    StoreError::with_code(
        "23505",
        format!("duplicate key value violates unique constraint on {} (id={})", table, id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerTable;

    fn ledger_insert(id: i32) -> Vec<DatabaseValue> {
        vec![
            DatabaseValue::Int32(id),
            DatabaseValue::String("v1".to_string()),
            DatabaseValue::Int32(1),
        ]
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let store = MemoryStore::new();
        let ledger = LedgerTable::default();
        let mut first = store.session();
        let mut second = store.session();
        ledger.ensure_table(&mut first).await.unwrap();

        let mut tx_first = first.begin_transaction().await.unwrap();
        tx_first.execute("CREATE TABLE a (id int);", &[]).await.unwrap();
        tx_first.execute(&ledger.insert_sql(), &ledger_insert(1)).await.unwrap();

        let mut tx_second = second.begin_transaction().await.unwrap();
        tx_second.execute("CREATE TABLE b (id int);", &[]).await.unwrap();
        tx_second.execute(&ledger.insert_sql(), &ledger_insert(1)).await.unwrap();

        tx_first.commit().await.unwrap();
        let err = tx_second.commit().await.unwrap_err();

        assert!(err.as_store_error().map_or(false, StoreError::is_duplicate_key));
        assert_eq!(store.executed(), vec!["CREATE TABLE a (id int);".to_string()]);
        assert_eq!(store.ledger_rows(ledger.quoted()).len(), 1);
    }

    #[tokio::test]
    async fn test_abort_drops_locks_and_closes_session() {
        let store = MemoryStore::new();
        let mut session = store.session();
        session.acquire_lock(7).await.unwrap();
        session.acquire_lock(7).await.unwrap();

        session.abort().await.unwrap();

        assert!(session.is_closed());
        assert_eq!(store.lock_holder(7), None);
        assert!(session.execute("SELECT 1", &[]).await.is_err());
        assert!(session.acquire_lock(7).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_lock_failures() {
        let store = MemoryStore::new();
        let mut session = store.session();

        store.fail_on(UNLOCK_SQL);
        session.acquire_lock(7).await.unwrap();
        assert!(matches!(session.release_lock(7).await, Err(MigrateError::Lock { key: 7, .. })));
        assert_eq!(store.lock_holder(7), Some(session.id()));

        store.clear_failures();
        session.release_lock(7).await.unwrap();
        assert_eq!(store.lock_holder(7), None);
    }
}
