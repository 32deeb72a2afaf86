//! Session Traits - The store operations the migration runner depends on
//!
//! The runner never talks to a driver directly. Everything goes through a
//! single session implementing these traits, so the advisory lock, the
//! ledger queries and every step transaction share one connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{MigrateError, MigrateResult, StoreError, StoreErrorKind};
use crate::lock::AdvisoryLock;

/// Database value for parameter binding and row access
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A fetched row, columns kept in select order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<(String, DatabaseValue)>) -> Self {
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn get_by_index(&self, index: usize) -> MigrateResult<&DatabaseValue> {
        self.columns
            .get(index)
            .map(|(_, value)| value)
            .ok_or_else(|| column_error(&format!("#{}", index), "column not found"))
    }

    pub fn get_by_name(&self, name: &str) -> MigrateResult<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
            .ok_or_else(|| column_error(name, "column not found"))
    }

    pub fn get_i64(&self, name: &str) -> MigrateResult<i64> {
        self.get_by_name(name)?
            .as_i64()
            .ok_or_else(|| column_error(name, "expected an integer"))
    }

    pub fn get_string(&self, name: &str) -> MigrateResult<String> {
        self.get_by_name(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| column_error(name, "expected a string"))
    }

    pub fn get_datetime(&self, name: &str) -> MigrateResult<DateTime<Utc>> {
        self.get_by_name(name)?
            .as_datetime()
            .ok_or_else(|| column_error(name, "expected a timestamp"))
    }
}

fn column_error(column: &str, reason: &str) -> MigrateError {
    MigrateError::Store(StoreError::new(
        StoreErrorKind::Generic,
        format!("Failed to read column '{}': {}", column, reason),
    ))
}

/// Statement execution on a single borrowed connection
#[async_trait]
pub trait MigrationConnection: Send {
    /// Execute a statement and return the affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64>;

    /// Execute a query and return its first row
    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Option<DatabaseRow>>;

    /// Execute a query and return every row
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Vec<DatabaseRow>>;

    /// Begin a transaction on this connection
    async fn begin_transaction<'a>(&'a mut self) -> MigrateResult<Box<dyn MigrationTransaction + 'a>>;

    /// Abandon the session after an interrupted operation.
    ///
    /// Stops whatever the server is still running for it, which rolls back
    /// an open transaction and drops every advisory lock it holds or waits
    /// for. The session refuses further use afterwards.
    async fn abort(&mut self) -> MigrateResult<()>;
}

/// A transaction opened on a migration connection.
///
/// Dropping it without commit rolls it back.
#[async_trait]
pub trait MigrationTransaction: Send {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64>;

    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

/// Everything a migration run needs from one session
pub trait MigrationSession: MigrationConnection + AdvisoryLock {}

impl<T: MigrationConnection + AdvisoryLock> MigrationSession for T {}
