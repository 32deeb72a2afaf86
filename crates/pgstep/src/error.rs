//! Error types for the migration system
//!
//! Covers script parsing, store access, the advisory lock and the
//! step source callback.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Top-level error returned by every public migration operation
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Script parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Migration lock {key} error: {message}")]
    Lock { key: i64, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Step source failed: {0}")]
    StepSource(String),

    #[error("Invalid migration step at index {index}: {reason}")]
    InvalidStep { index: u32, reason: String },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Create a lock error for the given key
    pub fn lock(key: i64, message: impl Into<String>) -> Self {
        Self::Lock {
            key,
            message: message.into(),
        }
    }

    /// Create a step source error, for use inside step providers
    pub fn step_source(message: impl Into<String>) -> Self {
        Self::StepSource(message.into())
    }

    /// Get the underlying store error, if any
    pub fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            MigrateError::Store(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors raised while splitting a migration script into steps.
///
/// Lines are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty start of block comment (line {line})")]
    EmptyBlockName { line: usize },

    #[error("SQL sentence found outside a block (line {line})")]
    OutsideBlock { line: usize },

    #[error("invalid SQL content: open string (line {line})")]
    UnterminatedString { line: usize },

    #[error("invalid SQL content: open quoted identifier (line {line})")]
    UnterminatedIdentifier { line: usize },

    #[error("invalid SQL content: malformed dollar tag (line {line})")]
    InvalidDollarTag { line: usize },

    #[error("invalid SQL content: open dollar tag {tag} (line {line})")]
    UnterminatedDollarQuote { tag: String, line: usize },

    #[error("invalid SQL content: invalid character encoding at byte {offset} (line {line})")]
    InvalidEncoding { offset: usize, line: usize },
}

impl ParseError {
    /// Line where the error was detected
    pub fn line(&self) -> usize {
        match self {
            ParseError::EmptyBlockName { line }
            | ParseError::OutsideBlock { line }
            | ParseError::UnterminatedString { line }
            | ParseError::UnterminatedIdentifier { line }
            | ParseError::InvalidDollarTag { line }
            | ParseError::UnterminatedDollarQuote { line, .. }
            | ParseError::InvalidEncoding { line, .. } => *line,
        }
    }
}

/// Category of a store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Network or connectivity problem
    Connection,
    /// Constraint violation (not null, foreign key, check, exclusion)
    ConstraintViolation,
    /// Unique or primary key violation
    DuplicateKey,
    /// Serialization failure or deadlock
    Serialization,
    /// Query returned no rows
    NoRows,
    /// Any other database error
    Generic,
}

/// A classified error coming from the underlying store
#[derive(Debug, Clone, Error)]
#[error("{message}{}", .code.as_ref().map(|c| format!(" [code={}]", c)).unwrap_or_default())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    /// SQLSTATE code reported by the server
    pub code: Option<String>,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// Build an error from a server SQLSTATE code
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: classify_sqlstate(&code),
            message: message.into(),
            code: Some(code),
        }
    }

    /// Wrap a sqlx error, prefixing it with what we were doing
    pub fn from_sqlx(context: &str, err: sqlx::Error) -> Self {
        let mut classified = StoreError::from(err);
        classified.message = format!("{}: {}", context, classified.message);
        classified
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.kind == StoreErrorKind::DuplicateKey
    }

    pub fn is_constraint_violation(&self) -> bool {
        self.kind == StoreErrorKind::ConstraintViolation
    }

    pub fn is_no_rows(&self) -> bool {
        self.kind == StoreErrorKind::NoRows
    }

    pub fn is_connection(&self) -> bool {
        self.kind == StoreErrorKind::Connection
    }

    /// The relation does not exist (SQLSTATE 42P01)
    pub fn is_undefined_table(&self) -> bool {
        self.code.as_deref() == Some("42P01")
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.kind == StoreErrorKind::Serialization
    }

    /// Whether the error should be reported to an error observer
    pub fn is_fatal(&self) -> bool {
        !self.is_no_rows()
    }
}

/// Map a PostgreSQL SQLSTATE code to an error category
pub fn classify_sqlstate(code: &str) -> StoreErrorKind {
    match code {
        "23505" => StoreErrorKind::DuplicateKey,
        "23000" | "23502" | "23503" | "23514" | "23P01" => StoreErrorKind::ConstraintViolation,
        "40001" | "40P01" => StoreErrorKind::Serialization,
        c if c.starts_with("08") => StoreErrorKind::Connection,
        _ => StoreErrorKind::Generic,
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::new(StoreErrorKind::NoRows, "no rows in result set"),
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => StoreError::with_code(code.into_owned(), db_err.message()),
                None => StoreError::new(StoreErrorKind::Generic, db_err.message()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::new(StoreErrorKind::Connection, err.to_string()),
            _ => StoreError::new(StoreErrorKind::Generic, err.to_string()),
        }
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Store(StoreError::from(err))
    }
}
