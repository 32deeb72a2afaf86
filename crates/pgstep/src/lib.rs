//! # pgstep: Step-wise PostgreSQL migrations
//!
//! Splits a migration script into named blocks of SQL statements and applies
//! them one statement at a time. Every applied statement is recorded in a
//! ledger table in the same transaction, so interrupted runs resume exactly
//! where they stopped. Concurrent runs against the same database and ledger
//! are serialized with a PostgreSQL advisory lock.

pub mod config;
pub mod database;
pub mod definitions;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod memory;
pub mod observer;
pub mod postgres;
pub mod runner;
pub mod script;
pub mod session;

#[cfg(test)]
mod script_tests;


pub use config::{is_postgres_url, ConfigError, ConnectionConfig, MigrateConfig, SslMode};
pub use database::PgDatabase;
pub use definitions::*;
pub use error::*;
pub use ledger::{quote_identifier, LedgerTable, DEFAULT_LEDGER_TABLE};
pub use lock::{lock_key, AdvisoryLock, TargetIdentity};
pub use memory::{MemorySession, MemoryStore};
pub use observer::{ErrorHandler, ErrorObserver};
pub use postgres::{PgSession, PgStepTransaction};
pub use runner::{MigrationPhase, MigrationRunner};
pub use script::{load_script, parse_script, parse_script_bytes};
pub use session::*;
