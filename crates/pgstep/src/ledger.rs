//! Migration Ledger - The table recording which steps have been committed
//!
//! One row per committed step. Ids are contiguous from 1 and the highest id
//! decides where the next run resumes.

use tracing::debug;

use crate::definitions::{LedgerRecord, MigrationStep};
use crate::error::{MigrateError, MigrateResult, StoreError, StoreErrorKind};
use crate::session::{DatabaseValue, MigrationConnection, MigrationTransaction};

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "migrations";

/// Quote an identifier, doubling embedded double quotes
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// SQL access to one ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable {
    name: String,
    quoted: String,
}

impl LedgerTable {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let quoted = quote_identifier(&name);
        Self { name, quoted }
    }

    /// Table name as given by the caller
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table name ready to be embedded in SQL
    pub fn quoted(&self) -> &str {
        &self.quoted
    }

    /// SQL to create the ledger table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id         int NOT NULL PRIMARY KEY,\n    \
                name       varchar(255) NOT NULL,\n    \
                sequence   int NOT NULL,\n    \
                executedAt timestamp NOT NULL\n\
            )",
            self.quoted
        )
    }

    /// SQL to get the last committed step id
    pub fn last_id_sql(&self) -> String {
        format!("SELECT id FROM {} ORDER BY id DESC LIMIT 1", self.quoted)
    }

    /// SQL to record a committed step
    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, name, sequence, executedAt) VALUES ($1, $2, $3, NOW())",
            self.quoted
        )
    }

    /// SQL to list committed steps
    pub fn applied_records_sql(&self) -> String {
        format!(
            "SELECT id, name, sequence, executedAt FROM {} ORDER BY id",
            self.quoted
        )
    }

    /// Create the ledger table if it does not exist
    pub async fn ensure_table<C>(&self, conn: &mut C) -> MigrateResult<()>
    where
        C: MigrationConnection + ?Sized,
    {
        conn.execute(&self.create_table_sql(), &[]).await?;
        debug!("Ledger table {} ready", self.quoted);
        Ok(())
    }

    /// Index of the next step to run: one past the last committed id, or 1
    pub async fn resume_index<C>(&self, conn: &mut C) -> MigrateResult<u32>
    where
        C: MigrationConnection + ?Sized,
    {
        let last = match conn.fetch_optional(&self.last_id_sql(), &[]).await {
            Ok(Some(row)) => row.get_i64("id")?,
            Ok(None) => 0,
            Err(MigrateError::Store(err)) if err.is_no_rows() => 0,
            Err(err) => return Err(err),
        };

        u32::try_from(last + 1).map_err(|_| ledger_error(format!("Invalid last ledger id {}", last)))
    }

    /// Insert the ledger row for a step inside its transaction
    pub async fn record_step(
        &self,
        tx: &mut (dyn MigrationTransaction + '_),
        index: u32,
        step: &MigrationStep,
    ) -> MigrateResult<()> {
        let id = i32::try_from(index).map_err(|_| ledger_error(format!("Step index {} out of range", index)))?;
        let sequence = i32::try_from(step.sequence_no)
            .map_err(|_| ledger_error(format!("Sequence number {} out of range", step.sequence_no)))?;

        tx.execute(
            &self.insert_sql(),
            &[
                DatabaseValue::Int32(id),
                DatabaseValue::String(step.name.clone()),
                DatabaseValue::Int32(sequence),
            ],
        )
        .await?;
        Ok(())
    }

    /// Read every committed step, ordered by id.
    ///
    /// A ledger table that does not exist yet reads as empty.
    pub async fn applied_records<C>(&self, conn: &mut C) -> MigrateResult<Vec<LedgerRecord>>
    where
        C: MigrationConnection + ?Sized,
    {
        let rows = match conn.fetch_all(&self.applied_records_sql(), &[]).await {
            Ok(rows) => rows,
            Err(MigrateError::Store(err)) if err.is_undefined_table() => {
                debug!("Ledger table {} does not exist yet", self.quoted);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.get_i64("id")?;
            let sequence = row.get_i64("sequence")?;
            records.push(LedgerRecord {
                id: u32::try_from(id).map_err(|_| ledger_error(format!("Invalid ledger id {}", id)))?,
                name: row.get_string("name")?,
                sequence: u32::try_from(sequence)
                    .map_err(|_| ledger_error(format!("Invalid ledger sequence {}", sequence)))?,
                executed_at: row.get_datetime("executedAt")?,
            });
        }
        Ok(records)
    }
}

impl Default for LedgerTable {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}

fn ledger_error(message: String) -> MigrateError {
    MigrateError::Store(StoreError::new(StoreErrorKind::Generic, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("migrations"), "\"migrations\"");
        assert_eq!(quote_identifier("my \"odd\" table"), "\"my \"\"odd\"\" table\"");
    }

    #[test]
    fn test_ledger_sql_uses_quoted_name() {
        let ledger = LedgerTable::new("Schema History");

        assert_eq!(ledger.name(), "Schema History");
        assert!(ledger
            .create_table_sql()
            .starts_with("CREATE TABLE IF NOT EXISTS \"Schema History\" ("));
        assert!(ledger.create_table_sql().contains("name       varchar(255) NOT NULL"));
        assert_eq!(
            ledger.last_id_sql(),
            "SELECT id FROM \"Schema History\" ORDER BY id DESC LIMIT 1"
        );
        assert_eq!(
            ledger.insert_sql(),
            "INSERT INTO \"Schema History\" (id, name, sequence, executedAt) VALUES ($1, $2, $3, NOW())"
        );
    }

    #[tokio::test]
    async fn test_resume_index_on_empty_and_filled_ledger() {
        let store = crate::memory::MemoryStore::new();
        let mut session = store.session();
        let ledger = LedgerTable::default();

        ledger.ensure_table(&mut session).await.unwrap();
        ledger.ensure_table(&mut session).await.unwrap();
        assert_eq!(ledger.resume_index(&mut session).await.unwrap(), 1);

        let mut tx = session.begin_transaction().await.unwrap();
        ledger
            .record_step(tx.as_mut(), 1, &MigrationStep::new("v1", 1, "SELECT 1;"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ledger.resume_index(&mut session).await.unwrap(), 2);
        let records = ledger.applied_records(&mut session).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "v1");
    }

    #[tokio::test]
    async fn test_missing_ledger_lists_as_empty() {
        let store = crate::memory::MemoryStore::new();
        let mut session = store.session();
        let ledger = LedgerTable::new("never_created");

        assert!(ledger.applied_records(&mut session).await.unwrap().is_empty());
        assert!(!store.has_table(ledger.quoted()));

        store.fail_on("ORDER BY id");
        ledger.ensure_table(&mut session).await.unwrap();
        assert!(ledger.applied_records(&mut session).await.is_err());
    }
}
