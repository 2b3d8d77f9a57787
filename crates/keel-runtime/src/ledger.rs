//! The schema version ledger.
//!
//! One row per logical schema records the version the database is at. The
//! row lives in the target database itself so the version travels with the
//! data it describes.

use chrono::Utc;
use keel_core::migration::Dialect;
use keel_core::{KeelError, Result};
use serde::Serialize;
use tracing::debug;

use crate::db::DbHandle;

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub schema: String,
    pub version: String,
    pub step_id: String,
    pub applied_at: String,
}

/// New ledger contents after a step.
#[derive(Debug, Clone, Copy)]
pub struct LedgerTarget<'a> {
    pub version: &'a str,
    pub step_id: &'a str,
}

/// Reads and advances the version row of each schema.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether the ledger table exists yet.
    pub async fn exists(&self, handle: &mut dyn DbHandle) -> Result<bool> {
        let sql = exists_sql(handle.dialect());
        let found = handle.fetch_text(&sql, &[self.table.clone()]).await?;
        Ok(found.is_some())
    }

    /// Create the ledger table if it is missing.
    pub async fn ensure_table(&self, handle: &mut dyn DbHandle) -> Result<()> {
        if self.exists(handle).await? {
            return Ok(());
        }
        debug!(table = %self.table, "Creating ledger table");
        let sql = self.create_table_sql(handle.dialect());
        handle.execute(&sql, &[]).await.map_err(|e| {
            KeelError::Backend(format!("Failed to create ledger table: {}", e))
        })?;
        Ok(())
    }

    /// Version the schema is at; `None` when unmigrated or the table is absent.
    pub async fn current_version(
        &self,
        handle: &mut dyn DbHandle,
        schema: &str,
    ) -> Result<Option<String>> {
        Ok(self.entry(handle, schema).await?.map(|e| e.version))
    }

    /// Full ledger row for a schema.
    pub async fn entry(&self, handle: &mut dyn DbHandle, schema: &str) -> Result<Option<LedgerEntry>> {
        if !self.exists(handle).await? {
            return Ok(None);
        }
        let dialect = handle.dialect();
        let sql = format!(
            "SELECT version_num, step_id, applied_at FROM {} WHERE schema_name = {}",
            dialect.quote_identifier(&self.table),
            dialect.placeholder(1)
        );
        let row = handle.fetch_row(&sql, &[schema.to_string()]).await?;
        Ok(row.map(|mut columns| {
            columns.resize(3, String::new());
            let applied_at = columns.pop().unwrap_or_default();
            let step_id = columns.pop().unwrap_or_default();
            let version = columns.pop().unwrap_or_default();
            LedgerEntry {
                schema: schema.to_string(),
                version,
                step_id,
                applied_at,
            }
        }))
    }

    /// Move the schema from `expected` to `new` with compare-and-set.
    ///
    /// `new == None` removes the row (downgraded to base). If the row no
    /// longer holds `expected`, another runner got there first and this
    /// fails with [`KeelError::ConcurrentMigration`].
    pub async fn record_version(
        &self,
        handle: &mut dyn DbHandle,
        schema: &str,
        expected: Option<&str>,
        new: Option<LedgerTarget<'_>>,
    ) -> Result<()> {
        let dialect = handle.dialect();
        let table = dialect.quote_identifier(&self.table);
        let p = |n| dialect.placeholder(n);

        match (expected, new) {
            (None, None) => Ok(()),
            (None, Some(target)) => {
                if let Some(found) = self.current_version(handle, schema).await? {
                    return Err(moved(schema, None, &found));
                }
                let sql = format!(
                    "INSERT INTO {} (schema_name, version_num, step_id, applied_at) VALUES ({}, {}, {}, {})",
                    table,
                    p(1),
                    p(2),
                    p(3),
                    p(4)
                );
                let params = [
                    schema.to_string(),
                    target.version.to_string(),
                    target.step_id.to_string(),
                    Utc::now().to_rfc3339(),
                ];
                match handle.execute(&sql, &params).await {
                    Ok(_) => Ok(()),
                    // Postgres aborts the transaction here; classify without re-reading
                    Err(insert_err) if is_unique_violation(&insert_err) => {
                        Err(KeelError::ConcurrentMigration(format!(
                            "ledger for schema '{}' was created by another writer: {}",
                            schema, insert_err
                        )))
                    }
                    Err(insert_err) => match self.current_version(handle, schema).await {
                        Ok(Some(found)) => Err(moved(schema, None, &found)),
                        _ => Err(insert_err),
                    },
                }
            }
            (Some(expected), Some(target)) => {
                let sql = format!(
                    "UPDATE {} SET version_num = {}, step_id = {}, applied_at = {} WHERE schema_name = {} AND version_num = {}",
                    table,
                    p(1),
                    p(2),
                    p(3),
                    p(4),
                    p(5)
                );
                let params = [
                    target.version.to_string(),
                    target.step_id.to_string(),
                    Utc::now().to_rfc3339(),
                    schema.to_string(),
                    expected.to_string(),
                ];
                let affected = handle.execute(&sql, &params).await?;
                self.check_single_row(handle, schema, expected, affected).await
            }
            (Some(expected), None) => {
                let sql = format!(
                    "DELETE FROM {} WHERE schema_name = {} AND version_num = {}",
                    table,
                    p(1),
                    p(2)
                );
                let params = [schema.to_string(), expected.to_string()];
                let affected = handle.execute(&sql, &params).await?;
                self.check_single_row(handle, schema, expected, affected).await
            }
        }
    }

    async fn check_single_row(
        &self,
        handle: &mut dyn DbHandle,
        schema: &str,
        expected: &str,
        affected: u64,
    ) -> Result<()> {
        if affected == 1 {
            return Ok(());
        }
        let found = self.current_version(handle, schema).await?;
        Err(KeelError::ConcurrentMigration(format!(
            "ledger for schema '{}' expected version '{}' but found {}",
            schema,
            expected,
            found.map(|v| format!("'{}'", v)).unwrap_or_else(|| "none".into())
        )))
    }

    /// DDL creating the ledger table.
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let table = dialect.quote_identifier(&self.table);
        match dialect {
            Dialect::Oracle => format!(
                "CREATE TABLE {} (schema_name VARCHAR2(128) NOT NULL PRIMARY KEY, version_num VARCHAR2(64) NOT NULL, step_id VARCHAR2(255) NOT NULL, applied_at VARCHAR2(64) NOT NULL)",
                table
            ),
            _ => format!(
                "CREATE TABLE IF NOT EXISTS {} (schema_name VARCHAR(128) NOT NULL PRIMARY KEY, version_num VARCHAR(64) NOT NULL, step_id VARCHAR(255) NOT NULL, applied_at VARCHAR(64) NOT NULL)",
                table
            ),
        }
    }

    /// Ledger transition rendered with literals, for offline scripts.
    pub fn render_record(
        &self,
        dialect: Dialect,
        schema: &str,
        expected: Option<&str>,
        new: Option<LedgerTarget<'_>>,
        applied_at: &str,
    ) -> Option<String> {
        let table = dialect.quote_identifier(&self.table);
        let lit = |v: &str| dialect.quote_literal(v);
        match (expected, new) {
            (None, None) => None,
            (None, Some(target)) => Some(format!(
                "INSERT INTO {} (schema_name, version_num, step_id, applied_at) VALUES ({}, {}, {}, {})",
                table,
                lit(schema),
                lit(target.version),
                lit(target.step_id),
                lit(applied_at)
            )),
            (Some(expected), Some(target)) => Some(format!(
                "UPDATE {} SET version_num = {}, step_id = {}, applied_at = {} WHERE schema_name = {} AND version_num = {}",
                table,
                lit(target.version),
                lit(target.step_id),
                lit(applied_at),
                lit(schema),
                lit(expected)
            )),
            (Some(expected), None) => Some(format!(
                "DELETE FROM {} WHERE schema_name = {} AND version_num = {}",
                table,
                lit(schema),
                lit(expected)
            )),
        }
    }
}

fn exists_sql(dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => "SELECT 'present' FROM information_schema.tables WHERE table_name = $1 AND table_schema = current_schema()".into(),
        Dialect::MySql => "SELECT 'present' FROM information_schema.tables WHERE table_name = ? AND table_schema = DATABASE()".into(),
        Dialect::Sqlite => "SELECT 'present' FROM sqlite_master WHERE type = 'table' AND name = ?".into(),
        Dialect::Oracle => "SELECT 'present' FROM user_tables WHERE table_name = :1".into(),
    }
}

/// Whether a backend error reports a duplicate primary or unique key.
fn is_unique_violation(err: &KeelError) -> bool {
    let KeelError::Backend(message) = err else {
        return false;
    };
    let message = message.to_ascii_lowercase();
    message.contains("duplicate")
        || message.contains("unique constraint")
        || message.contains("ora-00001")
}

fn moved(schema: &str, expected: Option<&str>, found: &str) -> KeelError {
    KeelError::ConcurrentMigration(format!(
        "ledger for schema '{}' expected version {} but found '{}'",
        schema,
        expected.map(|v| format!("'{}'", v)).unwrap_or_else(|| "none".into()),
        found
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::MockDatabase;
    use keel_core::config::DatabaseSettings;
    use std::time::Duration;

    fn target<'a>(version: &'a str, step_id: &'a str) -> Option<LedgerTarget<'a>> {
        Some(LedgerTarget { version, step_id })
    }

    async fn sqlite_handle() -> crate::db::SqlxHandle {
        let mut settings = DatabaseSettings::with_url("sqlite://");
        settings.pool_size = 1;
        Database::from_settings(&settings)
            .await
            .unwrap()
            .acquire()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_table_reads_as_unmigrated() {
        let mut handle = sqlite_handle().await;
        let ledger = Ledger::new("keel_version");
        assert!(!ledger.exists(&mut handle).await.unwrap());
        assert_eq!(ledger.current_version(&mut handle, "dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_and_advance_on_sqlite() {
        let mut handle = sqlite_handle().await;
        let ledger = Ledger::new("keel_version");
        ledger.ensure_table(&mut handle).await.unwrap();
        ledger.ensure_table(&mut handle).await.unwrap();

        ledger
            .record_version(&mut handle, "dev", None, target("v1", "s1"))
            .await
            .unwrap();
        ledger
            .record_version(&mut handle, "dev", Some("v1"), target("v2", "s2"))
            .await
            .unwrap();

        let entry = ledger.entry(&mut handle, "dev").await.unwrap().unwrap();
        assert_eq!(entry.version, "v2");
        assert_eq!(entry.step_id, "s2");
        assert!(!entry.applied_at.is_empty());

        // Schemas sharing one database are independent
        assert_eq!(ledger.current_version(&mut handle, "prod").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_concurrent() {
        let mut handle = sqlite_handle().await;
        let ledger = Ledger::new("keel_version");
        ledger.ensure_table(&mut handle).await.unwrap();
        ledger
            .record_version(&mut handle, "dev", None, target("v2", "s2"))
            .await
            .unwrap();

        let err = ledger
            .record_version(&mut handle, "dev", Some("v1"), target("v3", "s3"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::ConcurrentMigration(_)));

        let err = ledger
            .record_version(&mut handle, "dev", None, target("v1", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::ConcurrentMigration(_)));

        assert_eq!(
            ledger.current_version(&mut handle, "dev").await.unwrap().as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_downgrade_to_base_removes_row() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut handle = db.handle();
        let ledger = Ledger::new("keel_version");
        ledger.ensure_table(&mut handle).await.unwrap();
        ledger
            .record_version(&mut handle, "dev", None, target("v1", "s1"))
            .await
            .unwrap();
        ledger
            .record_version(&mut handle, "dev", Some("v1"), None)
            .await
            .unwrap();
        assert_eq!(ledger.current_version(&mut handle, "dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_race_in_aborted_transaction_is_concurrent() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut handle = db.handle();
        let ledger = Ledger::new("keel_version");
        ledger.ensure_table(&mut handle).await.unwrap();

        // The other writer's row lands between the pre-read and the INSERT
        db.delay_on("INSERT INTO", Duration::from_millis(100));
        let other = db.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            other.set_ledger_version("dev", "v1", "keel_version");
        });

        handle.execute("BEGIN", &[]).await.unwrap();
        let err = ledger
            .record_version(&mut handle, "dev", None, target("v1", "s1"))
            .await
            .unwrap_err();
        writer.await.unwrap();

        assert!(matches!(err, KeelError::ConcurrentMigration(_)), "{err:?}");
        assert!(handle.execute("SELECT 1", &[]).await.is_err());
        handle.execute("ROLLBACK", &[]).await.unwrap();
    }

    #[test]
    fn test_unique_violation_messages() {
        for message in [
            "duplicate key value violates unique constraint \"keel_version_pkey\"",
            "Duplicate entry 'dev' for key 'PRIMARY'",
            "UNIQUE constraint failed: keel_version.schema_name",
            "ORA-00001: unique constraint (RUCIO.KEEL_VERSION_PK) violated",
        ] {
            assert!(is_unique_violation(&KeelError::Backend(message.into())), "{message}");
        }
        assert!(!is_unique_violation(&KeelError::Backend("connection reset".into())));
        assert!(!is_unique_violation(&KeelError::Validation("duplicate".into())));
    }

    #[test]
    fn test_render_record_quotes_literals() {
        let ledger = Ledger::new("keel_version");
        let sql = ledger
            .render_record(
                Dialect::Oracle,
                "dev",
                Some("v1"),
                target("v2", "s2_it's"),
                "2026-01-01T00:00:00Z",
            )
            .unwrap();
        assert!(sql.starts_with("UPDATE \"keel_version\" SET version_num = 'v2'"));
        assert!(sql.contains("'s2_it''s'"));
        assert!(ledger.render_record(Dialect::Oracle, "dev", None, None, "").is_none());
    }

    #[test]
    fn test_create_table_sql_per_dialect() {
        let ledger = Ledger::new("keel_version");
        assert!(ledger
            .create_table_sql(Dialect::Postgres)
            .starts_with("CREATE TABLE IF NOT EXISTS \"keel_version\""));
        assert!(ledger
            .create_table_sql(Dialect::MySql)
            .starts_with("CREATE TABLE IF NOT EXISTS `keel_version`"));
        assert!(ledger.create_table_sql(Dialect::Oracle).contains("VARCHAR2"));
    }
}
