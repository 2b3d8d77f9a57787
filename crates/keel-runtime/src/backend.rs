//! Dialect-specific connection and DDL behavior.

use keel_core::config::DatabaseSettings;
use keel_core::migration::{split_statements, DatabaseUrl, Dialect, PlannedStep};
use keel_core::{KeelError, Result};
use tracing::{debug, info};

use crate::db::{Database, DbHandle};

/// The backend a migration targets, chosen once from the URL's dialect.
#[derive(Debug, Clone)]
pub enum BackendAdapter {
    Oracle(DatabaseUrl),
    Postgres(DatabaseUrl),
    MySql(DatabaseUrl),
    Sqlite(DatabaseUrl),
}

impl BackendAdapter {
    /// Select the adapter for a `<dialect>[+<driver>]://...` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let url = DatabaseUrl::parse(url)?;
        Ok(match url.dialect() {
            Dialect::Oracle => BackendAdapter::Oracle(url),
            Dialect::Postgres => BackendAdapter::Postgres(url),
            Dialect::MySql => BackendAdapter::MySql(url),
            Dialect::Sqlite => BackendAdapter::Sqlite(url),
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        match self {
            BackendAdapter::Oracle(url)
            | BackendAdapter::Postgres(url)
            | BackendAdapter::MySql(url)
            | BackendAdapter::Sqlite(url) => url,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.url().dialect()
    }

    /// Open a session on the target database.
    pub async fn connect(&self, settings: &DatabaseSettings) -> Result<Box<dyn DbHandle>> {
        if let BackendAdapter::Oracle(url) = self {
            return Err(KeelError::Backend(format!(
                "cannot connect to {}: no Oracle driver is linked into this build; use offline SQL rendering",
                url
            )));
        }
        let mut settings = settings.clone();
        settings.url = self.url().as_str().to_string();
        let db = Database::from_settings(&settings).await?;
        Ok(Box::new(db.acquire().await?))
    }

    pub fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    pub fn supports_transactional_ddl(&self) -> bool {
        self.dialect().supports_transactional_ddl()
    }

    /// Whether steps can be executed against this backend at all.
    pub fn can_apply(&self) -> bool {
        !matches!(self, BackendAdapter::Sqlite(_))
    }

    pub async fn begin_transaction(&self, handle: &mut dyn DbHandle) -> Result<()> {
        if let Some(begin) = self.dialect().begin_statement() {
            handle.execute(begin, &[]).await?;
        }
        Ok(())
    }

    pub async fn commit(&self, handle: &mut dyn DbHandle) -> Result<()> {
        handle.execute("COMMIT", &[]).await?;
        Ok(())
    }

    pub async fn rollback(&self, handle: &mut dyn DbHandle) -> Result<()> {
        handle.execute("ROLLBACK", &[]).await?;
        Ok(())
    }

    /// Execute one planned step's action, statement by statement.
    ///
    /// SQLite targets only validate plans; applying to them always fails
    /// before any statement runs.
    pub async fn apply_step(&self, handle: &mut dyn DbHandle, planned: &PlannedStep) -> Result<usize> {
        if !self.can_apply() {
            return Err(KeelError::UnsupportedOperation(format!(
                "cannot apply migration step '{}' to SQLite; SQLite targets are validation only",
                planned.step.id
            )));
        }

        let sql = planned.action()?;
        let statements = split_statements(sql, self.dialect());
        info!(
            step = %planned.step.id,
            direction = ?planned.direction,
            statements = statements.len(),
            "Applying migration step"
        );
        for statement in &statements {
            debug!("{}", statement);
            handle.execute(statement, &[]).await.map_err(|e| {
                KeelError::Backend(format!(
                    "Failed to apply migration step '{}': {}",
                    planned.step.id, e
                ))
            })?;
        }
        Ok(statements.len())
    }

    /// Take the single-writer lock for (url, schema) where the dialect has
    /// advisory locks. Returns `false` when another session holds it.
    /// Dialects without advisory locks rely on the ledger's compare-and-set.
    pub async fn try_lock(&self, handle: &mut dyn DbHandle, schema: &str) -> Result<bool> {
        let key = lock_key(self.url().as_str(), schema);
        let answer = match self {
            BackendAdapter::Postgres(_) => {
                let sql = format!(
                    "SELECT CASE WHEN pg_try_advisory_lock({}) THEN 'acquired' ELSE 'busy' END",
                    key
                );
                handle.fetch_text(&sql, &[]).await?
            }
            BackendAdapter::MySql(_) => {
                handle
                    .fetch_text(
                        "SELECT CASE WHEN GET_LOCK(?, 0) = 1 THEN 'acquired' ELSE 'busy' END",
                        &[mysql_lock_name(key)],
                    )
                    .await?
            }
            BackendAdapter::Oracle(_) | BackendAdapter::Sqlite(_) => return Ok(true),
        };
        debug!(key, ?answer, "Migration lock requested");
        Ok(answer.as_deref() == Some("acquired"))
    }

    pub async fn unlock(&self, handle: &mut dyn DbHandle, schema: &str) -> Result<()> {
        let key = lock_key(self.url().as_str(), schema);
        match self {
            BackendAdapter::Postgres(_) => {
                handle
                    .fetch_text(
                        &format!(
                            "SELECT CASE WHEN pg_advisory_unlock({}) THEN 'released' ELSE 'not held' END",
                            key
                        ),
                        &[],
                    )
                    .await?;
            }
            BackendAdapter::MySql(_) => {
                handle
                    .fetch_text(
                        "SELECT CASE WHEN RELEASE_LOCK(?) = 1 THEN 'released' ELSE 'not held' END",
                        &[mysql_lock_name(key)],
                    )
                    .await?;
            }
            BackendAdapter::Oracle(_) | BackendAdapter::Sqlite(_) => {}
        }
        debug!(key, "Migration lock released");
        Ok(())
    }
}

/// Stable 63-bit FNV-1a hash of (url, schema), usable as an advisory lock id.
pub fn lock_key(url: &str, schema: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in url.bytes().chain(std::iter::once(0)).chain(schema.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash >> 1) as i64
}

fn mysql_lock_name(key: i64) -> String {
    format!("keel_migration_{:x}", key)
}
