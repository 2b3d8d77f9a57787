use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, Row};
use tracing::debug;

use keel_core::config::DatabaseSettings;
use keel_core::migration::{DatabaseUrl, Dialect};
use keel_core::{KeelError, Result};

use super::handle::DbHandle;

/// Database connection pool for the sqlx-backed dialects.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    url: DatabaseUrl,
    echo: bool,
}

impl Database {
    /// Create a connection pool from configuration.
    pub async fn from_settings(settings: &DatabaseSettings) -> Result<Self> {
        let url = DatabaseUrl::parse(&settings.url)?;
        if url.dialect() == Dialect::Oracle {
            return Err(KeelError::Backend(
                "no Oracle driver is linked into this build; render the plan as SQL instead".into(),
            ));
        }

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(settings.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(settings.pool_timeout_secs))
            .connect(&url.connect_url())
            .await
            .map_err(|e| KeelError::Backend(format!("Failed to connect to {}: {}", url, e)))?;

        debug!("Connected to {}", url);
        Ok(Self {
            pool,
            url,
            echo: settings.echo,
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    /// Check out one connection as a session handle.
    pub async fn acquire(&self) -> Result<SqlxHandle> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeelError::Backend(format!("Failed to acquire connection: {}", e)))?;
        Ok(SqlxHandle {
            conn,
            dialect: self.url.dialect(),
            echo: self.echo,
        })
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| KeelError::Backend(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A pooled sqlx connection held for the lifetime of a migration run.
pub struct SqlxHandle {
    conn: PoolConnection<Any>,
    dialect: Dialect,
    echo: bool,
}

impl SqlxHandle {
    async fn execute_on<'c>(
        conn: &'c mut AnyConnection,
        sql: &'c str,
        params: &'c [String],
    ) -> Result<u64> {
        let result = if params.is_empty() {
            sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = query.bind(param.clone());
            }
            query.execute(conn).await
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| KeelError::Backend(format!("Statement failed: {}", e)))
    }

    async fn fetch_on<'c>(
        conn: &'c mut AnyConnection,
        sql: &'c str,
        params: &'c [String],
    ) -> Result<Option<Vec<String>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.clone());
        }
        let row = query
            .fetch_optional(conn)
            .await
            .map_err(|e| KeelError::Backend(format!("Query failed: {}", e)))?;
        row.map(|row| row_to_text(&row)).transpose()
    }
}

impl DbHandle for SqlxHandle {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [String]) -> BoxFuture<'a, Result<u64>> {
        if self.echo {
            debug!(params = params.len(), "{}", sql);
        }
        let conn: &'a mut AnyConnection = &mut self.conn;
        Box::pin(Self::execute_on(conn, sql, params))
    }

    fn fetch_row<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [String],
    ) -> BoxFuture<'a, Result<Option<Vec<String>>>> {
        if self.echo {
            debug!(params = params.len(), "{}", sql);
        }
        let conn: &'a mut AnyConnection = &mut self.conn;
        Box::pin(Self::fetch_on(conn, sql, params))
    }
}

fn row_to_text(row: &AnyRow) -> Result<Vec<String>> {
    (0..row.len())
        .map(|idx| {
            row.try_get::<String, _>(idx)
                .map_err(|e| KeelError::Backend(format!("Column {} is not text: {}", idx, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_handle() -> SqlxHandle {
        let mut settings = DatabaseSettings::with_url("sqlite://");
        settings.pool_size = 1;
        let db = Database::from_settings(&settings).await.unwrap();
        db.acquire().await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_memory_round_trip() {
        let mut handle = memory_handle().await;
        assert_eq!(handle.dialect(), Dialect::Sqlite);

        handle
            .execute("CREATE TABLE accounts (name VARCHAR(64))", &[])
            .await
            .unwrap();
        let inserted = handle
            .execute(
                "INSERT INTO accounts (name) VALUES (?)",
                &["root".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let name = handle
            .fetch_text("SELECT name FROM accounts WHERE name = ?", &["root".to_string()])
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("root"));

        let missing = handle
            .fetch_text("SELECT name FROM accounts WHERE name = ?", &["jdoe".to_string()])
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_file_is_created_on_first_connect() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fresh.db");
        assert!(!path.exists());

        let settings = DatabaseSettings::with_url(format!("sqlite:///{}", path.display()));
        let db = Database::from_settings(&settings).await.unwrap();
        let mut handle = db.acquire().await.unwrap();

        let ledger = crate::ledger::Ledger::new("keel_version");
        let current = ledger.current_version(&mut handle, "dev").await.unwrap();
        assert!(current.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_oracle_has_no_driver() {
        let settings = DatabaseSettings::with_url("oracle+cx_oracle://rucio:pw@db/rucio");
        let err = Database::from_settings(&settings).await.err().unwrap();
        assert!(matches!(err, KeelError::Backend(_)));
    }

    #[tokio::test]
    async fn test_statement_failure_is_backend_error() {
        let mut handle = memory_handle().await;
        let err = handle.execute("SELECT * FROM missing_table", &[]).await.unwrap_err();
        assert!(matches!(err, KeelError::Backend(_)));
    }
}
