//! Server-side configuration stored in the database.
//!
//! Keys missing from the config files are looked up in a `configs` table
//! (`section`, `opt`, `value`) when the process runs as a server. Values
//! read from the table are cached for a fixed time.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use keel_core::config::DatabaseSettings;
use keel_core::{EffectiveConfig, KeelError, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::BackendAdapter;
use crate::db::DbHandle;

/// Default name of the configuration table.
pub const DEFAULT_CONFIG_TABLE: &str = "configs";

/// Default lifetime of a cached table value.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(900);

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Fallback lookup of configuration keys in the database.
pub struct ConfigTable {
    handle: Mutex<Box<dyn DbHandle>>,
    table: String,
    expiration: Duration,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl ConfigTable {
    pub fn new(handle: Box<dyn DbHandle>) -> Self {
        Self {
            handle: Mutex::new(handle),
            table: DEFAULT_CONFIG_TABLE.to_string(),
            expiration: DEFAULT_EXPIRATION,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session on the configured database.
    pub async fn connect(database: &DatabaseSettings) -> Result<Self> {
        let adapter = BackendAdapter::from_url(&database.url)?;
        Ok(Self::new(adapter.connect(database).await?))
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Value of `[section] key`: the config files first, then the table.
    ///
    /// Clients never consult the table.
    pub async fn get(&self, config: &EffectiveConfig, section: &str, key: &str) -> Result<String> {
        if let Some(value) = config.get_opt(section, key) {
            return Ok(value.to_string());
        }
        if config.is_client() {
            return Err(KeelError::missing(section, key));
        }
        self.lookup(section, key)
            .await?
            .ok_or_else(|| KeelError::missing(section, key))
    }

    /// Like [`get`](Self::get), with `default` when the key is nowhere.
    /// Database errors still fail.
    pub async fn get_or(
        &self,
        config: &EffectiveConfig,
        section: &str,
        key: &str,
        default: &str,
    ) -> Result<String> {
        match self.get(config, section, key).await {
            Err(KeelError::MissingOption { .. }) => Ok(default.to_string()),
            other => other,
        }
    }

    /// Table value of `[section] key`, served from the cache while fresh.
    pub async fn lookup(&self, section: &str, key: &str) -> Result<Option<String>> {
        let cache_key = (section.to_string(), key.to_lowercase());
        if let Some(value) = self.cached(&cache_key) {
            return Ok(Some(value));
        }

        let value = {
            let mut handle = self.handle.lock().await;
            let dialect = handle.dialect();
            let sql = format!(
                "SELECT value FROM {} WHERE section = {} AND opt = {}",
                dialect.quote_identifier(&self.table),
                dialect.placeholder(1),
                dialect.placeholder(2)
            );
            handle
                .fetch_text(&sql, &[cache_key.0.clone(), cache_key.1.clone()])
                .await?
        };

        debug!(section, key, found = value.is_some(), "Read config table");
        if let Some(value) = &value {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(
                    cache_key,
                    CacheEntry {
                        value: value.clone(),
                        expires_at: Instant::now() + self.expiration,
                    },
                );
            }
        }
        Ok(value)
    }

    /// Drop one cached value.
    pub fn invalidate(&self, section: &str, key: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(section.to_string(), key.to_lowercase()));
        }
    }

    /// Drop every cached value.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<String> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(key)?;
        (Instant::now() < entry.expires_at).then(|| entry.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::MockDatabase;
    use keel_core::migration::Dialect;
    use keel_core::{KeyStore, Resolver};

    fn config(content: &str, env: &[(&str, &str)]) -> EffectiveConfig {
        let store = KeyStore::parse_str("server.cfg", content).unwrap();
        Resolver::with_env(env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            .merge([&store])
            .unwrap()
    }

    fn server() -> EffectiveConfig {
        config("[database]\ndefault = postgresql://u@h/db\n[conveyor]\nbulk = 100\n", &[])
    }

    #[tokio::test]
    async fn test_file_value_wins_over_table() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_config("conveyor", "bulk", "5");
        let table = ConfigTable::new(Box::new(db.handle()));

        assert_eq!(table.get(&server(), "conveyor", "bulk").await.unwrap(), "100");
        assert_eq!(db.config_reads(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_falls_back_to_table() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_config("conveyor", "poll_interval", "30");
        let table = ConfigTable::new(Box::new(db.handle()));
        let config = server();

        assert_eq!(table.get(&config, "conveyor", "poll_interval").await.unwrap(), "30");
        assert!(matches!(
            table.get(&config, "conveyor", "nowhere").await,
            Err(KeelError::MissingOption { .. })
        ));
        assert_eq!(table.get_or(&config, "conveyor", "nowhere", "7").await.unwrap(), "7");
    }

    #[tokio::test]
    async fn test_cached_until_expiry() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_config("conveyor", "poll_interval", "30");
        let table = ConfigTable::new(Box::new(db.handle())).with_expiration(Duration::from_millis(50));
        let config = server();

        table.get(&config, "conveyor", "poll_interval").await.unwrap();
        db.set_config("conveyor", "poll_interval", "60");
        assert_eq!(table.get(&config, "conveyor", "poll_interval").await.unwrap(), "30");
        assert_eq!(db.config_reads(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(table.get(&config, "conveyor", "poll_interval").await.unwrap(), "60");
        assert_eq!(db.config_reads(), 2);

        db.set_config("conveyor", "poll_interval", "90");
        table.invalidate("conveyor", "poll_interval");
        assert_eq!(table.get(&config, "conveyor", "poll_interval").await.unwrap(), "90");
        assert_eq!(db.config_reads(), 3);
    }

    #[tokio::test]
    async fn test_clients_never_read_table() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_config("client", "account", "root");
        let table = ConfigTable::new(Box::new(db.handle()));

        let client = config("[client]\nrucio_host = https://rucio\n", &[]);
        assert!(table.get(&client, "client", "account").await.is_err());

        let forced = config(
            "[database]\ndefault = postgresql://u@h/db\n",
            &[("KEEL_CLIENT_MODE", "1")],
        );
        assert!(table.get(&forced, "client", "account").await.is_err());
        assert_eq!(db.config_reads(), 0);
    }

    #[tokio::test]
    async fn test_database_error_propagates() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.fail_on("opt =");
        let table = ConfigTable::new(Box::new(db.handle()));
        let err = table.get_or(&server(), "conveyor", "x", "d").await.unwrap_err();
        assert!(matches!(err, KeelError::Backend(_)));
    }

    #[tokio::test]
    async fn test_reads_sqlite_table() {
        let mut settings = DatabaseSettings::with_url("sqlite://");
        settings.pool_size = 1;
        let db = Database::from_settings(&settings).await.unwrap();
        let mut handle = db.acquire().await.unwrap();
        handle
            .execute(
                "CREATE TABLE settings (section VARCHAR(128), opt VARCHAR(128), value VARCHAR(4000))",
                &[],
            )
            .await
            .unwrap();
        handle
            .execute(
                "INSERT INTO settings (section, opt, value) VALUES ('api', 'port', '443')",
                &[],
            )
            .await
            .unwrap();

        let table = ConfigTable::new(Box::new(handle)).with_table("settings");
        assert_eq!(table.lookup("api", "port").await.unwrap().as_deref(), Some("443"));
        assert_eq!(table.lookup("api", "host").await.unwrap(), None);
    }
}
