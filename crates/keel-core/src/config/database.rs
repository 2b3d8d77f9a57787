use serde::Serialize;

use super::resolver::EffectiveConfig;
use crate::error::{KeelError, Result};

/// Database configuration, read from `[database]`.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSettings {
    /// Primary database connection URL.
    pub url: String,

    /// Logical schema name.
    pub schema: Option<String>,

    /// Connection pool size.
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    pub pool_timeout_secs: u64,

    /// Log every statement.
    pub echo: bool,
}

impl DatabaseSettings {
    pub fn from_config(config: &EffectiveConfig) -> Result<Self> {
        Ok(Self {
            url: config.get("database", "default")?.to_string(),
            schema: config.get_opt("database", "schema").map(str::to_string),
            pool_size: non_negative(config, "database", "pool_size")?.unwrap_or(default_pool_size()),
            pool_timeout_secs: non_negative(config, "database", "pool_timeout")?
                .map(u64::from)
                .unwrap_or(default_pool_timeout()),
            echo: config.get_bool_opt("database", "echo")?.unwrap_or(false),
        })
    }

    /// Settings for a bare URL, everything else defaulted.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: None,
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
            echo: false,
        }
    }
}

fn default_pool_size() -> u32 {
    5
}

fn default_pool_timeout() -> u64 {
    30
}

/// Migration tool configuration, read from `[alembic]`.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSettings {
    /// Target database URL.
    pub url: String,

    /// Ledger scope: the logical schema the version row belongs to.
    pub version_table_schema: String,

    /// Directory holding migration step files.
    pub script_location: Option<String>,

    /// Ledger table name.
    pub version_table: String,

    /// Commit each step on its own instead of the whole batch at once.
    pub transaction_per_migration: bool,

    /// Per-step timeout in seconds.
    pub timeout_secs: Option<u64>,
}

pub const MIGRATION_SECTION: &str = "alembic";

impl MigrationSettings {
    /// `sqlalchemy.url` falls back to `database.default`, and
    /// `version_table_schema` to `database.schema`, then `default`.
    pub fn from_config(config: &EffectiveConfig) -> Result<Self> {
        let section = MIGRATION_SECTION;
        let url = config
            .get_opt(section, "sqlalchemy.url")
            .or_else(|| config.get_opt("database", "default"))
            .ok_or_else(|| KeelError::missing(section, "sqlalchemy.url"))?
            .to_string();

        let version_table_schema = config
            .get_opt(section, "version_table_schema")
            .or_else(|| config.get_opt("database", "schema"))
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("default")
            .to_string();

        let version_table = config
            .get_opt(section, "version_table")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(default_version_table())
            .to_string();

        Ok(Self {
            url,
            version_table_schema,
            script_location: config.get_opt(section, "script_location").map(str::to_string),
            version_table,
            transaction_per_migration: config
                .get_bool_opt(section, "transaction_per_migration")?
                .unwrap_or(true),
            timeout_secs: non_negative(config, section, "timeout")?.map(u64::from),
        })
    }
}

fn default_version_table() -> &'static str {
    "keel_version"
}

/// Logging configuration, read from `[common]`.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingSettings {
    /// Default log filter when `RUST_LOG` is unset.
    pub level: String,
}

impl LoggingSettings {
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self {
            level: config.get_or("common", "loglevel", "info").to_lowercase(),
        }
    }
}

fn non_negative(config: &EffectiveConfig, section: &str, key: &str) -> Result<Option<u32>> {
    match config.get_int_opt(section, key)? {
        None => Ok(None),
        Some(v) => u32::try_from(v).map(Some).map_err(|_| KeelError::Type {
            section: section.to_string(),
            key: key.to_string(),
            expected: "non-negative integer",
            value: v.to_string(),
        }),
    }
}
