use serde::Serialize;

use crate::error::{KeelError, Result};

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Oracle,
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Dialect from a URL scheme's dialect part (`postgresql`, `mysql`, ...).
    pub fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "oracle" => Ok(Dialect::Oracle),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(KeelError::UnsupportedOperation(format!(
                "unknown database dialect '{}'",
                other
            ))),
        }
    }

    /// Whether DDL statements take part in transactions.
    pub fn supports_transactional_ddl(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn quote_identifier(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    pub fn quote_literal(&self, value: &str) -> String {
        match self {
            Dialect::MySql => format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''")),
            _ => format!("'{}'", value.replace('\'', "''")),
        }
    }

    /// Bind placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Oracle => format!(":{}", n),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Statement opening a transaction, if the dialect needs one.
    pub fn begin_statement(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres | Dialect::Sqlite => Some("BEGIN"),
            Dialect::MySql => Some("START TRANSACTION"),
            // Oracle opens transactions implicitly
            Dialect::Oracle => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Oracle => "oracle",
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<dialect>[+<driver>]://...` connection URL.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    raw: String,
    dialect: Dialect,
    driver: Option<String>,
    rest: String,
}

impl DatabaseUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let Some((scheme, rest)) = url.split_once(':') else {
            return Err(KeelError::Validation(format!(
                "database URL has no scheme: {}",
                redact(url)
            )));
        };
        let (dialect, driver) = match scheme.split_once('+') {
            Some((dialect, driver)) => (dialect, Some(driver.to_string())),
            None => (scheme, None),
        };

        Ok(Self {
            raw: url.to_string(),
            dialect: Dialect::from_scheme(dialect)?,
            driver,
            rest: rest.to_string(),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Driver suffix, kept for display only.
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// URL in the form the connection layer expects, with the driver
    /// suffix dropped. `sqlite:////abs/path` (four slashes) becomes
    /// `sqlite:///abs/path`, and `sqlite://` an in-memory database.
    /// File databases open with `mode=rwc` so a missing file is created.
    pub fn connect_url(&self) -> String {
        match self.dialect {
            Dialect::Sqlite => {
                let path = self.rest.strip_prefix("//").unwrap_or(&self.rest);
                let path = path.strip_prefix('/').unwrap_or(path);
                if path.is_empty() || path == ":memory:" {
                    "sqlite::memory:".to_string()
                } else if path.contains('?') {
                    format!("sqlite://{}", path)
                } else {
                    format!("sqlite://{}?mode=rwc", path)
                }
            }
            Dialect::Postgres => format!("postgres:{}", self.rest),
            other => format!("{}:{}", other.as_str(), self.rest),
        }
    }

    /// URL with any password replaced by `***`.
    pub fn redacted(&self) -> String {
        redact(&self.raw)
    }
}

impl std::fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseUrl")
            .field("url", &self.redacted())
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl std::fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn redact(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let authority_start = scheme_end + 3;
    let authority_end = url[authority_start..]
        .find('/')
        .map(|i| authority_start + i)
        .unwrap_or(url.len());
    let authority = &url[authority_start..authority_end];
    let Some(at) = authority.rfind('@') else {
        return url.to_string();
    };
    let userinfo = &authority[..at];
    match userinfo.split_once(':') {
        Some((user, _)) => format!(
            "{}{}:***{}",
            &url[..authority_start],
            user,
            &url[authority_start + at..]
        ),
        None => url.to_string(),
    }
}
