use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use super::config_dirs;
use crate::error::{KeelError, Result};

/// Credentials file name looked up in the search directories.
pub const CREDENTIALS_FILE_NAME: &str = "keel-accounts.cfg";

/// Named credential entries from a JSON credentials file.
#[derive(Debug, Clone)]
pub struct Credentials {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl Credentials {
    /// Read and parse a credentials file. The top level must be an object.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let failed = |message: String| KeelError::Credentials {
            path: path.to_path_buf(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
        let entries = match serde_json::from_str::<Value>(&content).map_err(|e| failed(e.to_string()))? {
            Value::Object(entries) => entries,
            _ => return Err(failed("top level is not a JSON object".into())),
        };
        debug!("Loaded {} credential entries from {:?}", entries.len(), path);
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load credentials from `path`, or from [`find_credentials_file`].
pub fn load_credentials(path: Option<&Path>) -> Result<Credentials> {
    match path {
        Some(path) => Credentials::from_file(path),
        None => Credentials::from_file(find_credentials_file()?),
    }
}

/// The last existing `keel-accounts.cfg` in [`config_dirs`].
pub fn find_credentials_file() -> Result<PathBuf> {
    last_in_dirs(&config_dirs())
}

fn last_in_dirs(dirs: &[PathBuf]) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = dirs.iter().map(|d| d.join(CREDENTIALS_FILE_NAME)).collect();
    candidates
        .iter()
        .rev()
        .find(|p| p.exists())
        .cloned()
        .ok_or(KeelError::ConfigNotFound {
            searched: candidates,
        })
}
