mod credentials;
mod database;
mod keystore;
mod resolver;
mod value;

pub use credentials::{
    find_credentials_file, load_credentials, Credentials, CREDENTIALS_FILE_NAME,
};
pub use database::{DatabaseSettings, LoggingSettings, MigrationSettings, MIGRATION_SECTION};
pub use keystore::{ConfigSource, KeyStore, Section};
pub use resolver::{EffectiveConfig, Resolver, CLIENT_MODE_VAR, DEFAULT_SECTION};
pub use value::{ConfigValue, TypedValue};

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{KeelError, Result};

/// Prefix of environment variables that override config keys.
pub const ENV_PREFIX: &str = "KEEL_CFG_";

/// Default config file name looked up in the search directories.
pub const CONFIG_FILE_NAME: &str = "keel.cfg";

/// Load the effective configuration of a process.
///
/// Each path is loaded in order (later files override earlier ones), then
/// `KEEL_CFG_*` environment variables are layered on top. With no paths,
/// the config file is discovered with [`find_config_file`].
pub fn load_config<P: AsRef<Path>>(paths: &[P]) -> Result<EffectiveConfig> {
    let mut stores = Vec::with_capacity(paths.len() + 1);
    if paths.is_empty() {
        let path = find_config_file()?;
        stores.push(KeyStore::from_file(&path)?);
    } else {
        for path in paths {
            stores.push(KeyStore::from_file(path)?);
        }
    }
    stores.push(KeyStore::from_env(ENV_PREFIX, std::env::vars()));

    let config = Resolver::new().merge(&stores)?;
    info!(
        "Loaded configuration from {} source(s), {} section(s)",
        stores.len(),
        config.sections().len()
    );
    Ok(config)
}

/// Directories searched for the config file, in order:
/// `$KEEL_HOME/etc/`, `$VIRTUAL_ENV/etc/`, `$CONDA_PREFIX/etc/`, `/opt/keel/etc/`.
pub fn config_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = ["KEEL_HOME", "VIRTUAL_ENV", "CONDA_PREFIX"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(|root| PathBuf::from(root).join("etc"))
        .collect();
    dirs.push(PathBuf::from("/opt/keel/etc"));
    dirs
}

/// `$KEEL_CONFIG` when set, otherwise the first existing `keel.cfg` in [`config_dirs`].
pub fn find_config_file() -> Result<PathBuf> {
    if let Some(explicit) = std::env::var_os("KEEL_CONFIG") {
        return Ok(PathBuf::from(explicit));
    }
    find_in_dirs(&config_dirs())
}

fn find_in_dirs(dirs: &[PathBuf]) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = dirs.iter().map(|d| d.join(CONFIG_FILE_NAME)).collect();
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .ok_or(KeelError::ConfigNotFound {
            searched: candidates,
        })
}
