//! Merging of key stores into one immutable effective configuration.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::debug;

use super::keystore::{KeyStore, Section};
use super::value::{parse_bool, ConfigValue};
use crate::error::{KeelError, Result};

/// Section whose keys act as fallbacks for every other section.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Environment variable forcing client (`1`) or server (`0`) mode.
pub const CLIENT_MODE_VAR: &str = "KEEL_CLIENT_MODE";

/// Nesting limit for `%(key)s` references.
const MAX_REFERENCE_DEPTH: usize = 10;

/// Matches `$$`, `${VAR}` and `${VAR:-fallback}`.
static PLACEHOLDER: Lazy<regex_lite::Regex> = Lazy::new(|| {
    regex_lite::Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("placeholder pattern is valid")
});

/// Merges key stores in precedence order.
///
/// Later stores override earlier ones per (section, key). `${VAR}`
/// placeholders are substituted from the resolver's environment while
/// merging; `%(key)s` references to other keys of the same section (or
/// `[DEFAULT]`) are expanded once every source is merged, and `%%` is a
/// literal `%`.
pub struct Resolver {
    env: HashMap<String, String>,
}

impl Resolver {
    /// A resolver reading placeholders from the process environment.
    pub fn new() -> Self {
        Self {
            env: std::env::vars().collect(),
        }
    }

    /// A resolver with an explicit environment.
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env }
    }

    /// Merge `sources`, lowest precedence first.
    pub fn merge<'a, I>(&self, sources: I) -> Result<EffectiveConfig>
    where
        I: IntoIterator<Item = &'a KeyStore>,
    {
        let mut merged = KeyStore::new("effective");
        let mut origins: HashMap<(String, String), String> = HashMap::new();

        for store in sources {
            debug!("Merging config source {}", store.name());
            for section in store.sections() {
                for (key, value) in section.iter() {
                    let resolved = self.interpolate(section.name(), key, value.as_str())?;
                    merged.set(section.name(), key, resolved)?;
                    origins.insert(
                        (section.name().to_string(), key.to_string()),
                        store.name().to_string(),
                    );
                }
            }
        }

        let mut expanded = Vec::new();
        for section in merged.sections() {
            for (key, value) in section.iter() {
                if value.as_str().contains('%') {
                    let text = expand_references(&merged, section.name(), key, value.as_str(), 1)?;
                    expanded.push((section.name().to_string(), key.to_string(), text));
                }
            }
        }
        for (section, key, text) in expanded {
            merged.set(&section, &key, text)?;
        }

        let client_mode = self
            .env
            .get(CLIENT_MODE_VAR)
            .map(|flag| parse_bool(flag).unwrap_or(!flag.is_empty()));

        merged.freeze();
        Ok(EffectiveConfig {
            inner: Arc::new(Inner {
                store: merged,
                origins,
                client_mode,
            }),
        })
    }

    fn interpolate(&self, section: &str, key: &str, raw: &str) -> Result<String> {
        if !raw.contains('$') {
            return Ok(raw.to_string());
        }

        let mut out = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(raw) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&raw[last..whole.start()]);
            last = whole.end();

            let Some(var) = caps.get(1) else {
                out.push('$');
                continue;
            };
            match (self.env.get(var.as_str()), caps.get(2)) {
                (Some(value), _) => out.push_str(value),
                (None, Some(fallback)) => out.push_str(fallback.as_str()),
                (None, None) => {
                    return Err(KeelError::UnresolvedReference {
                        section: section.to_string(),
                        key: key.to_string(),
                        variable: format!("${{{}}}", var.as_str()),
                    })
                }
            }
        }
        out.push_str(&raw[last..]);
        Ok(out)
    }
}

/// Expand `%(name)s` and `%%` in `raw`, the value of `[section] key`.
fn expand_references(
    store: &KeyStore,
    section: &str,
    key: &str,
    raw: &str,
    depth: usize,
) -> Result<String> {
    if depth > MAX_REFERENCE_DEPTH {
        return Err(KeelError::Validation(format!(
            "[{}] {}: references nested deeper than {} levels",
            section, key, MAX_REFERENCE_DEPTH
        )));
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        if let Some(after) = tail.strip_prefix('%') {
            out.push('%');
            rest = after;
            continue;
        }
        let Some((name, after)) = tail
            .strip_prefix('(')
            .and_then(|body| body.split_once(")s"))
        else {
            return Err(KeelError::Validation(format!(
                "[{}] {}: '%' must be followed by '%' or '(name)s', found {:?}",
                section, key, raw
            )));
        };
        let name = name.to_lowercase();
        let Some(target) = store
            .get(section, &name)
            .or_else(|| store.get(DEFAULT_SECTION, &name))
        else {
            return Err(KeelError::UnresolvedReference {
                section: section.to_string(),
                key: key.to_string(),
                variable: format!("%({})s", name),
            });
        };
        out.push_str(&expand_references(store, section, &name, target.as_str(), depth + 1)?);
        rest = after;
    }
    out.push_str(rest);
    Ok(out)
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    store: KeyStore,
    origins: HashMap<(String, String), String>,
    client_mode: Option<bool>,
}

/// The merged, frozen configuration of a process.
///
/// Cloning is cheap and clones share the same data, so one instance can be
/// handed to every consumer and across threads.
#[derive(Clone)]
pub struct EffectiveConfig {
    inner: Arc<Inner>,
}

impl EffectiveConfig {
    /// Raw value lookup, falling back to the `[DEFAULT]` section.
    pub fn value(&self, section: &str, key: &str) -> Option<&ConfigValue> {
        self.inner
            .store
            .get(section, key)
            .or_else(|| self.inner.store.get(DEFAULT_SECTION, key))
    }

    pub fn get(&self, section: &str, key: &str) -> Result<&str> {
        self.value(section, key)
            .map(|v| v.as_str())
            .ok_or_else(|| KeelError::missing(section, key))
    }

    pub fn get_opt(&self, section: &str, key: &str) -> Option<&str> {
        self.value(section, key).map(|v| v.as_str())
    }

    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get_opt(section, key).unwrap_or(default)
    }

    pub fn get_int(&self, section: &str, key: &str) -> Result<i64> {
        self.typed(section, key, ConfigValue::as_int)
    }

    pub fn get_float(&self, section: &str, key: &str) -> Result<f64> {
        self.typed(section, key, ConfigValue::as_float)
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Result<bool> {
        self.typed(section, key, ConfigValue::as_bool)
    }

    /// Comma separated list.
    pub fn get_list(&self, section: &str, key: &str) -> Result<Vec<String>> {
        self.value(section, key)
            .map(|v| v.as_list(','))
            .ok_or_else(|| KeelError::missing(section, key))
    }

    /// Typed lookup that treats a missing key as `None` but a malformed one as an error.
    pub fn get_int_opt(&self, section: &str, key: &str) -> Result<Option<i64>> {
        self.value(section, key)
            .map(|v| v.as_int(section, key))
            .transpose()
    }

    pub fn get_bool_opt(&self, section: &str, key: &str) -> Result<Option<bool>> {
        self.value(section, key)
            .map(|v| v.as_bool(section, key))
            .transpose()
    }

    pub fn has_section(&self, section: &str) -> bool {
        section != DEFAULT_SECTION && self.inner.store.section(section).is_some()
    }

    pub fn has_option(&self, section: &str, key: &str) -> bool {
        self.has_section(section) && self.value(section, key).is_some()
    }

    /// Section names, excluding `[DEFAULT]`.
    pub fn sections(&self) -> Vec<&str> {
        self.inner
            .store
            .sections()
            .map(Section::name)
            .filter(|name| *name != DEFAULT_SECTION)
            .collect()
    }

    pub fn section(&self, section: &str) -> Option<&Section> {
        self.inner.store.section(section)
    }

    pub fn options(&self, section: &str) -> Vec<&str> {
        self.items(section).into_iter().map(|(k, _)| k).collect()
    }

    /// Key/value pairs of a section, including inherited `[DEFAULT]` keys.
    pub fn items(&self, section: &str) -> Vec<(&str, &str)> {
        let mut items: Vec<(&str, &str)> = self
            .inner
            .store
            .section(section)
            .map(|s| s.iter().map(|(k, v)| (k, v.as_str())).collect())
            .unwrap_or_default();
        if section != DEFAULT_SECTION {
            if let Some(defaults) = self.inner.store.section(DEFAULT_SECTION) {
                for (k, v) in defaults.iter() {
                    if !items.iter().any(|(existing, _)| *existing == k) {
                        items.push((k, v.as_str()));
                    }
                }
            }
        }
        items
    }

    /// Name of the source that supplied a key.
    pub fn origin(&self, section: &str, key: &str) -> Option<&str> {
        self.inner
            .origins
            .get(&(section.to_string(), key.to_lowercase()))
            .map(String::as_str)
    }

    /// Whether this process runs as a client rather than a server.
    ///
    /// `KEEL_CLIENT_MODE` in the resolver's environment decides when set;
    /// otherwise a `[database]` section marks a server and a lone
    /// `[client]` section marks a client.
    pub fn is_client(&self) -> bool {
        if let Some(client) = self.inner.client_mode {
            return client;
        }
        !self.has_section("database") && self.has_section("client")
    }

    /// The underlying frozen store.
    pub fn store(&self) -> &KeyStore {
        &self.inner.store
    }

    pub fn to_ini_string(&self) -> String {
        self.inner.store.to_ini_string()
    }

    pub fn set(&self, section: &str, key: &str, _value: &str) -> Result<()> {
        Err(KeelError::ImmutableConfig(format!(
            "cannot set [{}] {}",
            section, key
        )))
    }

    pub fn remove_option(&self, section: &str, key: &str) -> Result<bool> {
        Err(KeelError::ImmutableConfig(format!(
            "cannot remove [{}] {}",
            section, key
        )))
    }

    pub fn add_section(&self, section: &str) -> Result<()> {
        Err(KeelError::ImmutableConfig(format!(
            "cannot add section [{}]",
            section
        )))
    }

    fn typed<T>(
        &self,
        section: &str,
        key: &str,
        convert: impl Fn(&ConfigValue, &str, &str) -> Result<T>,
    ) -> Result<T> {
        let value = self
            .value(section, key)
            .ok_or_else(|| KeelError::missing(section, key))?;
        convert(value, section, key)
    }
}

impl std::fmt::Debug for EffectiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectiveConfig")
            .field("sections", &self.sections())
            .finish()
    }
}
