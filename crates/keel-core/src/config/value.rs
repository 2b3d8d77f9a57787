use serde::Serialize;

use crate::error::{KeelError, Result};

/// A raw configuration value with on-demand typed conversion.
///
/// Values are kept exactly as written in their source; conversion happens
/// at the accessor so a malformed value only fails the consumer that asks
/// for it with a specific type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    raw: String,
}

/// A scalar inferred from raw text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The value as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_int(&self, section: &str, key: &str) -> Result<i64> {
        self.raw
            .trim()
            .parse::<i64>()
            .map_err(|_| self.type_error(section, key, "integer"))
    }

    pub fn as_float(&self, section: &str, key: &str) -> Result<f64> {
        self.raw
            .trim()
            .parse::<f64>()
            .map_err(|_| self.type_error(section, key, "float"))
    }

    /// Accepts `true/yes/on/1` and `false/no/off/0`, ignoring case.
    pub fn as_bool(&self, section: &str, key: &str) -> Result<bool> {
        parse_bool(&self.raw).ok_or_else(|| self.type_error(section, key, "boolean"))
    }

    /// Split on `sep` and trim each item. A blank value is an empty list.
    pub fn as_list(&self, sep: char) -> Vec<String> {
        if self.raw.trim().is_empty() {
            return Vec::new();
        }
        self.raw
            .split(sep)
            .map(|item| item.trim().to_string())
            .collect()
    }

    /// Best-effort scalar: boolean words, then integer, then float.
    pub fn infer(&self) -> TypedValue {
        let lowered = self.raw.to_ascii_lowercase();
        match lowered.as_str() {
            "true" | "yes" | "on" => return TypedValue::Bool(true),
            "false" | "no" | "off" => return TypedValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = self.raw.parse::<i64>() {
            return TypedValue::Int(i);
        }
        if let Ok(f) = self.raw.parse::<f64>() {
            return TypedValue::Float(f);
        }
        TypedValue::Str(self.raw.clone())
    }

    fn type_error(&self, section: &str, key: &str, expected: &'static str) -> KeelError {
        KeelError::Type {
            section: section.to_string(),
            key: key.to_string(),
            expected,
            value: self.raw.clone(),
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for ConfigValue {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ConfigValue {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
