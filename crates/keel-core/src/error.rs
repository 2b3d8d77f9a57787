use std::path::PathBuf;

use thiserror::Error;

/// Core error type for Keel operations.
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Parse error in {source_name} at line {line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("Type error: [{section}] {key} = {value:?} is not a valid {expected}")]
    Type {
        section: String,
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("Unresolved reference: [{section}] {key} refers to undefined {variable}")]
    UnresolvedReference {
        section: String,
        key: String,
        variable: String,
    },

    #[error("Configuration is immutable: {0}")]
    ImmutableConfig(String),

    #[error("Configuration file not found, searched: {}", format_paths(.searched))]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Missing option: [{section}] {key}")]
    MissingOption { section: String, key: String },

    #[error("Divergent history: schema '{schema}' is at version '{version}', which no known migration step produces")]
    DivergentHistory { schema: String, version: String },

    #[error("Concurrent migration: {0}")]
    ConcurrentMigration(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to load credentials from {}: {message}", .path.display())]
    Credentials { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelError {
    /// Build a parse error for a source line.
    pub fn parse(source_name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        KeelError::Parse {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn missing(section: impl Into<String>, key: impl Into<String>) -> Self {
        KeelError::MissingOption {
            section: section.into(),
            key: key.into(),
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using KeelError.
pub type Result<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message_carries_location() {
        let err = KeelError::parse("rucio.cfg", 12, "unterminated section header");
        assert_eq!(
            err.to_string(),
            "Parse error in rucio.cfg at line 12: unterminated section header"
        );
    }

    #[test]
    fn test_config_not_found_lists_paths() {
        let err = KeelError::ConfigNotFound {
            searched: vec![PathBuf::from("/a/keel.cfg"), PathBuf::from("/b/keel.cfg")],
        };
        assert!(err.to_string().contains("/a/keel.cfg, /b/keel.cfg"));
    }

    #[test]
    fn test_unresolved_reference_message() {
        let err = KeelError::UnresolvedReference {
            section: "database".into(),
            key: "default".into(),
            variable: "${DB_URL}".into(),
        };
        assert!(err.to_string().contains("${DB_URL}"));
    }
}
