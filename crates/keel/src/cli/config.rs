use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use keel_core::config::{load_credentials, ConfigValue, DatabaseSettings};
use keel_core::EffectiveConfig;
use keel_runtime::ConfigTable;

/// Inspect the effective configuration.
#[derive(Parser)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the merged configuration.
    Show {
        /// Only this section.
        #[arg(short, long)]
        section: Option<String>,

        /// Annotate each key with the source that supplied it.
        #[arg(long)]
        origin: bool,

        /// Print as JSON.
        #[arg(long, conflicts_with = "origin")]
        json: bool,
    },

    /// Print one value.
    Get {
        section: String,
        key: String,

        /// Interpret the value as this type.
        #[arg(long = "as", value_enum, default_value = "str")]
        kind: ValueKind,

        /// Read keys missing from the files from the database config table.
        #[arg(long)]
        table: bool,
    },

    /// List the entries of the credentials file.
    Credentials {
        /// Credentials file (default: last `keel-accounts.cfg` in the config dirs).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ValueKind {
    Str,
    Int,
    Float,
    Bool,
    List,
}

impl ConfigCommand {
    pub async fn execute(self, config: &EffectiveConfig) -> Result<()> {
        match self.action {
            ConfigAction::Show {
                section,
                origin,
                json,
            } => {
                let sections: Vec<&str> = match &section {
                    Some(name) => {
                        if !config.has_section(name) {
                            anyhow::bail!("No such section: [{}]", name);
                        }
                        vec![name.as_str()]
                    }
                    None => config.sections(),
                };

                if json {
                    let tree: BTreeMap<&str, BTreeMap<&str, &str>> = sections
                        .iter()
                        .map(|s| (*s, config.items(s).into_iter().collect()))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&tree)?);
                    return Ok(());
                }

                for (idx, name) in sections.iter().enumerate() {
                    if idx > 0 {
                        println!();
                    }
                    println!("{}", style(format!("[{}]", name)).bold().cyan());
                    for (key, value) in config.items(name) {
                        let value = value.replace('\n', "\n    ");
                        if origin {
                            let source = config.origin(name, key).unwrap_or("DEFAULT");
                            println!("{} = {}  {}", key, value, style(format!("# {}", source)).dim());
                        } else {
                            println!("{} = {}", key, value);
                        }
                    }
                }
            }

            ConfigAction::Get {
                section,
                key,
                kind,
                table,
            } => {
                let raw = if table && !config.has_option(&section, &key) {
                    let database = DatabaseSettings::from_config(config)?;
                    ConfigTable::connect(&database)
                        .await?
                        .get(config, &section, &key)
                        .await?
                } else {
                    config.get(&section, &key)?.to_string()
                };
                println!("{}", render(&ConfigValue::new(raw), &section, &key, kind)?);
            }

            ConfigAction::Credentials { file } => {
                let credentials = load_credentials(file.as_deref())?;
                println!(
                    "{} {}",
                    style("Credentials from").dim(),
                    credentials.path().display()
                );
                for name in credentials.names() {
                    println!("  {}", name);
                }
            }
        }

        Ok(())
    }
}

fn render(value: &ConfigValue, section: &str, key: &str, kind: ValueKind) -> Result<String> {
    Ok(match kind {
        ValueKind::Str => value.to_string(),
        ValueKind::Int => value.as_int(section, key)?.to_string(),
        ValueKind::Float => value.as_float(section, key)?.to_string(),
        ValueKind::Bool => value.as_bool(section, key)?.to_string(),
        ValueKind::List => value.as_list(',').join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use keel_core::{KeyStore, Resolver};
    use std::collections::HashMap;

    fn config() -> EffectiveConfig {
        let store = KeyStore::parse_str("test.cfg", "[database]\npool_size = 20\n").unwrap();
        Resolver::with_env(HashMap::new()).merge([&store]).unwrap()
    }

    fn parse(args: &[&str]) -> ConfigCommand {
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Config(cmd) => cmd,
            _ => panic!("expected config command"),
        }
    }

    #[test]
    fn test_parse_show() {
        let cmd = parse(&["keel", "config", "show", "--section", "database", "--origin"]);
        assert!(matches!(
            cmd.action,
            ConfigAction::Show { section: Some(_), origin: true, json: false }
        ));
    }

    #[test]
    fn test_json_conflicts_with_origin() {
        assert!(Cli::try_parse_from(["keel", "config", "show", "--json", "--origin"]).is_err());
    }

    #[test]
    fn test_parse_get_as_int() {
        let cmd = parse(&["keel", "config", "get", "database", "pool_size", "--as", "int"]);
        assert!(matches!(cmd.action, ConfigAction::Get { kind: ValueKind::Int, .. }));
    }

    #[test]
    fn test_parse_get_from_table() {
        let cmd = parse(&["keel", "config", "get", "conveyor", "bulk", "--table"]);
        assert!(matches!(cmd.action, ConfigAction::Get { table: true, .. }));
    }

    #[test]
    fn test_render_kinds() {
        let value = ConfigValue::new("a, b");
        assert_eq!(render(&value, "s", "k", ValueKind::List).unwrap(), "a\nb");
        assert!(render(&value, "s", "k", ValueKind::Int).is_err());
        assert_eq!(render(&ConfigValue::new("on"), "s", "k", ValueKind::Bool).unwrap(), "true");
    }

    #[tokio::test]
    async fn test_get_missing_option_fails() {
        let cmd = parse(&["keel", "config", "get", "database", "missing"]);
        assert!(cmd.execute(&config()).await.is_err());
    }

    #[tokio::test]
    async fn test_show_unknown_section_fails() {
        let cmd = parse(&["keel", "config", "show", "--section", "nope"]);
        assert!(cmd.execute(&config()).await.is_err());
        let cmd = parse(&["keel", "config", "get", "database", "pool_size", "--as", "int"]);
        assert!(cmd.execute(&config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_credentials_listing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("accounts.cfg");
        std::fs::write(&path, r#"{"MOCK-POSIX": {"user": "rucio"}}"#).unwrap();

        let cmd = parse(&[
            "keel",
            "config",
            "credentials",
            "--file",
            path.to_str().unwrap(),
        ]);
        assert!(cmd.execute(&config()).await.is_ok());

        let cmd = parse(&["keel", "config", "credentials", "--file", "/nonexistent/accounts.cfg"]);
        assert!(cmd.execute(&config()).await.is_err());
    }
}
