mod config;
mod migrate;

pub use config::ConfigCommand;
pub use migrate::MigrateCommand;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_core::config::LoggingSettings;
use keel_core::{load_config, KeelError};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Keel - layered configuration and schema migrations
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; repeat to layer files, later ones win.
    #[arg(short, long = "config", global = true)]
    pub config: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect the effective configuration.
    Config(ConfigCommand),

    /// Manage database migrations.
    Migrate(MigrateCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        // Tracing starts before any config file is read; `[common] loglevel`
        // replaces the filter once they are.
        let rust_log = std::env::var("RUST_LOG").ok();
        let filter = init_tracing(rust_log.as_deref().unwrap_or("info"));

        let config = load_config(self.config.as_slice())?;
        if rust_log.is_none() {
            if let Some(handle) = &filter {
                apply_log_level(handle, &LoggingSettings::from_config(&config));
            }
        }

        match self.command {
            Commands::Config(cmd) => cmd.execute(&config).await,
            Commands::Migrate(cmd) => cmd.execute(&config).await,
        }
    }
}

fn subscriber<W>(filter: EnvFilter, writer: W) -> (impl Subscriber + Send + Sync, FilterHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer));
    (subscriber, handle)
}

/// Install the global subscriber. `None` if one was already installed.
fn init_tracing(directive: &str) -> Option<FilterHandle> {
    let (subscriber, handle) = subscriber(EnvFilter::new(directive), std::io::stderr);
    subscriber.try_init().ok().map(|_| handle)
}

/// `RUST_LOG` wins over `[common] loglevel`.
fn apply_log_level(handle: &FilterHandle, logging: &LoggingSettings) {
    let filter = match EnvFilter::try_new(&logging.level) {
        Ok(filter) => filter,
        Err(e) => {
            tracing::warn!(level = %logging.level, "Ignoring invalid loglevel: {}", e);
            return;
        }
    };
    if let Err(e) = handle.reload(filter) {
        tracing::warn!("Failed to apply loglevel: {}", e);
    }
}

/// Process exit status for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<KeelError>() {
        Some(KeelError::DivergentHistory { .. }) => 2,
        Some(KeelError::ConcurrentMigration(_)) => 3,
        Some(KeelError::Backend(_)) | Some(KeelError::Timeout(_)) => 4,
        _ => 1,
    }
}
