use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use serde::Serialize;

use keel_core::config::{DatabaseSettings, MigrationSettings, MIGRATION_SECTION};
use keel_core::migration::{load_steps_from_dir, plan_downgrade, plan_upgrade, MigrationPlan, StepSet};
use keel_core::{EffectiveConfig, KeelError};
use keel_runtime::{render_offline, BackendAdapter, Ledger, MigrationRunner, RunnerOptions};

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Migration scripts directory, overriding `script_location`.
    #[arg(short, long, global = true)]
    pub scripts: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Show the steps an upgrade would apply.
    Plan {
        /// Stop at this version or step id (default: latest).
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Apply pending steps.
    Up {
        /// Stop at this version or step id (default: latest).
        #[arg(short, long)]
        target: Option<String>,

        /// Print the SQL instead of connecting.
        #[arg(long)]
        sql: bool,

        /// Version the database is at, for `--sql` (default: unmigrated).
        #[arg(long, requires = "sql")]
        from: Option<String>,

        /// Per-step timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Revert the last N steps.
    Down {
        /// Number of steps to revert.
        #[arg(default_value = "1")]
        count: usize,

        /// Print the SQL instead of connecting.
        #[arg(long, requires = "from")]
        sql: bool,

        /// Version the database is at, for `--sql`.
        #[arg(long)]
        from: Option<String>,

        /// Per-step timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show applied and pending steps.
    Status,

    /// Print the current version.
    Current,
}

impl MigrateCommand {
    pub async fn execute(self, config: &EffectiveConfig) -> Result<()> {
        let settings = MigrationSettings::from_config(config)?;
        let scripts = match self.scripts.clone() {
            Some(dir) => dir,
            None => settings
                .script_location
                .as_ref()
                .map(PathBuf::from)
                .ok_or_else(|| KeelError::missing(MIGRATION_SECTION, "script_location"))?,
        };
        let steps = load_steps_from_dir(&scripts)?;

        match &self.action {
            MigrateAction::Up {
                target,
                sql: true,
                from,
                ..
            } => {
                let plan = plan_upgrade(
                    &steps,
                    &settings.version_table_schema,
                    from.as_deref(),
                    target.as_deref(),
                )?;
                return print_offline(&plan, &steps, &settings);
            }
            MigrateAction::Down {
                count,
                sql: true,
                from,
                ..
            } => {
                let plan = plan_downgrade(
                    &steps,
                    &settings.version_table_schema,
                    from.as_deref(),
                    *count,
                )?;
                return print_offline(&plan, &steps, &settings);
            }
            _ => {}
        }

        let database = if config.has_option("database", "default") {
            DatabaseSettings::from_config(config)?
        } else {
            DatabaseSettings::with_url(settings.url.clone())
        };
        let mut options = RunnerOptions::from_settings(&settings);
        if let MigrateAction::Up { timeout: Some(secs), .. }
        | MigrateAction::Down { timeout: Some(secs), .. } = &self.action
        {
            options.timeout = Some(Duration::from_secs(*secs));
        }

        let mut runner = MigrationRunner::connect(&settings, &database, steps)
            .await?
            .with_options(options);

        match self.action {
            MigrateAction::Plan { target } => {
                let plan = runner.plan(target.as_deref()).await?;
                if self.json {
                    return print_json(&plan);
                }
                header("Migration Plan");
                if plan.is_empty() {
                    println!("  {} Schema '{}' is up to date", style("ℹ").blue(), plan.schema);
                } else {
                    for planned in &plan.steps {
                        println!(
                            "    {} {} {}",
                            style("→").dim(),
                            style(&planned.step.id).yellow(),
                            style(format!(
                                "({} -> {})",
                                version_label(planned.from_version.as_deref()),
                                version_label(planned.to_version.as_deref())
                            ))
                            .dim()
                        );
                    }
                    println!();
                    println!("  {} {} step(s) pending", style("ℹ").blue(), plan.len());
                }
                println!();
            }

            MigrateAction::Up { target, .. } => {
                let plan = runner.plan(target.as_deref()).await?;
                run_plan(&mut runner, &plan, self.json).await?;
            }

            MigrateAction::Down { count, .. } => {
                if count == 0 {
                    println!("  {} Nothing to roll back (count=0)", style("ℹ").blue());
                    return Ok(());
                }
                let plan = runner.plan_downgrade(count).await?;
                run_plan(&mut runner, &plan, self.json).await?;
            }

            MigrateAction::Status => {
                let status = runner.status().await?;
                if self.json {
                    return print_json(&status);
                }
                header("Migration Status");

                if status.applied.is_empty() && status.pending.is_empty() {
                    println!("  {} No migration steps found", style("ℹ").blue());
                    return Ok(());
                }

                if !status.applied.is_empty() {
                    println!("  {} Applied:", style("✓").green());
                    for id in &status.applied {
                        println!("    {} {}", style("-").dim(), style(id).cyan());
                    }
                    if let Some(entry) = &status.current {
                        println!(
                            "    {} {} {}",
                            style("at").dim(),
                            style(&entry.version).bold(),
                            style(format!("({})", entry.applied_at)).dim()
                        );
                    }
                }

                if !status.pending.is_empty() {
                    if !status.applied.is_empty() {
                        println!();
                    }
                    println!("  {} Pending:", style("○").yellow());
                    for id in &status.pending {
                        println!("    {} {}", style("→").dim(), style(id).yellow());
                    }
                }

                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    status.applied.len(),
                    status.pending.len()
                );
                println!();
            }

            MigrateAction::Current => {
                let current = runner.current_version().await?;
                if self.json {
                    return print_json(&current);
                }
                println!("{}", version_label(current.as_deref()));
            }
        }

        Ok(())
    }
}

async fn run_plan(runner: &mut MigrationRunner, plan: &MigrationPlan, json: bool) -> Result<()> {
    let token = runner.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current step");
            token.cancel();
        }
    });

    let result = runner.run(plan).await;
    watcher.abort();
    let report = result?;

    if json {
        return print_json(&report);
    }

    header("Migrations");
    if report.applied.is_empty() && !report.cancelled {
        println!("  {} Schema '{}' is up to date", style("ℹ").blue(), report.schema);
    }
    for id in &report.applied {
        println!("  {} Applied: {}", style("✓").green(), id);
    }
    if report.cancelled {
        println!("  {} Cancelled before all steps ran", style("!").yellow());
    }
    println!();
    println!(
        "  {} Schema '{}' at {} ({} ms)",
        style("ℹ").blue(),
        report.schema,
        version_label(report.to_version.as_deref()),
        report.duration_ms
    );
    println!();
    Ok(())
}

fn print_offline(plan: &MigrationPlan, steps: &StepSet, settings: &MigrationSettings) -> Result<()> {
    let adapter = BackendAdapter::from_url(&settings.url)?;
    let ledger = Ledger::new(settings.version_table.clone());
    print!("{}", render_offline(plan, steps, &adapter, &ledger)?);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn header(title: &str) {
    println!();
    println!("  {}  {}", style("⚓").bold(), style(title).bold().cyan());
    println!();
}

fn version_label(version: Option<&str>) -> &str {
    version.unwrap_or("<base>")
}
