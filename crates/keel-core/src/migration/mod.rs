//! Migration model shared by every backend.
//!
//! Steps, dialects and planning live here and never touch a database;
//! executing plans is the runtime crate's job.

mod dialect;
mod plan;
mod step;

pub use dialect::{DatabaseUrl, Dialect};
pub use plan::{plan_downgrade, plan_upgrade, Direction, MigrationPlan, PlannedStep};
pub use step::{
    load_steps_from_dir, split_sql_statements, split_statements, MigrationStep, StepSet, DOWN_MARKER,
};
