pub mod backend;
pub mod config_table;
pub mod db;
pub mod ledger;
pub mod offline;
pub mod runner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::BackendAdapter;
pub use config_table::ConfigTable;
pub use db::{Database, DbHandle};
pub use ledger::{Ledger, LedgerEntry};
pub use offline::render_offline;
pub use runner::{MigrationRunner, MigrationStatus, RunReport, RunnerOptions, RunnerState};
