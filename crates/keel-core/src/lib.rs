pub mod config;
pub mod error;
pub mod migration;

pub use config::{load_config, EffectiveConfig, KeyStore, Resolver};
pub use error::{KeelError, Result};
pub use migration::{DatabaseUrl, Dialect, MigrationPlan, MigrationStep, StepSet};
