//! Database sessions.

mod handle;
mod pool;

pub use handle::DbHandle;
pub use pool::{Database, SqlxHandle};
