//! Test doubles for running migrations without a database server.

mod mock;

pub use mock::{MockDatabase, MockHandle};
