/// Database abstraction layer
///
/// Checks, owners, results and alert state live in one LibSQL file. Callers
/// depend on the store traits so the engine can be driven by in-memory
/// doubles in tests.

pub mod migrations;
pub mod models;
pub mod repository;

pub use models::{AlertState, Owner};
pub use repository::{AlertStore, CheckStore, DatabaseImpl, ResultStore};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
