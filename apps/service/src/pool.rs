use anyhow::Result;
use deadpool::managed::{self, Pool, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Milliseconds SQLite waits on a locked database before failing a statement
const BUSY_TIMEOUT_MS: u32 = 5_000;

pub struct LibsqlManager {
    database: Database,
    created: AtomicUsize,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database, created: AtomicUsize::new(0) }
    }

    /// Number of connections opened over the manager's lifetime
    pub fn connections_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // Writers from several pooled connections share one file
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ()).await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        conn.query("SELECT 1", ()).await?.next().await?.ok_or(LibsqlError::QueryReturnedNoRows)?;
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open (or create) the local database file and wrap it in a pool
pub async fn open_pool(path: impl AsRef<Path>, max_size: usize) -> Result<LibsqlPool> {
    let database = libsql::Builder::new_local(path.as_ref()).build().await?;
    let pool = Pool::builder(LibsqlManager::new(database)).max_size(max_size.max(1)).build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pool_hands_out_working_connections() -> Result<()> {
        let dir = tempdir()?;
        let pool = open_pool(dir.path().join("pool.db"), 2).await?;

        let conn = pool.get().await?;
        let mut rows = conn.query("SELECT 41 + 1", ()).await?;
        let row = rows.next().await?.expect("one row");
        assert_eq!(row.get::<i64>(0)?, 42);
        drop(conn);

        // Returned connection is recycled rather than reopened
        let _conn = pool.get().await?;
        assert_eq!(pool.manager().connections_created(), 1);
        Ok(())
    }
}
