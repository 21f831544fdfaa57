mod files;
mod folders;
mod jobs;
mod providers;
mod queue_jobs;
mod upload_sessions;

pub use queue_jobs::EnqueueOutcome;
pub use upload_sessions::ChunkReceipt;

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
pub(crate) type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applied to every pooled connection on checkout
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        // busy_timeout first so the WAL switch waits on a locked file
        conn.batch_execute(
            "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// SQLite-backed metadata store. The source of truth for providers, the
/// virtual tree, upload sessions, jobs and the durable queue.
pub struct InventoryDb {
    pool: SqlitePool,
}

impl InventoryDb {
    /// Create or open the database inside `data_dir` (drivebase.db)
    pub fn new(data_dir: &Path) -> Result<Self> {
        Self::with_path(data_dir.join("drivebase.db"))
    }

    /// Create or open the database at a specific path and run pending migrations
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let database_url = path
            .to_str()
            .context("Database path is not valid UTF-8")?
            .to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(Duration::from_secs(10))
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .context("Failed to build SQLite connection pool")?;

        let db = InventoryDb { pool };
        db.run_migrations()?;

        tracing::info!(target: "inventory", path = %path.display(), "Inventory database ready");
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let mut pooled = self.connection()?;
        let conn: &mut SqliteConnection = &mut pooled;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
        if !applied.is_empty() {
            tracing::info!(target: "inventory", count = applied.len(), "Applied database migrations");
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .context("Failed to get database connection from pool")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::InventoryDb;
    use crate::inventory::StorageProviderRecord;
    use crate::utils::now_secs;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Fresh database in a temp dir. Keep the `TempDir` alive for the test.
    pub fn temp_db() -> (Arc<InventoryDb>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = InventoryDb::new(dir.path()).unwrap();
        (Arc::new(db), dir)
    }

    /// Provider row with an empty config, for tests that register their own factory
    pub fn provider_record(id: &str, workspace_id: &str, provider_type: &str) -> StorageProviderRecord {
        StorageProviderRecord {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            name: format!("{} provider", provider_type),
            provider_type: provider_type.to_string(),
            encrypted_config: String::new(),
            root_folder_id: None,
            quota_used: 0,
            quota_total: None,
            last_sync_at: None,
            is_active: true,
            created_at: now_secs(),
            updated_at: now_secs(),
        }
    }
}
