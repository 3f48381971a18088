//! SQLite pool shared by the rule, history and settings stores.

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        metric TEXT NOT NULL,
        operator TEXT NOT NULL,
        threshold REAL NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        notify_sound INTEGER NOT NULL DEFAULT 1,
        trigger_count INTEGER NOT NULL DEFAULT 0,
        last_triggered INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS metrics_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        cpu_usage REAL,
        cpu_temp REAL,
        ram_usage REAL,
        ram_used_gb REAL,
        disk_usage REAL,
        disk_read_speed REAL,
        disk_write_speed REAL,
        net_upload REAL,
        net_download REAL,
        gpu_usage REAL,
        gpu_temp REAL
    );
    CREATE INDEX IF NOT EXISTS idx_history_timestamp ON metrics_history(timestamp);
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// Cheap to clone; every clone shares the same pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn connect<P: AsRef<Path>>(db_path: P) -> Result<Self, sqlx::Error> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db_url = format!("sqlite://{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!("[db] opened {}", path.display());
        Ok(db)
    }

    /// Private in-memory database. A single connection that never idles
    /// out, since each new sqlite memory connection starts empty.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!("[db] opened in-memory database");
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
