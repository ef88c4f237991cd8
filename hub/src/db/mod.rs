use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use thiserror::Error;
use time::OffsetDateTime;

pub mod models;

/// Schema migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_upload_sessions",
        include_str!("../../migrations/001_upload_sessions.sql"),
    ),
    (
        "002_task_queue",
        include_str!("../../migrations/002_task_queue.sql"),
    ),
    (
        "003_model_registry",
        include_str!("../../migrations/003_model_registry.sql"),
    ),
];

/// Milliseconds SQLite waits on a locked database before returning BUSY
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("Database configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(database_path: &str) -> Result<Self> {
        tracing::info!(path = %database_path, "Connecting to database");

        let is_memory = database_path == ":memory:" || database_path.contains("mode=memory");

        if !is_memory {
            if let Some(parent) = Path::new(database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DbError::Config(format!("Failed to create database directory: {}", e))
                    })?;
                }
            }
        }

        // In-memory databases share a cache so every pooled connection sees the same data
        let connection_string = if database_path == ":memory:" {
            "file::memory:?cache=shared"
        } else {
            database_path
        };

        let manager = SqliteConnectionManager::file(connection_string).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
            if !is_memory {
                conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            }
            Ok(())
        });

        let pool = Pool::builder().max_size(16).build(manager)?;

        tracing::info!("Database connected successfully");

        Ok(Self { pool })
    }

    /// Open the database at `path` and bring its schema up to date
    pub fn open(path: &Path) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| {
            DbError::Config(format!(
                "Invalid database path (contains invalid UTF-8): {}",
                path.display()
            ))
        })?;
        let db = Self::new(path_str)?;
        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    ///
    /// Applied migrations are recorded in `schema_migrations`, so calling this
    /// on an up-to-date database is a no-op.
    pub fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations");

        let mut conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;

        for (name, sql) in MIGRATIONS {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let applied: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE name = ?)",
                [name],
                |row| row.get(0),
            )?;
            if applied {
                continue;
            }

            tracing::info!(migration = %name, "Applying migration");
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)",
                rusqlite::params![name, now_ms()],
            )?;
            tx.commit()?;
        }

        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert stored unix milliseconds back into a timestamp
pub fn ms_to_datetime(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a unique in-memory database for testing
/// Each call returns a new isolated database
#[cfg(test)]
pub(crate) fn create_test_db() -> Database {
    let id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_name = format!("file:hubtestdb{}?mode=memory&cache=shared", id);
    let db = Database::new(&db_name).expect("Failed to create test database");
    db.migrate().expect("Failed to run migrations");
    db
}

/// File-backed database for tests with concurrent writers
///
/// Shared-cache memory databases fail fast on lock contention instead of
/// waiting out the busy timeout.
#[cfg(test)]
pub(crate) fn create_file_test_db() -> (Database, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(&dir.path().join("hub.db")).expect("Failed to open test database");
    (db, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_migrations() {
        let db = create_test_db();

        let conn = db.get_conn().expect("Failed to get connection");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("Failed to prepare statement");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("Failed to query tables")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("Failed to collect results");

        assert!(tables.contains(&"upload_sessions".to_string()));
        assert!(tables.contains(&"upload_chunks".to_string()));
        assert!(tables.contains(&"task_records".to_string()));
        assert!(tables.contains(&"task_events".to_string()));
        assert!(tables.contains(&"model_versions".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = create_test_db();
        db.migrate().expect("second migrate should be a no-op");

        let conn = db.get_conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = create_test_db();
        let conn = db.get_conn().expect("Failed to get connection");

        let result: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .expect("Failed to check foreign keys");

        assert_eq!(result, 1, "Foreign keys should be enabled");
    }

    #[test]
    fn test_file_database_uses_wal() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(&temp_dir.path().join("nested").join("hub.db"))
            .expect("Failed to open file database");
        let conn = db.get_conn().unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_ms_roundtrip() {
        let now = now_ms();
        let dt = ms_to_datetime(now);
        assert_eq!((dt.unix_timestamp_nanos() / 1_000_000) as i64, now);
    }
}
