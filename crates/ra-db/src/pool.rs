//! r2d2 pools over the job store.
//!
//! Two flavors: [`open_store`] for the on-disk database the server and CLI
//! share, and [`init_memory_pool`] for tests, where one task writes job
//! progress while others poll the same record. Both hand back a pool whose
//! schema is already at [`migrations::latest_version`].

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use ra_core::{Error, Result};

use crate::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Applied to every on-disk connection. WAL lets the HTTP handlers read a
/// job while its pipeline task commits step updates.
const STORE_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;";

/// Applied to every in-memory connection. Shared-cache readers take table
/// locks unless reads are uncommitted, so pollers would otherwise see
/// `SQLITE_LOCKED` while a step update is in flight.
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
PRAGMA read_uncommitted = true;
PRAGMA busy_timeout = 5000;";

const STORE_POOL_SIZE: u32 = 8;
const MEMORY_POOL_SIZE: u32 = 4;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open (creating if needed) the job store at `path`.
///
/// Missing parent directories are created. Pending migrations run before
/// the pool is returned.
pub fn open_store(path: &Path) -> Result<DbPool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }

    let manager =
        SqliteConnectionManager::file(path).with_init(|conn| conn.execute_batch(STORE_PRAGMAS));
    let builder = Pool::builder()
        .max_size(STORE_POOL_SIZE)
        .connection_timeout(CHECKOUT_TIMEOUT);

    let pool = migrated(builder, manager)?;
    tracing::debug!(path = %path.display(), "Job store ready");
    Ok(pool)
}

/// A private in-memory job store.
///
/// Each call gets its own shared-cache database, so tests running in
/// parallel never see each other's jobs. The database lives as long as one
/// connection to it is open; the pool keeps every connection idle
/// indefinitely so it is never reaped between polls.
pub fn init_memory_pool() -> Result<DbPool> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_STORE: AtomicU64 = AtomicU64::new(0);

    let n = NEXT_STORE.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:ra_jobs_{}_{n}?mode=memory&cache=shared", std::process::id());

    let manager =
        SqliteConnectionManager::file(uri).with_init(|conn| conn.execute_batch(MEMORY_PRAGMAS));
    let builder = Pool::builder()
        .max_size(MEMORY_POOL_SIZE)
        .min_idle(Some(MEMORY_POOL_SIZE))
        .idle_timeout(None)
        .max_lifetime(None)
        .connection_timeout(CHECKOUT_TIMEOUT);

    migrated(builder, manager)
}

/// Build the pool and bring the schema up to date on its first connection.
fn migrated(
    builder: r2d2::Builder<SqliteConnectionManager>,
    manager: SqliteConnectionManager,
) -> Result<DbPool> {
    let pool = builder
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to open job store: {e}")))?;

    let conn = get_conn(&pool)?;
    let before = migrations::current_version(&conn)?;
    migrations::run_migrations(&conn)?;
    let after = migrations::current_version(&conn)?;
    if after != before {
        tracing::info!("Job store schema migrated from v{before} to v{after}");
    }

    Ok(pool)
}

pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("Failed to get connection from pool: {e}")))
}
