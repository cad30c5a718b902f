mod schema;
pub mod assets;
pub mod cache;
pub mod journal;
pub mod locks;
pub mod scans;
pub mod similarity;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

pub use assets::{AssetMetadataRecord, AssetRecord, CatalogStats, HashState, MetadataWrite};
pub use cache::{CacheEntry, CacheMaintenance, CleanupStats};
pub use locks::AssetLocks;
pub use schema::{MIGRATIONS, SCHEMA};
pub use similarity::{DuplicateMember, ExactDuplicateGroup, NearDuplicatePair};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ASSET_LOCK_STRIPES: usize = 64;

/// Largest number of bound parameters placed in one `IN (...)` list.
pub(crate) const MAX_IN_PARAMS: usize = 500;

/// Shared handle to the catalog store.
///
/// Every component reaches SQLite through this type. Blocking work runs on
/// the caller's thread via [`Database::with_conn`] or on the blocking pool
/// via [`Database::call`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<AssetLocks>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: Arc::new(AssetLocks::new(ASSET_LOCK_STRIPES)),
            path,
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            for migration in MIGRATIONS {
                let _ = conn.execute(migration, []);
            }
            Ok(())
        })
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.with_conn(|conn| Ok(conn.busy_timeout(timeout)?))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Per-asset advisory locks shared by the scan and enrichment writers.
    pub fn locks(&self) -> Arc<AssetLocks> {
        Arc::clone(&self.locks)
    }

    /// Run `f` with exclusive access to the connection on the current thread.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut conn)
    }

    /// Run `f` against the connection on tokio's blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f)).await?
    }
}

/// `?, ?, ?` for an `IN (...)` clause of `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

/// Current time as unix seconds, the unit used by the journal and cache.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current time as the RFC 3339 string stored in asset rows.
pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}
