pub mod migrations;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// All SQLite access serialized behind a single `Arc<Mutex<Connection>>`.
/// SQLite has no meaningful concurrent-writer story regardless of pool size,
/// so a single guarded connection is the honest model here.
pub type Db = Arc<Mutex<Connection>>;

pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating database directory")?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrations::migrate(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrations::migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Run `body` inside a single BEGIN IMMEDIATE / COMMIT unit, rolling back on
/// any error. Used for the delta-sync transaction.
pub async fn transaction<T>(
    db: &Db,
    body: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let conn = db.lock().await;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match body(&conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}
