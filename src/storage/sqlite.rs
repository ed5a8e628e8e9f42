use super::pending::{PendingWrites, WriteOp};
use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::debug;

/// The shared catalog store. The engine guarantees that at most one worker
/// calls in at a time (the cooperative execution token); the mutex exists
/// to satisfy the type system, not to provide concurrency.
pub struct Store {
    conn: Mutex<Connection>,
    pending: PendingWrites,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Store {
            conn: Mutex::new(conn),
            pending: PendingWrites::new(),
        };
        store.configure_pragmas()?;
        store.migrate_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Mutex::new(conn),
            pending: PendingWrites::new(),
        };
        store.configure_pragmas()?;
        store.migrate_schema()?;
        Ok(store)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn().execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 64MB cache)");
        Ok(())
    }

    /// Check schema version and migrate if needed.
    /// Version < 1: first open, create everything.
    fn migrate_schema(&self) -> Result<()> {
        let conn = self.conn();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            conn.execute_batch(include_str!("schema.sql"))?;
            conn.execute_batch("PRAGMA user_version = 1;")?;
            debug!("SQLite schema initialized (version 1)");
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run a closure against the raw connection. Test and tooling escape
    /// hatch; engine code goes through the typed queries.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        f(&self.conn())
    }

    pub fn truncate_all(&self) -> Result<()> {
        self.conn().execute_batch(
            "DELETE FROM equality_record;
             DELETE FROM ancestry_edge;
             DELETE FROM catalog_entry;",
        )?;
        debug!("All tables truncated");
        Ok(())
    }

    /// Memory-pressure hint, issued when the driver enters an idle-wait.
    pub fn release_memory(&self) -> Result<()> {
        self.conn().execute_batch("PRAGMA shrink_memory;")?;
        Ok(())
    }

    // ── Pending-write buffer ─────────────────────────────────────

    pub fn push_write(&self, op: WriteOp) {
        self.pending.push(op);
    }

    pub fn pending_depth(&self) -> usize {
        self.pending.depth()
    }

    /// Apply the oldest buffered write, if any. Returns whether one was
    /// applied.
    pub fn drain_one(&self) -> Result<bool> {
        match self.pending.pop() {
            Some(op) => {
                self.apply_write(op)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn drain_some(&self, limit: usize) -> Result<usize> {
        let mut applied = 0;
        while applied < limit && self.drain_one()? {
            applied += 1;
        }
        Ok(applied)
    }

    pub fn drain_for(&self, budget: std::time::Duration) -> Result<usize> {
        let deadline = std::time::Instant::now() + budget;
        let mut applied = 0;
        while std::time::Instant::now() < deadline && self.drain_one()? {
            applied += 1;
        }
        Ok(applied)
    }
}
