use super::models::EntryStatus;
use super::sqlite::Store;
use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::params;
use std::collections::VecDeque;

/// A buffered catalog mutation. Crawl-side code pushes these instead of
/// writing directly; the driver drains the buffer between scheduler steps,
/// which is what turns write volume into crawl backpressure.
#[derive(Debug, Clone)]
pub enum WriteOp {
    SetStatus {
        id: i64,
        status: EntryStatus,
    },
    /// SetStatus(Dirty) that is a no-op when the row is already Dirty.
    MarkDirty {
        id: i64,
    },
    UpdateMetadata {
        id: i64,
        size: i64,
        compressed_size: i64,
        modified: i64,
    },
    SetChecksum {
        id: i64,
        checksum: i64,
    },
    UpsertEquality {
        id1: i64,
        id2: i64,
        size: i64,
        checksum: i64,
        stamp: String,
    },
    TouchEquality {
        id1: i64,
        id2: i64,
        stamp: String,
    },
    DeleteEquality {
        id1: i64,
        id2: i64,
    },
    DeleteEqualityFor {
        id: i64,
    },
}

/// FIFO of pending writes with depth introspection. In-process only.
pub(crate) struct PendingWrites {
    queue: Mutex<VecDeque<WriteOp>>,
}

impl PendingWrites {
    pub(crate) fn new() -> Self {
        PendingWrites {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, op: WriteOp) {
        self.queue.lock().push_back(op);
    }

    pub(crate) fn pop(&self) -> Option<WriteOp> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn depth(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Store {
    pub(crate) fn apply_write(&self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::SetStatus { id, status } => {
                self.conn().execute(
                    "UPDATE catalog_entry SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id],
                )?;
            }
            WriteOp::MarkDirty { id } => {
                self.conn().execute(
                    "UPDATE catalog_entry SET status = 'dirty' \
                     WHERE id = ?1 AND status != 'dirty'",
                    params![id],
                )?;
            }
            WriteOp::UpdateMetadata {
                id,
                size,
                compressed_size,
                modified,
            } => {
                self.conn().execute(
                    "UPDATE catalog_entry SET size = ?1, compressed_size = ?2, modified = ?3 \
                     WHERE id = ?4",
                    params![size, compressed_size, modified, id],
                )?;
            }
            WriteOp::SetChecksum { id, checksum } => {
                self.conn().execute(
                    "UPDATE catalog_entry SET checksum = ?1 WHERE id = ?2",
                    params![checksum, id],
                )?;
            }
            WriteOp::UpsertEquality {
                id1,
                id2,
                size,
                checksum,
                stamp,
            } => {
                self.conn().execute(
                    "INSERT INTO equality_record (id1, id2, size, checksum, last_tested) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id1, id2) DO UPDATE SET \
                         size = excluded.size, \
                         checksum = excluded.checksum, \
                         last_tested = excluded.last_tested",
                    params![id1, id2, size, checksum, stamp],
                )?;
            }
            WriteOp::TouchEquality { id1, id2, stamp } => {
                self.conn().execute(
                    "UPDATE equality_record SET last_tested = ?1 \
                     WHERE id1 = ?2 AND id2 = ?3",
                    params![stamp, id1, id2],
                )?;
            }
            WriteOp::DeleteEquality { id1, id2 } => {
                self.conn().execute(
                    "DELETE FROM equality_record WHERE id1 = ?1 AND id2 = ?2",
                    params![id1, id2],
                )?;
            }
            WriteOp::DeleteEqualityFor { id } => {
                self.conn().execute(
                    "DELETE FROM equality_record WHERE id1 = ?1 OR id2 = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }
}
