use super::models::*;
use super::sqlite::Store;
use crate::error::Result;
use rusqlite::{params, Row};
use tracing::debug;

/// Chunk size for `id IN (...)` lists, kept well under SQLite's bound
/// parameter limit.
const ID_CHUNK: usize = 500;

fn map_entry(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let kind_s: String = row.get(3)?;
    let status_s: String = row.get(4)?;
    let kind = EntryKind::parse(&kind_s).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("bad kind '{kind_s}'").into(),
        )
    })?;
    let status = EntryStatus::parse(&status_s).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad status '{status_s}'").into(),
        )
    })?;
    Ok(CatalogEntry {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        root_id: row.get(2)?,
        kind,
        status,
        size: row.get(5)?,
        compressed_size: row.get(6)?,
        checksum: row.get(7)?,
        path: row.get(8)?,
        name: row.get(9)?,
        extension: row.get(10)?,
        modified: row.get(11)?,
    })
}

const ENTRY_COLS: &str = "id, parent_id, root_id, kind, status, size, compressed_size, \
                          checksum, path, name, extension, modified";

fn kind_list(kinds: &[EntryKind]) -> String {
    kinds
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    // ── Roots ────────────────────────────────────────────────────

    /// Register a top-level subtree. Idempotent: an existing root row with
    /// the same path is returned as-is. A fresh root starts Dirty so the
    /// first crawl cycle descends into it.
    pub fn register_root(&self, path: &str) -> Result<i64> {
        let trimmed = path.trim_end_matches('/');
        let path = if trimmed.is_empty() { "/" } else { trimmed };
        if let Some(existing) = self.entry_by_path(path)? {
            if existing.is_root() {
                return Ok(existing.id);
            }
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO catalog_entry (parent_id, root_id, kind, status, path, name, extension) \
             VALUES (0, 0, 'folder', 'dirty', ?1, ?2, '')",
            params![path, name],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE catalog_entry SET root_id = ?1 WHERE id = ?1",
            params![id],
        )?;
        debug!("Registered root {} at {}", id, path);
        Ok(id)
    }

    pub fn roots(&self) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM catalog_entry WHERE parent_id = 0 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Entries ──────────────────────────────────────────────────

    pub fn entry(&self, id: i64) -> Result<Option<CatalogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM catalog_entry WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], map_entry)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn entry_by_path(&self, path: &str) -> Result<Option<CatalogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM catalog_entry WHERE path = ?1"
        ))?;
        let mut rows = stmt.query_map(params![path], map_entry)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn children_of(&self, parent_id: i64) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM catalog_entry WHERE parent_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![parent_id], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn child_by_name(&self, parent_id: i64, name: &str) -> Result<Option<CatalogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM catalog_entry WHERE parent_id = ?1 AND name = ?2"
        ))?;
        let mut rows = stmt.query_map(params![parent_id, name], map_entry)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn has_children(&self, id: i64) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM catalog_entry WHERE parent_id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count != 0)
    }

    /// Insert a newly discovered child row (status Dirty). Idempotent on
    /// path; returns the id of the row either way.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_child(
        &self,
        parent_id: i64,
        root_id: i64,
        kind: EntryKind,
        path: &str,
        name: &str,
        size: i64,
        compressed_size: i64,
        modified: i64,
    ) -> Result<i64> {
        let extension = extension_of(name);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO catalog_entry \
             (parent_id, root_id, kind, status, size, compressed_size, path, name, extension, modified) \
             VALUES (?1, ?2, ?3, 'dirty', ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(path) DO NOTHING",
            params![
                parent_id,
                root_id,
                kind.as_str(),
                size,
                compressed_size,
                path,
                name,
                extension,
                modified
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM catalog_entry WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn update_status(&self, id: i64, status: EntryStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE catalog_entry SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Remove an entry and everything recorded beneath it, along with the
    /// subtree's equality records and ancestry edges. Returns the number
    /// of catalog rows removed.
    pub fn orphanize_subtree(&self, id: i64) -> Result<usize> {
        let conn = self.conn();
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare_cached(
                "WITH RECURSIVE sub(id) AS ( \
                     SELECT id FROM catalog_entry WHERE id = ?1 \
                     UNION ALL \
                     SELECT e.id FROM catalog_entry e JOIN sub ON e.parent_id = sub.id \
                 ) SELECT id FROM sub",
            )?;
            let rows = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = conn.unchecked_transaction()?;
        for chunk in ids.chunks(ID_CHUNK) {
            let list = chunk
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute_batch(&format!(
                "DELETE FROM catalog_entry WHERE id IN ({list}); \
                 DELETE FROM equality_record WHERE id1 IN ({list}) OR id2 IN ({list}); \
                 DELETE FROM ancestry_edge WHERE upper IN ({list}) OR lower IN ({list});"
            ))?;
        }
        tx.commit()?;
        debug!("Orphanized subtree of {} ({} rows)", id, ids.len());
        Ok(ids.len())
    }

    /// Periodic full re-validation: push previously verified folders back
    /// into the crawl layer's view.
    pub fn force_clean_folders_dirty(&self) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE catalog_entry SET status = 'dirty' \
             WHERE status = 'clean' AND kind IN ('folder', 'compressed_folder')",
            [],
        )?;
        Ok(changed)
    }

    // ── Schedule queries ─────────────────────────────────────────

    /// Dirty entries of the given kinds in one root, split by whether they
    /// have recorded children. Returns (id, extension) pairs.
    pub fn dirty_entries(
        &self,
        root_id: i64,
        kinds: &[EntryKind],
        with_children: bool,
        limit: usize,
    ) -> Result<Vec<(i64, String)>> {
        let exists = if with_children { "EXISTS" } else { "NOT EXISTS" };
        let sql = format!(
            "SELECT e.id, e.extension FROM catalog_entry e \
             WHERE e.root_id = ?1 AND e.status = 'dirty' AND e.kind IN ({kinds}) \
               AND {exists} (SELECT 1 FROM catalog_entry c WHERE c.parent_id = e.id) \
             ORDER BY e.id LIMIT ?2",
            kinds = kind_list(kinds),
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![root_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Cursor query over NoAccess entries: `id > after ORDER BY id`.
    /// Returns (id, root_id, extension) triples.
    pub fn noaccess_after(
        &self,
        kinds: &[EntryKind],
        with_children: bool,
        after: i64,
        limit: usize,
    ) -> Result<Vec<(i64, i64, String)>> {
        let exists = if with_children { "EXISTS" } else { "NOT EXISTS" };
        let sql = format!(
            "SELECT e.id, e.root_id, e.extension FROM catalog_entry e \
             WHERE e.id > ?1 AND e.status = 'no_access' AND e.kind IN ({kinds}) \
               AND {exists} (SELECT 1 FROM catalog_entry c WHERE c.parent_id = e.id) \
             ORDER BY e.id LIMIT ?2",
            kinds = kind_list(kinds),
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Files still lacking a checksum, largest first. Returns
    /// (id, root_id) pairs.
    pub fn files_missing_checksum_by_size(&self, limit: usize) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, root_id FROM catalog_entry \
             WHERE kind IN ('file', 'compressed_file') AND checksum IS NULL \
               AND status != 'no_access' \
             ORDER BY size DESC, id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn noaccess_files_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, root_id FROM catalog_entry \
             WHERE id > ?1 AND kind IN ('file', 'compressed_file') AND status = 'no_access' \
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Cursor query for the metadata touch sweep, all kinds.
    pub fn entries_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, root_id FROM catalog_entry WHERE id > ?1 AND parent_id != 0 \
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Other file rows believed identical by size+checksum.
    pub fn files_matching(
        &self,
        size: i64,
        checksum: i64,
        exclude_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM catalog_entry \
             WHERE size = ?1 AND checksum = ?2 AND id != ?3 \
               AND kind IN ('file', 'compressed_file') \
             ORDER BY id LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![size, checksum, exclude_id, limit as i64], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Equality records ─────────────────────────────────────────

    pub fn equality_oldest(&self, limit: usize) -> Result<Vec<EqualityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id1, id2, size, checksum, last_tested FROM equality_record \
             ORDER BY last_tested ASC, id1, id2 LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EqualityRecord {
                    id1: row.get(0)?,
                    id2: row.get(1)?,
                    size: row.get(2)?,
                    checksum: row.get(3)?,
                    last_tested: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn equality_record(&self, id1: i64, id2: i64) -> Result<Option<EqualityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id1, id2, size, checksum, last_tested FROM equality_record \
             WHERE id1 = ?1 AND id2 = ?2",
        )?;
        let mut rows = stmt.query_map(params![id1, id2], |row| {
            Ok(EqualityRecord {
                id1: row.get(0)?,
                id2: row.get(1)?,
                size: row.get(2)?,
                checksum: row.get(3)?,
                last_tested: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// (pair count, wasted bytes) — each recorded pair wastes one copy.
    pub fn equality_summary(&self) -> Result<(i64, i64)> {
        let row = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM equality_record",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(row)
    }

    // ── Consistency passes ───────────────────────────────────────

    /// Insert missing (parent, child, 1) edges. Returns rows inserted.
    pub fn refresh_direct_ancestry(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO ancestry_edge (upper, lower, distance) \
             SELECT e.parent_id, e.id, 1 FROM catalog_entry e \
             WHERE e.parent_id > 0 \
               AND NOT EXISTS (SELECT 1 FROM ancestry_edge a \
                               WHERE a.upper = e.parent_id AND a.lower = e.id) \
             LIMIT ?1",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    /// Extend the transitive closure one join at a time. Returns rows
    /// inserted; zero means the closure is complete.
    pub fn refresh_transitive_ancestry(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO ancestry_edge (upper, lower, distance) \
             SELECT a.upper, b.lower, a.distance + b.distance \
             FROM ancestry_edge a JOIN ancestry_edge b ON a.lower = b.upper \
             WHERE NOT EXISTS (SELECT 1 FROM ancestry_edge c \
                               WHERE c.upper = a.upper AND c.lower = b.lower) \
             LIMIT ?1",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    /// Distinct extensions of archive parents that currently have recorded
    /// children. Used to find contents to unlist after an extension is
    /// disabled.
    pub fn archive_parent_extensions(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT e.extension FROM catalog_entry e \
             WHERE e.kind IN ('file', 'compressed_file') \
               AND EXISTS (SELECT 1 FROM catalog_entry c WHERE c.parent_id = e.id)",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Direct children of archive files with the given extension.
    pub fn archive_children_by_extension(&self, ext: &str, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT c.id FROM catalog_entry c \
             JOIN catalog_entry e ON c.parent_id = e.id \
             WHERE e.kind IN ('file', 'compressed_file') AND e.extension = ?1 \
             ORDER BY c.id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![ext, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete rows whose parent id no longer resolves. One batch per call;
    /// descendants become strays themselves and are removed on a later
    /// lap.
    pub fn orphanize_stray_children(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM catalog_entry WHERE rowid IN ( \
                 SELECT e.rowid FROM catalog_entry e \
                 WHERE e.parent_id > 0 \
                   AND NOT EXISTS (SELECT 1 FROM catalog_entry p WHERE p.id = e.parent_id) \
                 LIMIT ?1)",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    /// Rows for the denormalized-field pass: (id, path, name, extension).
    pub fn scan_denormalized(
        &self,
        after: i64,
        limit: usize,
    ) -> Result<Vec<(i64, String, String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, path, name, extension FROM catalog_entry \
             WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn fix_denormalized(&self, id: i64, name: &str, extension: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE catalog_entry SET name = ?1, extension = ?2 WHERE id = ?3",
            params![name, extension, id],
        )?;
        Ok(())
    }

    /// Recompute aggregate folder sizes from the ancestry closure. Only
    /// rows whose value actually changes are touched; returns that count.
    pub fn refresh_folder_sizes(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE catalog_entry SET size = ( \
                 SELECT COALESCE(SUM(f.size), 0) FROM ancestry_edge a \
                 JOIN catalog_entry f ON f.id = a.lower \
                 WHERE a.upper = catalog_entry.id AND f.kind IN ('file', 'compressed_file') \
             ) \
             WHERE id IN ( \
                 SELECT d.id FROM catalog_entry d \
                 WHERE d.kind IN ('folder', 'compressed_folder') \
                   AND d.size != ( \
                     SELECT COALESCE(SUM(f.size), 0) FROM ancestry_edge a \
                     JOIN catalog_entry f ON f.id = a.lower \
                     WHERE a.upper = d.id AND f.kind IN ('file', 'compressed_file')) \
                 LIMIT ?1)",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    pub fn purge_orphan_equality(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM equality_record WHERE rowid IN ( \
                 SELECT q.rowid FROM equality_record q \
                 WHERE NOT EXISTS (SELECT 1 FROM catalog_entry a WHERE a.id = q.id1) \
                    OR NOT EXISTS (SELECT 1 FROM catalog_entry b WHERE b.id = q.id2) \
                 LIMIT ?1)",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    pub fn purge_orphan_ancestry(&self, limit: usize) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM ancestry_edge WHERE rowid IN ( \
                 SELECT a.rowid FROM ancestry_edge a \
                 WHERE NOT EXISTS (SELECT 1 FROM catalog_entry u WHERE u.id = a.upper) \
                    OR NOT EXISTS (SELECT 1 FROM catalog_entry l WHERE l.id = a.lower) \
                 LIMIT ?1)",
            params![limit as i64],
        )?;
        Ok(changed)
    }

    // ── Status report ────────────────────────────────────────────

    pub fn status_summary(&self) -> Result<Vec<SummaryRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT kind, status, COUNT(*), COALESCE(SUM(size), 0) \
             FROM catalog_entry GROUP BY kind, status ORDER BY kind, status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let kind_s: String = row.get(0)?;
                let status_s: String = row.get(1)?;
                Ok((kind_s, status_s, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (kind_s, status_s, entries, bytes) in rows {
            out.push(SummaryRow {
                kind: EntryKind::parse(&kind_s)?,
                status: EntryStatus::parse(&status_s)?,
                entries,
                bytes,
            });
        }
        Ok(out)
    }
}
