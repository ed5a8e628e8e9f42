mod stack;

pub use stack::{resolve_stack, StackView};

use crate::engine::CrawlEngine;
use crate::error::Result;
use crate::hasher;
use crate::listing::{CompressionStack, LiveNode};
use crate::queues::QueueClass;
use crate::sched::WorkerHandle;
use crate::storage::models::{extension_of, CatalogEntry, EntryKind, EntryStatus};
use crate::storage::{Store, WriteOp};
use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// How many believed-identical partners get an equality re-verification
/// task after one checksum computation.
pub const EQUALITY_MATCH_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Never,
    Opportunistic,
    Forced,
}

/// What a reconcile task is allowed to do. Passed explicitly with the
/// task, never read from dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub do_list: bool,
    pub checksum: ChecksumMode,
}

impl DispatchPolicy {
    pub fn listing(checksum: ChecksumMode) -> Self {
        DispatchPolicy {
            do_list: true,
            checksum,
        }
    }

    pub fn touch_only(checksum: ChecksumMode) -> Self {
        DispatchPolicy {
            do_list: false,
            checksum,
        }
    }
}

/// One unit of queued reconciliation work.
#[derive(Debug, Clone)]
pub enum CrawlTask {
    Reconcile {
        entry_id: i64,
        policy: DispatchPolicy,
    },
    InsertChild {
        parent_id: i64,
        node: LiveNode,
    },
    VerifyEquality {
        id1: i64,
        id2: i64,
    },
}

impl CrawlTask {
    /// Insert-capable tasks go on the insertable queue; everything else
    /// only mutates or deletes.
    pub fn class(&self) -> QueueClass {
        match self {
            CrawlTask::Reconcile { policy, .. } if policy.do_list => QueueClass::Insertable,
            CrawlTask::InsertChild { .. } => QueueClass::Insertable,
            _ => QueueClass::UpdateOnly,
        }
    }
}

/// How an entry currently looks in the live tree.
enum LiveView {
    Present {
        node: LiveNode,
        stack: Option<StackView>,
    },
    Missing,
    Unresolvable,
    Inaccessible(io::Error),
}

pub fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Classifies one catalog entry and carries out the resulting
/// reconciliation. All mutations happen here, inside a queued task whose
/// root ownership token is held by the calling worker.
pub struct Dispatcher<'a> {
    engine: &'a Arc<CrawlEngine>,
    store: &'a Store,
    worker: &'a WorkerHandle,
}

impl<'a> Dispatcher<'a> {
    pub fn new(engine: &'a Arc<CrawlEngine>, store: &'a Store, worker: &'a WorkerHandle) -> Self {
        Dispatcher {
            engine,
            store,
            worker,
        }
    }

    pub fn execute(&self, task: CrawlTask) -> Result<()> {
        self.worker.yield_point()?;
        match task {
            CrawlTask::Reconcile { entry_id, policy } => self.reconcile(entry_id, policy),
            CrawlTask::InsertChild { parent_id, node } => self.insert_child(parent_id, node),
            CrawlTask::VerifyEquality { id1, id2 } => self.verify_equality(id1, id2),
        }
    }

    // ── Reconcile ────────────────────────────────────────────────

    fn reconcile(&self, entry_id: i64, policy: DispatchPolicy) -> Result<()> {
        let Some(entry) = self.store.entry(entry_id)? else {
            // Row already orphanized by an earlier task.
            return Ok(());
        };

        let (node, stack) = match self.live_view(&entry)? {
            LiveView::Present { node, stack } => {
                // A previously disabled root that answers again rejoins
                // the crawl rotation.
                if entry.is_root() {
                    self.engine.exclusions.readmit(entry.id);
                }
                (node, stack)
            }
            LiveView::Missing => {
                if entry.is_root() {
                    self.mark_no_access(&entry, "root path missing");
                } else {
                    self.store.orphanize_subtree(entry.id)?;
                }
                return Ok(());
            }
            LiveView::Unresolvable => {
                self.store.orphanize_subtree(entry.id)?;
                return Ok(());
            }
            LiveView::Inaccessible(err) => {
                self.mark_no_access(&entry, &err.to_string());
                return Ok(());
            }
        };

        let mismatch = metadata_mismatch(&entry, &node);

        if policy.do_list {
            match self.list_live_children(&entry, stack.as_ref()) {
                Ok(live_children) => self.reconcile_children(&entry, live_children)?,
                Err(err) => {
                    self.mark_no_access(&entry, &err.to_string());
                    return Ok(());
                }
            }
        }

        let want_checksum = entry.kind.is_file_like()
            && match policy.checksum {
                ChecksumMode::Forced => true,
                ChecksumMode::Opportunistic => entry.checksum.is_none() || mismatch,
                ChecksumMode::Never => false,
            };

        if want_checksum {
            let checksum = match self.compute_checksum(&entry, stack.as_ref()) {
                Ok(checksum) => checksum,
                Err(err) => {
                    self.mark_no_access(&entry, &err.to_string());
                    return Ok(());
                }
            };
            self.store.push_write(WriteOp::UpdateMetadata {
                id: entry.id,
                size: node.size,
                compressed_size: node.compressed_size,
                modified: node.modified,
            });
            self.store.push_write(WriteOp::SetChecksum {
                id: entry.id,
                checksum,
            });
            self.store.push_write(WriteOp::SetStatus {
                id: entry.id,
                status: EntryStatus::Clean,
            });
            self.discover_equal_partners(&entry, node.size, checksum)?;
        } else if policy.checksum != ChecksumMode::Never {
            // Checksum already known and metadata unchanged: the row is
            // verified without a single content read.
            if entry.status != EntryStatus::Clean {
                self.store.push_write(WriteOp::SetStatus {
                    id: entry.id,
                    status: EntryStatus::Clean,
                });
            }
        } else if policy.do_list {
            if mismatch {
                self.store.push_write(WriteOp::UpdateMetadata {
                    id: entry.id,
                    size: node.size,
                    compressed_size: node.compressed_size,
                    modified: node.modified,
                });
            }
            if entry.status != EntryStatus::Clean {
                self.store.push_write(WriteOp::SetStatus {
                    id: entry.id,
                    status: EntryStatus::Clean,
                });
            }
        } else if mismatch && entry.status != EntryStatus::Dirty {
            self.store.push_write(WriteOp::MarkDirty { id: entry.id });
        }

        Ok(())
    }

    fn live_view(&self, entry: &CatalogEntry) -> Result<LiveView> {
        match entry.kind {
            EntryKind::Folder | EntryKind::File => {
                match self.engine.listing.probe(&entry.path) {
                    Ok(node) => Ok(LiveView::Present { node, stack: None }),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LiveView::Missing),
                    Err(err) => Ok(LiveView::Inaccessible(err)),
                }
            }
            EntryKind::CompressedFolder | EntryKind::CompressedFile => {
                let Some(view) = resolve_stack(self.store, entry)? else {
                    return Ok(LiveView::Unresolvable);
                };
                match self.engine.listing.probe_archive(&view.stack, &view.member) {
                    Ok(Some(node)) => Ok(LiveView::Present {
                        node,
                        stack: Some(view),
                    }),
                    Ok(None) => Ok(LiveView::Missing),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LiveView::Missing),
                    Err(err) => Ok(LiveView::Inaccessible(err)),
                }
            }
        }
    }

    fn list_live_children(
        &self,
        entry: &CatalogEntry,
        stack: Option<&StackView>,
    ) -> io::Result<Vec<LiveNode>> {
        match entry.kind {
            EntryKind::Folder => self.engine.listing.list_dir(&entry.path),
            EntryKind::File => {
                if !self.engine.settings.archive_enabled(&entry.extension) {
                    return Ok(Vec::new());
                }
                let stack = CompressionStack::new(entry.path.clone());
                self.engine.listing.list_archive(&stack, "")
            }
            EntryKind::CompressedFolder => match stack {
                Some(view) => self.engine.listing.list_archive(&view.stack, &view.member),
                None => Ok(Vec::new()),
            },
            EntryKind::CompressedFile => {
                if !self.engine.settings.archive_enabled(&entry.extension) {
                    return Ok(Vec::new());
                }
                match stack {
                    // The entry is itself a nested archive: descend one
                    // layer and list its root.
                    Some(view) => {
                        let inner = view.stack.descend(view.member.clone());
                        self.engine.listing.list_archive(&inner, "")
                    }
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Diff recorded children against the live set: new live children are
    /// turned into insert tasks, recorded children absent live are
    /// orphanized together with everything beneath them.
    fn reconcile_children(
        &self,
        entry: &CatalogEntry,
        live_children: Vec<LiveNode>,
    ) -> Result<()> {
        let recorded = self.store.children_of(entry.id)?;

        let live_names: HashSet<&str> =
            live_children.iter().map(|node| node.name.as_str()).collect();
        for child in &recorded {
            if !live_names.contains(child.name.as_str()) {
                self.store.orphanize_subtree(child.id)?;
            }
        }

        let recorded_names: HashSet<&str> =
            recorded.iter().map(|child| child.name.as_str()).collect();
        for node in live_children {
            if !recorded_names.contains(node.name.as_str()) {
                self.engine.enqueue(
                    entry.root_id,
                    CrawlTask::InsertChild {
                        parent_id: entry.id,
                        node,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn compute_checksum(&self, entry: &CatalogEntry, stack: Option<&StackView>) -> io::Result<i64> {
        let reader = match entry.kind {
            EntryKind::File => self.engine.listing.open_file(&entry.path)?,
            EntryKind::CompressedFile => match stack {
                Some(view) => self.engine.listing.open_member(&view.stack, &view.member)?,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "compression stack not resolved",
                    ))
                }
            },
            EntryKind::Folder | EntryKind::CompressedFolder => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "folders have no content checksum",
                ))
            }
        };
        Ok(hasher::as_checksum(hasher::hash_reader(reader)?))
    }

    /// Entries matching the freshly computed (size, checksum) pair become
    /// candidate duplicates; each pair gets a verification task on the
    /// update-only queue.
    fn discover_equal_partners(&self, entry: &CatalogEntry, size: i64, checksum: i64) -> Result<()> {
        let partners =
            self.store
                .files_matching(size, checksum, entry.id, EQUALITY_MATCH_LIMIT)?;
        for partner in partners {
            let (id1, id2) = if partner < entry.id {
                (partner, entry.id)
            } else {
                (entry.id, partner)
            };
            self.engine
                .enqueue(entry.root_id, CrawlTask::VerifyEquality { id1, id2 })?;
        }
        Ok(())
    }

    fn mark_no_access(&self, entry: &CatalogEntry, reason: &str) {
        debug!("Entry {} ({}) inaccessible: {}", entry.id, entry.path, reason);
        self.store.push_write(WriteOp::SetStatus {
            id: entry.id,
            status: EntryStatus::NoAccess,
        });
        if entry.is_root() {
            self.engine.exclusions.exclude(entry.id);
            self.engine.sink.notify(
                "Root disabled",
                &format!("root '{}' is inaccessible; descent disabled", entry.path),
            );
        }
    }

    // ── Insert ───────────────────────────────────────────────────

    fn insert_child(&self, parent_id: i64, node: LiveNode) -> Result<()> {
        let Some(parent) = self.store.entry(parent_id)? else {
            // Parent orphanized after this task was queued.
            return Ok(());
        };
        if self.store.child_by_name(parent_id, &node.name)?.is_some() {
            return Ok(());
        }
        let kind = child_kind(&parent, &node);
        let path = child_path(&parent, &node.name);
        let id = self.store.insert_child(
            parent_id,
            parent.root_id,
            kind,
            &path,
            &node.name,
            node.size,
            node.compressed_size,
            node.modified,
        )?;

        let descend = match kind {
            EntryKind::Folder | EntryKind::CompressedFolder => true,
            EntryKind::File | EntryKind::CompressedFile => self
                .engine
                .settings
                .archive_enabled(&extension_of(&node.name)),
        };
        if descend {
            self.engine.enqueue(
                parent.root_id,
                CrawlTask::Reconcile {
                    entry_id: id,
                    policy: DispatchPolicy::listing(ChecksumMode::Opportunistic),
                },
            )?;
        }
        Ok(())
    }

    // ── Equality ─────────────────────────────────────────────────

    /// Re-verify a believed-identical pair and insert/update/delete the
    /// equality record accordingly. Unreachable endpoints drop the record.
    fn verify_equality(&self, id1: i64, id2: i64) -> Result<()> {
        let existing = self.store.equality_record(id1, id2)?;
        let first = self.store.entry(id1)?;
        let second = self.store.entry(id2)?;

        let verified = match (&first, &second) {
            (Some(a), Some(b))
                if a.status != EntryStatus::NoAccess && b.status != EntryStatus::NoAccess =>
            {
                match (a.checksum, b.checksum) {
                    (Some(ca), Some(cb)) if ca == cb && a.size == b.size => Some((a.size, ca)),
                    _ => None,
                }
            }
            _ => None,
        };

        match (verified, existing) {
            (Some((size, checksum)), Some(record))
                if record.size == size && record.checksum == checksum =>
            {
                self.store.push_write(WriteOp::TouchEquality {
                    id1,
                    id2,
                    stamp: now_stamp(),
                });
            }
            (Some((size, checksum)), _) => {
                self.store.push_write(WriteOp::UpsertEquality {
                    id1,
                    id2,
                    size,
                    checksum,
                    stamp: now_stamp(),
                });
            }
            (None, Some(_)) => {
                self.store.push_write(WriteOp::DeleteEquality { id1, id2 });
            }
            (None, None) => {}
        }
        Ok(())
    }
}

fn metadata_mismatch(entry: &CatalogEntry, node: &LiveNode) -> bool {
    if entry.kind.is_folder_like() {
        node.modified != 0 && node.modified != entry.modified
    } else {
        node.size != entry.size || (node.modified != 0 && node.modified != entry.modified)
    }
}

fn child_kind(parent: &CatalogEntry, node: &LiveNode) -> EntryKind {
    match parent.kind {
        EntryKind::Folder => {
            if node.folder {
                EntryKind::Folder
            } else {
                EntryKind::File
            }
        }
        EntryKind::File | EntryKind::CompressedFolder | EntryKind::CompressedFile => {
            if node.folder {
                EntryKind::CompressedFolder
            } else {
                EntryKind::CompressedFile
            }
        }
    }
}

/// Logical child path: '/' within a tree level, with "!/" marking the
/// boundary into an archive's contents.
fn child_path(parent: &CatalogEntry, name: &str) -> String {
    if parent.kind.is_file_like() {
        format!("{}!/{}", parent.path, name)
    } else {
        format!("{}/{}", parent.path.trim_end_matches('/'), name)
    }
}
