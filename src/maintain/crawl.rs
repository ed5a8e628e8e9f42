use super::schedule::{MaintCx, Schedule, StepOutcome};
use super::{Cursor, WorkCounter, QUEUE_HIGH_WATERMARK, SCHEDULE_BATCH};
use crate::dispatch::{ChecksumMode, CrawlTask, DispatchPolicy};
use crate::error::Result;
use crate::queues::{QueueClass, RootId};
use crate::storage::models::EntryKind;
use std::sync::atomic::Ordering;

pub(super) const FOLDER_KINDS: &[EntryKind] =
    &[EntryKind::Folder, EntryKind::CompressedFolder];
pub(super) const FILE_KINDS: &[EntryKind] = &[EntryKind::File, EntryKind::CompressedFile];

/// Roots currently admissible for crawl work: not disabled by an
/// inaccessible path and not saturated by per-root backpressure.
pub(super) fn eligible_roots(cx: &MaintCx<'_>) -> Result<Vec<RootId>> {
    let mut eligible = Vec::new();
    for root in cx.store.roots()? {
        if cx.engine.exclusions.is_excluded(root.id) {
            continue;
        }
        if cx.engine.queues.root_depth(root.id, QueueClass::Insertable) >= QUEUE_HIGH_WATERMARK {
            continue;
        }
        eligible.push(root.id);
    }
    Ok(eligible)
}

fn folder_policy(_cx: &MaintCx<'_>, _extension: &str) -> DispatchPolicy {
    DispatchPolicy::listing(ChecksumMode::Never)
}

fn archive_policy(_cx: &MaintCx<'_>, _extension: &str) -> DispatchPolicy {
    DispatchPolicy::listing(ChecksumMode::Opportunistic)
}

/// Plain files are revalidated in place; files whose extension is enabled
/// for archive traversal get listed so their contents enter the catalog.
fn file_policy(cx: &MaintCx<'_>, extension: &str) -> DispatchPolicy {
    if cx.engine.settings.archive_enabled(extension) {
        DispatchPolicy::listing(ChecksumMode::Opportunistic)
    } else {
        DispatchPolicy::touch_only(ChecksumMode::Opportunistic)
    }
}

/// One crawl-layer schedule: feeds Dirty entries of a kind class, root by
/// root, into the work queues. A step handles one root; a lap covers all
/// eligible roots.
pub(super) struct CrawlSchedule {
    name: &'static str,
    kinds: &'static [EntryKind],
    with_children: bool,
    policy_for: fn(&MaintCx<'_>, &str) -> DispatchPolicy,
    counter: WorkCounter,
    root_pos: usize,
}

impl CrawlSchedule {
    pub(super) fn folders_with_children(counter: WorkCounter) -> Self {
        CrawlSchedule {
            name: "folders-with-children",
            kinds: FOLDER_KINDS,
            with_children: true,
            policy_for: folder_policy,
            counter,
            root_pos: 0,
        }
    }

    pub(super) fn folders_without_children(counter: WorkCounter) -> Self {
        CrawlSchedule {
            name: "folders-without-children",
            kinds: FOLDER_KINDS,
            with_children: false,
            policy_for: folder_policy,
            counter,
            root_pos: 0,
        }
    }

    pub(super) fn files_with_children(counter: WorkCounter) -> Self {
        CrawlSchedule {
            name: "files-with-children",
            kinds: FILE_KINDS,
            with_children: true,
            policy_for: archive_policy,
            counter,
            root_pos: 0,
        }
    }

    pub(super) fn files_without_children(counter: WorkCounter) -> Self {
        CrawlSchedule {
            name: "files-without-children",
            kinds: FILE_KINDS,
            with_children: false,
            policy_for: file_policy,
            counter,
            root_pos: 0,
        }
    }
}

impl Schedule for CrawlSchedule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let roots = eligible_roots(cx)?;
        if self.root_pos >= roots.len() {
            self.root_pos = 0;
            return Ok(StepOutcome::EndOfLap);
        }
        let root = roots[self.root_pos];
        self.root_pos += 1;

        let rows = cx
            .store
            .dirty_entries(root, self.kinds, self.with_children, SCHEDULE_BATCH)?;
        for (entry_id, extension) in rows {
            let policy = (self.policy_for)(cx, &extension);
            cx.enqueue(root, CrawlTask::Reconcile { entry_id, policy })?;
            self.counter.fetch_add(1, Ordering::Relaxed);
            if cx.queue_limit_hit(QueueClass::Insertable) {
                return Ok(StepOutcome::Continue);
            }
        }

        if self.root_pos >= roots.len() {
            self.root_pos = 0;
            Ok(StepOutcome::EndOfLap)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

/// Cursor-resumable sweep over NoAccess folders, retrying access. The
/// cursor survives suspension; a completed sweep resets it to the start.
pub(super) struct NoAccessCrawlSchedule {
    name: &'static str,
    with_children: bool,
    cursor: Cursor,
    counter: WorkCounter,
}

impl NoAccessCrawlSchedule {
    pub(super) fn with_children(counter: WorkCounter) -> Self {
        NoAccessCrawlSchedule {
            name: "no-access-folders-with-children",
            with_children: true,
            cursor: Cursor::start(),
            counter,
        }
    }

    pub(super) fn without_children(counter: WorkCounter) -> Self {
        NoAccessCrawlSchedule {
            name: "no-access-folders-without-children",
            with_children: false,
            cursor: Cursor::start(),
            counter,
        }
    }
}

impl Schedule for NoAccessCrawlSchedule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let Some(after) = self.cursor.position() else {
            return Ok(StepOutcome::EndOfLap);
        };
        let rows =
            cx.store
                .noaccess_after(FOLDER_KINDS, self.with_children, after, SCHEDULE_BATCH)?;
        if rows.is_empty() {
            self.cursor.reset();
            return Ok(StepOutcome::EndOfLap);
        }
        for (entry_id, root, _extension) in rows {
            self.cursor.advance(entry_id);
            if cx.engine.exclusions.is_excluded(root) {
                continue;
            }
            cx.enqueue(
                root,
                CrawlTask::Reconcile {
                    entry_id,
                    policy: DispatchPolicy::listing(ChecksumMode::Never),
                },
            )?;
            self.counter.fetch_add(1, Ordering::Relaxed);
            if cx.queue_limit_hit(QueueClass::Insertable) {
                return Ok(StepOutcome::Continue);
            }
        }
        Ok(StepOutcome::Continue)
    }
}
