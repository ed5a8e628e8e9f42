use super::schedule::{Cursor, MaintCx, Schedule, StepOutcome};
use super::SCHEDULE_BATCH;
use crate::dispatch::{ChecksumMode, CrawlTask, DispatchPolicy};
use crate::error::Result;
use crate::queues::QueueClass;
use crate::storage::WriteOp;

/// Checksum sweep, largest files first: opportunistic mode computes only
/// where the checksum is still unknown, so unchanged files cost nothing.
pub(super) struct ChecksumSweep;

impl Schedule for ChecksumSweep {
    fn name(&self) -> &'static str {
        "checksum-by-size"
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let rows = cx.store.files_missing_checksum_by_size(SCHEDULE_BATCH)?;
        let exhausted = rows.len() < SCHEDULE_BATCH;
        for (entry_id, root) in rows {
            cx.enqueue(
                root,
                CrawlTask::Reconcile {
                    entry_id,
                    policy: DispatchPolicy::touch_only(ChecksumMode::Opportunistic),
                },
            )?;
            if cx.queue_limit_hit(QueueClass::UpdateOnly) {
                return Ok(StepOutcome::Continue);
            }
        }
        if exhausted {
            Ok(StepOutcome::EndOfLap)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

/// Re-verify candidate duplicate pairs, oldest test first. Records whose
/// endpoints vanished entirely are dropped inline; everything else goes
/// through the dispatcher as update-only work.
pub(super) struct EqualitySweep;

impl Schedule for EqualitySweep {
    fn name(&self) -> &'static str {
        "equality-oldest-first"
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let records = cx.store.equality_oldest(SCHEDULE_BATCH)?;
        let exhausted = records.len() < SCHEDULE_BATCH;
        for record in records {
            let root = match cx.store.entry(record.id1)? {
                Some(entry) => Some(entry.root_id),
                None => cx.store.entry(record.id2)?.map(|entry| entry.root_id),
            };
            match root {
                Some(root) => {
                    cx.enqueue(
                        root,
                        CrawlTask::VerifyEquality {
                            id1: record.id1,
                            id2: record.id2,
                        },
                    )?;
                }
                None => {
                    cx.store.push_write(WriteOp::DeleteEquality {
                        id1: record.id1,
                        id2: record.id2,
                    });
                }
            }
            if cx.queue_limit_hit(QueueClass::UpdateOnly) {
                return Ok(StepOutcome::Continue);
            }
        }
        if exhausted {
            Ok(StepOutcome::EndOfLap)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

/// Cursor-resumable checksum retry restricted to NoAccess files; forced
/// mode recomputes once access is restored.
pub(super) struct NoAccessChecksumSweep {
    cursor: Cursor,
}

impl NoAccessChecksumSweep {
    pub(super) fn new() -> Self {
        NoAccessChecksumSweep {
            cursor: Cursor::start(),
        }
    }
}

impl Schedule for NoAccessChecksumSweep {
    fn name(&self) -> &'static str {
        "no-access-checksum"
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let Some(after) = self.cursor.position() else {
            return Ok(StepOutcome::EndOfLap);
        };
        let rows = cx.store.noaccess_files_after(after, SCHEDULE_BATCH)?;
        if rows.is_empty() {
            self.cursor.reset();
            return Ok(StepOutcome::EndOfLap);
        }
        for (entry_id, root) in rows {
            self.cursor.advance(entry_id);
            cx.enqueue(
                root,
                CrawlTask::Reconcile {
                    entry_id,
                    policy: DispatchPolicy::touch_only(ChecksumMode::Forced),
                },
            )?;
            if cx.queue_limit_hit(QueueClass::UpdateOnly) {
                return Ok(StepOutcome::Continue);
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Cursor-resumable metadata touch: cheap revalidation of every entry,
/// marking mismatches Dirty for the crawl layer to pick up.
pub(super) struct TouchSweep {
    cursor: Cursor,
}

impl TouchSweep {
    pub(super) fn new() -> Self {
        TouchSweep {
            cursor: Cursor::start(),
        }
    }

    #[cfg(test)]
    pub(super) fn at(position: i64) -> Self {
        TouchSweep {
            cursor: Cursor::At(position),
        }
    }

    #[cfg(test)]
    pub(super) fn cursor(&self) -> Cursor {
        self.cursor
    }
}

impl Schedule for TouchSweep {
    fn name(&self) -> &'static str {
        "metadata-touch"
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let Some(after) = self.cursor.position() else {
            return Ok(StepOutcome::EndOfLap);
        };
        let rows = cx.store.entries_after(after, SCHEDULE_BATCH)?;
        if rows.is_empty() {
            self.cursor.reset();
            return Ok(StepOutcome::EndOfLap);
        }
        for (entry_id, root) in rows {
            self.cursor.advance(entry_id);
            cx.enqueue(
                root,
                CrawlTask::Reconcile {
                    entry_id,
                    policy: DispatchPolicy::touch_only(ChecksumMode::Never),
                },
            )?;
            if cx.queue_limit_hit(QueueClass::UpdateOnly) {
                return Ok(StepOutcome::Continue);
            }
        }
        Ok(StepOutcome::Continue)
    }
}
