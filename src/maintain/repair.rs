use super::schedule::{MaintCx, Schedule, StepOutcome};
use super::{REPAIR_BATCH, REPAIR_LAP_REPEAT_LIMIT};
use crate::error::Result;
use crate::storage::models::extension_of;
use tracing::debug;

/// The consistency passes run directly against the store, never through
/// the worker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RepairPass {
    DirectAncestry,
    TransitiveAncestry,
    UnlistDisabled,
    OrphanizeStrays,
    Denormalized,
    FolderSizes,
    PurgeEquality,
    PurgeAncestry,
}

impl RepairPass {
    fn name(self) -> &'static str {
        match self {
            RepairPass::DirectAncestry => "ancestry-direct",
            RepairPass::TransitiveAncestry => "ancestry-transitive",
            RepairPass::UnlistDisabled => "unlist-disabled-extensions",
            RepairPass::OrphanizeStrays => "orphanize-strays",
            RepairPass::Denormalized => "denormalized-fields",
            RepairPass::FolderSizes => "folder-sizes",
            RepairPass::PurgeEquality => "purge-orphan-equality",
            RepairPass::PurgeAncestry => "purge-orphan-ancestry",
        }
    }
}

/// One consistency pass as a schedule: while a pass keeps reporting more
/// work pending it is revisited, up to the lap repeat limit, then forced
/// to end-of-lap so the layer keeps rotating.
pub(super) struct RepairSchedule {
    pass: RepairPass,
    laps: u32,
    denorm_cursor: i64,
}

impl RepairSchedule {
    pub(super) fn new(pass: RepairPass) -> Self {
        RepairSchedule {
            pass,
            laps: 0,
            denorm_cursor: 0,
        }
    }

    fn run_pass(&mut self, cx: &MaintCx<'_>) -> Result<usize> {
        match self.pass {
            RepairPass::DirectAncestry => cx.store.refresh_direct_ancestry(REPAIR_BATCH),
            RepairPass::TransitiveAncestry => cx.store.refresh_transitive_ancestry(REPAIR_BATCH),
            RepairPass::UnlistDisabled => self.unlist_disabled(cx),
            RepairPass::OrphanizeStrays => cx.store.orphanize_stray_children(REPAIR_BATCH),
            RepairPass::Denormalized => self.refresh_denormalized(cx),
            RepairPass::FolderSizes => cx.store.refresh_folder_sizes(REPAIR_BATCH),
            RepairPass::PurgeEquality => cx.store.purge_orphan_equality(REPAIR_BATCH),
            RepairPass::PurgeAncestry => cx.store.purge_orphan_ancestry(REPAIR_BATCH),
        }
    }

    /// Contents recorded under archives whose extension has been disabled
    /// are unlisted subtree by subtree.
    fn unlist_disabled(&self, cx: &MaintCx<'_>) -> Result<usize> {
        let mut affected = 0;
        for extension in cx.store.archive_parent_extensions()? {
            if cx.engine.settings.archive_enabled(&extension) {
                continue;
            }
            let children = cx
                .store
                .archive_children_by_extension(&extension, REPAIR_BATCH)?;
            for child in children {
                affected += cx.store.orphanize_subtree(child)?;
                if affected >= REPAIR_BATCH {
                    return Ok(affected);
                }
            }
        }
        Ok(affected)
    }

    fn refresh_denormalized(&mut self, cx: &MaintCx<'_>) -> Result<usize> {
        let rows = cx.store.scan_denormalized(self.denorm_cursor, REPAIR_BATCH)?;
        let exhausted = rows.len() < REPAIR_BATCH;
        let mut fixed = 0;
        for (id, path, name, extension) in rows {
            self.denorm_cursor = id;
            let expected_name = path.rsplit('/').next().unwrap_or(&path).to_string();
            let expected_ext = extension_of(&expected_name);
            if expected_name != name || expected_ext != extension {
                cx.store.fix_denormalized(id, &expected_name, &expected_ext)?;
                fixed += 1;
            }
        }
        if exhausted {
            self.denorm_cursor = 0;
        }
        Ok(fixed)
    }
}

impl Schedule for RepairSchedule {
    fn name(&self) -> &'static str {
        self.pass.name()
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome> {
        let affected = self.run_pass(cx)?;
        if affected > 0 {
            debug!("Repair pass {} touched {} rows", self.pass.name(), affected);
        }
        if affected > 0 && self.laps + 1 < REPAIR_LAP_REPEAT_LIMIT {
            self.laps += 1;
            Ok(StepOutcome::Continue)
        } else {
            self.laps = 0;
            Ok(StepOutcome::EndOfLap)
        }
    }
}
