mod checksum;
mod crawl;
mod repair;
mod schedule;

pub use schedule::{Cursor, MaintCx, Schedule, StepOutcome};

use crate::config;
use crate::engine::CrawlEngine;
use crate::error::{Error, Result};
use crate::queues::QueueClass;
use crate::sched::WorkerHandle;
use crate::settings::SettingsEvent;
use crate::storage::Store;
use checksum::{ChecksumSweep, EqualitySweep, NoAccessChecksumSweep, TouchSweep};
use crawl::{CrawlSchedule, NoAccessCrawlSchedule};
use repair::{RepairPass, RepairSchedule};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Pending-write buffer watermarks: crawl admission stops at the high
/// mark and resumes once a drain brings the depth below the low mark.
pub const PENDING_HIGH_WATERMARK: usize = 10_000;
pub const PENDING_LOW_WATERMARK: usize = 9_000;

/// Work-queue watermarks: per-class admission and the queue-limit
/// predicate that suspends a running pass.
pub const QUEUE_HIGH_WATERMARK: usize = 512;
pub const QUEUE_LOW_WATERMARK: usize = 64;

/// How often a consistency pass may report more-work-pending before being
/// forced to end-of-lap.
pub const REPAIR_LAP_REPEAT_LIMIT: u32 = 10;

/// Rows fetched per schedule step.
pub const SCHEDULE_BATCH: usize = 64;

/// Rows touched per consistency-pass call.
pub const REPAIR_BATCH: usize = 256;

/// Pending writes applied per opportunistic drain.
pub const DRAIN_BATCH: usize = 256;

/// Host idleness poll resolution.
pub const IDLE_POLL: Duration = Duration::from_secs(1);

/// Token release between driver ticks, giving crawl workers their share.
pub const DRIVER_PAUSE: Duration = Duration::from_millis(25);

pub(crate) type WorkCounter = Arc<AtomicUsize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerGate {
    Crawl,
    Checksum,
    Consistency,
}

/// An ordered array of schedules visited round-robin. A step that returns
/// end-of-lap advances to the next schedule, wrapping.
struct Layer {
    name: &'static str,
    gate: LayerGate,
    schedules: Vec<Box<dyn Schedule>>,
    current: usize,
    /// Crawl layer only: units enqueued since the cycle started. A full
    /// cycle that enqueues nothing triggers the forced re-validation.
    crawl_counter: Option<WorkCounter>,
}

impl Layer {
    fn startable(&self, cx: &MaintCx<'_>) -> Result<bool> {
        Ok(match self.gate {
            LayerGate::Crawl => {
                cx.engine.queues.is_empty(QueueClass::UpdateOnly)
                    && cx.engine.queues.class_depth(QueueClass::Insertable) < QUEUE_LOW_WATERMARK
                    && !cx.engine.write_gate_blocked(cx.store)
                    && !crawl::eligible_roots(cx)?.is_empty()
            }
            LayerGate::Checksum => {
                cx.engine.queues.class_depth(QueueClass::UpdateOnly) < QUEUE_LOW_WATERMARK
            }
            LayerGate::Consistency => cx.engine.queues.is_empty(QueueClass::UpdateOnly),
        })
    }

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<()> {
        let schedule = &mut self.schedules[self.current];
        match schedule.step(cx)? {
            StepOutcome::Continue => {}
            StepOutcome::EndOfLap => {
                debug!("Layer {}: '{}' ended its lap", self.name, schedule.name());
                self.current += 1;
                if self.current >= self.schedules.len() {
                    self.current = 0;
                    self.cycle_complete(cx)?;
                }
            }
        }
        Ok(())
    }

    fn cycle_complete(&mut self, cx: &MaintCx<'_>) -> Result<()> {
        if let Some(counter) = &self.crawl_counter {
            if counter.swap(0, Ordering::SeqCst) == 0 {
                let forced = cx.store.force_clean_folders_dirty()?;
                if forced > 0 {
                    info!(
                        "Crawl cycle found nothing to do; {} clean folders forced dirty for re-validation",
                        forced
                    );
                }
            }
        }
        Ok(())
    }
}

/// The top-level driver state: three round-robin layers, stepped once per
/// tick when their admission gate allows.
pub struct Maintainer {
    layers: Vec<Layer>,
}

impl Maintainer {
    pub fn new() -> Self {
        let counter: WorkCounter = Arc::new(AtomicUsize::new(0));
        let crawl_layer = Layer {
            name: "crawl",
            gate: LayerGate::Crawl,
            schedules: vec![
                Box::new(CrawlSchedule::folders_with_children(Arc::clone(&counter))),
                Box::new(CrawlSchedule::folders_without_children(Arc::clone(&counter))),
                Box::new(CrawlSchedule::files_with_children(Arc::clone(&counter))),
                Box::new(CrawlSchedule::files_without_children(Arc::clone(&counter))),
                Box::new(NoAccessCrawlSchedule::with_children(Arc::clone(&counter))),
                Box::new(NoAccessCrawlSchedule::without_children(Arc::clone(&counter))),
            ],
            current: 0,
            crawl_counter: Some(counter),
        };
        let checksum_layer = Layer {
            name: "checksum",
            gate: LayerGate::Checksum,
            schedules: vec![
                Box::new(ChecksumSweep),
                Box::new(EqualitySweep),
                Box::new(NoAccessChecksumSweep::new()),
                Box::new(TouchSweep::new()),
            ],
            current: 0,
            crawl_counter: None,
        };
        let consistency_layer = Layer {
            name: "consistency",
            gate: LayerGate::Consistency,
            schedules: vec![
                Box::new(RepairSchedule::new(RepairPass::DirectAncestry)),
                Box::new(RepairSchedule::new(RepairPass::TransitiveAncestry)),
                Box::new(RepairSchedule::new(RepairPass::UnlistDisabled)),
                Box::new(RepairSchedule::new(RepairPass::OrphanizeStrays)),
                Box::new(RepairSchedule::new(RepairPass::Denormalized)),
                Box::new(RepairSchedule::new(RepairPass::FolderSizes)),
                Box::new(RepairSchedule::new(RepairPass::PurgeEquality)),
                Box::new(RepairSchedule::new(RepairPass::PurgeAncestry)),
            ],
            current: 0,
            crawl_counter: None,
        };
        Maintainer {
            layers: vec![crawl_layer, checksum_layer, consistency_layer],
        }
    }

    /// One driver tick: drain the pending-write buffer opportunistically,
    /// then step each admissible layer once.
    pub fn tick(&mut self, cx: &MaintCx<'_>) -> Result<()> {
        if cx.engine.write_gate_blocked(cx.store) {
            while cx.store.pending_depth() >= PENDING_LOW_WATERMARK {
                cx.store.drain_some(DRAIN_BATCH)?;
                cx.worker.yield_point()?;
            }
            // Re-evaluate so the gate clears below the low mark.
            cx.engine.write_gate_blocked(cx.store);
        } else {
            cx.store.drain_some(DRAIN_BATCH)?;
        }

        for layer in &mut self.layers {
            cx.worker.yield_point()?;
            if layer.startable(cx)? {
                layer.step(cx)?;
            }
        }
        Ok(())
    }
}

impl Default for Maintainer {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver entry point, run as a low-priority worker. Registers the
/// configured roots, then loops: wait for host idleness, apply settings
/// events, tick the layers, cede the token.
pub fn run_driver(
    engine: &Arc<CrawlEngine>,
    h: &WorkerHandle,
    root_paths: &[String],
) -> Result<()> {
    let store = engine.provider.open_if_not(h)?;
    for path in config::non_overlapping_directories(root_paths.to_vec()) {
        store.register_root(&path)?;
    }

    let settings_rx = engine.settings.subscribe();
    let mut maintainer = Maintainer::new();
    let result = drive(engine, h, &store, &mut maintainer, &settings_rx);
    let closed = engine.provider.close_if_possible(h);
    match result {
        Err(Error::Cancelled) => {
            info!("Maintainer cancelled, shutting down cleanly");
            closed?;
            Ok(())
        }
        Ok(()) => closed,
        Err(err) => Err(err),
    }
}

fn drive(
    engine: &Arc<CrawlEngine>,
    h: &WorkerHandle,
    store: &Arc<Store>,
    maintainer: &mut Maintainer,
    settings_rx: &std::sync::mpsc::Receiver<SettingsEvent>,
) -> Result<()> {
    loop {
        if engine.shutdown_requested() {
            return Ok(());
        }
        wait_for_idle(engine, h, store)?;

        for event in settings_rx.try_iter() {
            info!("Runtime setting changed: {:?}", event);
            if let SettingsEvent::StorePath(path) = event {
                engine.sink.notify(
                    "Store path changed",
                    &format!("'{path}' takes effect on restart"),
                );
            }
        }

        let cx = MaintCx {
            engine,
            store,
            worker: h,
        };
        maintainer.tick(&cx)?;
        h.yield_for(DRIVER_PAUSE)?;
    }
}

/// Block while the host is busy. The memory-pressure hint fires once on
/// entering the wait.
fn wait_for_idle(engine: &Arc<CrawlEngine>, h: &WorkerHandle, store: &Arc<Store>) -> Result<()> {
    let mut hinted = false;
    while !engine.idle.is_idle() {
        if !hinted {
            store.release_memory()?;
            hinted = true;
        }
        h.yield_for(IDLE_POLL)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::checksum::TouchSweep;
    use super::schedule::{MaintCx, Schedule, StepOutcome};
    use super::Maintainer;
    use crate::dispatch::Dispatcher;
    use crate::engine::CrawlEngine;
    use crate::listing::{CompressionStack, LiveNode, TreeSource};
    use crate::messages::{CollectingSink, MessageSink};
    use crate::sched::{AlwaysIdle, IdleProbe, WorkerHandle};
    use crate::settings::RuntimeSettings;
    use crate::storage::models::{EntryKind, EntryStatus};
    use crate::storage::Store;
    use std::io::{self, Read};
    use std::sync::Arc;

    /// Every probed path reports size 2, so file rows recorded with size 1
    /// always mismatch; directories list empty.
    struct MismatchTree;

    impl TreeSource for MismatchTree {
        fn probe(&self, path: &str) -> io::Result<LiveNode> {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            let folder = !name.contains('.');
            Ok(LiveNode {
                name,
                folder,
                size: if folder { 0 } else { 2 },
                compressed_size: 0,
                modified: 0,
            })
        }

        fn list_dir(&self, _path: &str) -> io::Result<Vec<LiveNode>> {
            Ok(Vec::new())
        }

        fn list_archive(
            &self,
            _stack: &CompressionStack,
            _dir: &str,
        ) -> io::Result<Vec<LiveNode>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no archives"))
        }

        fn probe_archive(
            &self,
            _stack: &CompressionStack,
            _member: &str,
        ) -> io::Result<Option<LiveNode>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no archives"))
        }

        fn open_file(&self, _path: &str) -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no content"))
        }

        fn open_member(
            &self,
            _stack: &CompressionStack,
            _member: &str,
        ) -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no content"))
        }
    }

    struct Rig {
        engine: Arc<CrawlEngine>,
        store: Arc<Store>,
        worker: WorkerHandle,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.db");
        let settings = Arc::new(RuntimeSettings::new(0, db_path.to_str().unwrap()));
        let engine = CrawlEngine::with_parts(
            settings,
            Arc::new(MismatchTree) as Arc<dyn TreeSource>,
            Arc::new(AlwaysIdle) as Arc<dyn IdleProbe>,
            Arc::new(CollectingSink::new()) as Arc<dyn MessageSink>,
        );
        let worker = engine.sched.register("unit-driver", false);
        let store = engine.provider.open_if_not(&worker).unwrap();
        Rig {
            engine,
            store,
            worker,
            _dir: dir,
        }
    }

    impl Rig {
        fn cx(&self) -> MaintCx<'_> {
            MaintCx {
                engine: &self.engine,
                store: &self.store,
                worker: &self.worker,
            }
        }

        fn settle(&self) {
            loop {
                self.store.drain_some(100_000).unwrap();
                let Some(root) = self.engine.queues.claim_next(self.worker.id()) else {
                    break;
                };
                while let Some((_, task)) = self
                    .engine
                    .queues
                    .pop_owned(root, self.worker.id())
                    .unwrap()
                {
                    Dispatcher::new(&self.engine, &self.store, &self.worker)
                        .execute(task)
                        .unwrap();
                }
                self.engine.queues.release(root, self.worker.id()).unwrap();
            }
            self.store.drain_some(100_000).unwrap();
        }

        fn seed_clean_files(&self, count: usize) -> i64 {
            let root = self.store.register_root("/sweep").unwrap();
            for index in 0..count {
                let path = format!("/sweep/f{index:03}.bin");
                let name = format!("f{index:03}.bin");
                let id = self
                    .store
                    .insert_child(root, root, EntryKind::File, &path, &name, 1, 0, 0)
                    .unwrap();
                self.store.update_status(id, EntryStatus::Clean).unwrap();
            }
            self.store.update_status(root, EntryStatus::Clean).unwrap();
            root
        }

        fn dirty_file_count(&self, root: i64) -> usize {
            self.store
                .children_of(root)
                .unwrap()
                .iter()
                .filter(|entry| entry.status == EntryStatus::Dirty)
                .count()
        }
    }

    #[test]
    fn touch_sweep_resumed_from_cursor_matches_uninterrupted_run() {
        // Uninterrupted run.
        let straight = rig();
        let root_a = straight.seed_clean_files(100);
        let mut sweep = TouchSweep::new();
        loop {
            let outcome = sweep.step(&straight.cx()).unwrap();
            straight.settle();
            if outcome == StepOutcome::EndOfLap {
                break;
            }
        }
        assert_eq!(straight.dirty_file_count(root_a), 100);

        // Interrupted after one step, resumed from the saved cursor.
        let resumed = rig();
        let root_b = resumed.seed_clean_files(100);
        let mut first_leg = TouchSweep::new();
        let outcome = first_leg.step(&resumed.cx()).unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        resumed.settle();
        let saved = first_leg.cursor().position().unwrap();
        assert!(saved > 0);

        let mut second_leg = TouchSweep::at(saved);
        loop {
            let outcome = second_leg.step(&resumed.cx()).unwrap();
            resumed.settle();
            if outcome == StepOutcome::EndOfLap {
                break;
            }
        }
        assert_eq!(resumed.dirty_file_count(root_b), 100);
    }

    #[test]
    fn crawl_cycle_with_no_work_forces_clean_folders_back_to_dirty() {
        let quiet = rig();
        let root = quiet.store.register_root("/quiet").unwrap();
        quiet.store.update_status(root, EntryStatus::Clean).unwrap();

        let mut maintainer = Maintainer::new();
        // Six crawl schedules, one step each per tick; the sixth lap end
        // completes the cycle with zero units enqueued.
        for _ in 0..6 {
            maintainer.tick(&quiet.cx()).unwrap();
            quiet.settle();
        }
        assert_eq!(
            quiet.store.entry(root).unwrap().unwrap().status,
            EntryStatus::Dirty
        );
    }
}
