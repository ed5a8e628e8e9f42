use packrat::dispatch::Dispatcher;
use packrat::engine::CrawlEngine;
use packrat::hasher;
use packrat::listing::{FsSource, TreeSource};
use packrat::maintain::{MaintCx, Maintainer, PENDING_HIGH_WATERMARK, PENDING_LOW_WATERMARK};
use packrat::messages::{CollectingSink, MessageSink};
use packrat::sched::{AlwaysIdle, FlagProbe, IdleProbe, WorkerHandle};
use packrat::settings::RuntimeSettings;
use packrat::storage::models::{EntryKind, EntryStatus};
use packrat::storage::{Store, WriteOp};
use std::fs;
use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    engine: Arc<CrawlEngine>,
    store: Arc<Store>,
    worker: WorkerHandle,
    _dir: tempfile::TempDir,
}

/// Engine over the real filesystem with a zero worker ceiling: the test
/// drives queues by hand so each assertion sees a settled catalog.
fn fixture(worker_ceiling: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("catalog.db");
    let settings = Arc::new(RuntimeSettings::new(
        worker_ceiling,
        db_path.to_str().unwrap(),
    ));
    settings.set_archive_extension("zip", true);
    let engine = CrawlEngine::with_parts(
        Arc::clone(&settings),
        Arc::new(FsSource::new(&[])) as Arc<dyn TreeSource>,
        Arc::new(AlwaysIdle) as Arc<dyn IdleProbe>,
        Arc::new(CollectingSink::new()) as Arc<dyn MessageSink>,
    );
    let worker = engine.sched.register("test-driver", false);
    let store = engine.provider.open_if_not(&worker).unwrap();
    Fixture {
        engine,
        store,
        worker,
        _dir: dir,
    }
}

impl Fixture {
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

    fn tick(&self, maintainer: &mut Maintainer) {
        let cx = MaintCx {
            engine: &self.engine,
            store: &self.store,
            worker: &self.worker,
        };
        maintainer.tick(&cx).unwrap();
        self.settle();
    }

    fn tick_until(
        &self,
        maintainer: &mut Maintainer,
        limit: usize,
        mut done: impl FnMut(&Store) -> bool,
    ) {
        for _ in 0..limit {
            if done(&self.store) {
                return;
            }
            self.tick(maintainer);
        }
        assert!(done(&self.store), "catalog did not converge in {limit} ticks");
    }
}

#[test]
fn files_layer_computes_checksums_and_cleans_rows() {
    let fx = fixture(0);
    let root_path = fx._dir.path().join("tree");
    fs::create_dir_all(root_path.join("A")).unwrap();
    fs::write(root_path.join("A/f.bin"), b"0123456789").unwrap();

    let root = fx
        .store
        .register_root(root_path.to_str().unwrap())
        .unwrap();

    let mut maintainer = Maintainer::new();
    fx.tick_until(&mut maintainer, 50, |store| {
        store
            .entry_by_path(&format!("{}/A/f.bin", root_path.display()))
            .unwrap()
            .map(|f| f.status == EntryStatus::Clean && f.checksum.is_some())
            .unwrap_or(false)
    });

    let file = fx
        .store
        .entry_by_path(&format!("{}/A/f.bin", root_path.display()))
        .unwrap()
        .unwrap();
    assert_eq!(
        file.checksum,
        Some(hasher::as_checksum(hasher::hash_data(b"0123456789")))
    );
    assert_eq!(file.size, 10);
    assert_eq!(file.root_id, root);
}

#[test]
fn pending_write_gate_trips_at_high_and_clears_below_low() {
    let fx = fixture(0);
    let root = fx.store.register_root("/gate-test-root").unwrap();

    for _ in 0..PENDING_HIGH_WATERMARK - 1 {
        fx.store.push_write(WriteOp::MarkDirty { id: root });
    }
    assert!(!fx.engine.write_gate_blocked(&fx.store), "below high: open");

    fx.store.push_write(WriteOp::MarkDirty { id: root });
    assert!(fx.engine.write_gate_blocked(&fx.store), "at high: tripped");

    let to_low = PENDING_HIGH_WATERMARK - PENDING_LOW_WATERMARK;
    fx.store.drain_some(to_low).unwrap();
    assert_eq!(fx.store.pending_depth(), PENDING_LOW_WATERMARK);
    assert!(
        fx.engine.write_gate_blocked(&fx.store),
        "at low watermark the gate stays tripped"
    );

    fx.store.drain_some(1).unwrap();
    assert!(
        !fx.engine.write_gate_blocked(&fx.store),
        "below low: cleared"
    );
}

#[test]
fn equality_sweep_revisits_oldest_first_and_restamps_strictly_later() {
    let fx = fixture(0);
    // A root whose live path does not exist: the first crawl marks it
    // NoAccess and disables descent, leaving the seeded rows alone.
    let root = fx.store.register_root("/packrat-missing-root").unwrap();

    let make_pair = |name1: &str, name2: &str, size: i64, checksum: i64, stamp: &str| {
        let a = fx
            .store
            .insert_child(
                root,
                root,
                EntryKind::File,
                &format!("/packrat-missing-root/{name1}"),
                name1,
                size,
                0,
                0,
            )
            .unwrap();
        let b = fx
            .store
            .insert_child(
                root,
                root,
                EntryKind::File,
                &format!("/packrat-missing-root/{name2}"),
                name2,
                size,
                0,
                0,
            )
            .unwrap();
        for id in [a, b] {
            fx.store.push_write(WriteOp::SetChecksum { id, checksum });
            fx.store.push_write(WriteOp::SetStatus {
                id,
                status: EntryStatus::Clean,
            });
        }
        fx.store.push_write(WriteOp::UpsertEquality {
            id1: a,
            id2: b,
            size,
            checksum,
            stamp: stamp.to_string(),
        });
        fx.store.drain_some(100).unwrap();
        (a, b)
    };

    let older = make_pair("a", "b", 1, 11, "2020-01-01T00:00:00.000000Z");
    let newer = make_pair("c", "d", 2, 22, "2021-01-01T00:00:00.000000Z");

    let mut maintainer = Maintainer::new();
    fx.tick_until(&mut maintainer, 30, |store| {
        let first = store.equality_record(older.0, older.1).unwrap().unwrap();
        let second = store.equality_record(newer.0, newer.1).unwrap().unwrap();
        first.last_tested.as_str() > "2020-01-01T00:00:00.000000Z"
            && second.last_tested.as_str() > "2021-01-01T00:00:00.000000Z"
    });

    let first = fx.store.equality_record(older.0, older.1).unwrap().unwrap();
    let second = fx.store.equality_record(newer.0, newer.1).unwrap().unwrap();
    assert!(first.last_tested.as_str() > "2020-01-01T00:00:00.000000Z");
    assert!(second.last_tested.as_str() > "2021-01-01T00:00:00.000000Z");
    // Oldest-tested visited first, so its fresh stamp is the earlier one.
    assert!(first.last_tested <= second.last_tested);
}

#[test]
fn full_engine_run_converges_and_serves_accessors() {
    let dir = tempfile::tempdir().unwrap();
    let root_path = dir.path().join("tree");
    fs::create_dir_all(root_path.join("sub")).unwrap();
    fs::write(root_path.join("x.txt"), b"xxx").unwrap();
    fs::write(root_path.join("sub/z.txt"), b"zzzz").unwrap();
    {
        let zip_file = fs::File::create(root_path.join("pack.zip")).unwrap();
        let mut writer = zip::ZipWriter::new(zip_file);
        writer
            .start_file("inner.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"inside the archive").unwrap();
        writer.finish().unwrap();
    }

    let db_path = dir.path().join("catalog.db");
    let settings = Arc::new(RuntimeSettings::new(2, db_path.to_str().unwrap()));
    settings.set_archive_extension("zip", true);
    let engine = CrawlEngine::with_parts(
        settings,
        Arc::new(FsSource::new(&[])) as Arc<dyn TreeSource>,
        Arc::new(AlwaysIdle) as Arc<dyn IdleProbe>,
        Arc::new(CollectingSink::new()) as Arc<dyn MessageSink>,
    );

    let engine_for_run = Arc::clone(&engine);
    let root_string = root_path.to_str().unwrap().to_string();
    let runner = std::thread::spawn(move || engine_for_run.run(vec![root_string]));

    let member_path = format!("{}/pack.zip!/inner.txt", root_path.display());
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut converged = false;
    while Instant::now() < deadline {
        if let Some(store) = engine.provider.current() {
            let member = store.entry_by_path(&member_path).unwrap();
            let deep = store
                .entry_by_path(&format!("{}/sub/z.txt", root_path.display()))
                .unwrap();
            if let (Some(member), Some(deep)) = (member, deep) {
                if member.checksum.is_some() && deep.checksum.is_some() {
                    converged = true;
                    break;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(converged, "engine did not catalog the tree in time");

    // A foreground accessor preempts the maintenance workers and reads a
    // consistent summary through the shared handle.
    let summary = engine
        .accessor("status-accessor", |_h, store| store.status_summary())
        .unwrap()
        .join()
        .unwrap();
    assert!(!summary.is_empty());

    let store = engine.provider.current().unwrap();
    let member = store.entry_by_path(&member_path).unwrap().unwrap();
    assert_eq!(member.kind, EntryKind::CompressedFile);
    assert_eq!(
        member.checksum,
        Some(hasher::as_checksum(hasher::hash_data(b"inside the archive")))
    );
    assert_eq!(member.size, b"inside the archive".len() as i64);

    engine.request_shutdown();
    runner.join().unwrap().unwrap();
}

#[test]
fn driver_blocks_entirely_while_the_host_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let root_path = dir.path().join("tree");
    fs::create_dir_all(&root_path).unwrap();
    fs::write(root_path.join("only.txt"), b"content").unwrap();

    let db_path = dir.path().join("catalog.db");
    let settings = Arc::new(RuntimeSettings::new(1, db_path.to_str().unwrap()));
    let probe = Arc::new(FlagProbe::new(false));
    let engine = CrawlEngine::with_parts(
        settings,
        Arc::new(FsSource::new(&[])) as Arc<dyn TreeSource>,
        Arc::clone(&probe) as Arc<dyn IdleProbe>,
        Arc::new(CollectingSink::new()) as Arc<dyn MessageSink>,
    );

    let engine_for_run = Arc::clone(&engine);
    let root_string = root_path.to_str().unwrap().to_string();
    let runner = std::thread::spawn(move || engine_for_run.run(vec![root_string]));

    // Roots are registered before the idle gate, but no crawl work may
    // happen while the host is busy.
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.provider.current().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(400));
    let store = engine.provider.current().unwrap();
    let root = &store.roots().unwrap()[0];
    assert!(store.children_of(root.id).unwrap().is_empty());

    probe.set_idle(true);
    let file_path = format!("{}/only.txt", root_path.display());
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut cataloged = false;
    while Instant::now() < deadline {
        if store.entry_by_path(&file_path).unwrap().is_some() {
            cataloged = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(cataloged, "crawl never resumed after the host went idle");

    engine.request_shutdown();
    runner.join().unwrap().unwrap();
}
