use crate::config::AppConfig;
use crate::dispatch::CrawlTask;
use crate::error::{Error, Result};
use crate::listing::{FsSource, TreeSource};
use crate::maintain::{self, PENDING_HIGH_WATERMARK, PENDING_LOW_WATERMARK};
use crate::messages::{LogSink, MessageSink};
use crate::queues::{RootId, WorkQueueSet, WorkerPool};
use crate::sched::{CpuIdleProbe, IdleProbe, Scheduler, StoreProvider, WorkerHandle, WorkerJoin};
use crate::settings::RuntimeSettings;
use crate::storage::Store;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

/// Roots taken out of circulation for this run: their real path turned out
/// inaccessible, so descent is disabled instead of aborting the sweep.
pub struct RootExclusions {
    inner: Mutex<HashSet<RootId>>,
}

impl RootExclusions {
    pub fn new() -> Self {
        RootExclusions {
            inner: Mutex::new(HashSet::new()),
        }
    }

    pub fn exclude(&self, root: RootId) {
        self.inner.lock().insert(root);
    }

    pub fn readmit(&self, root: RootId) {
        self.inner.lock().remove(&root);
    }

    pub fn is_excluded(&self, root: RootId) -> bool {
        self.inner.lock().contains(&root)
    }
}

impl Default for RootExclusions {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared context of the whole maintenance engine: scheduler, store
/// provider, queues, pool, and the collaborators every component needs.
pub struct CrawlEngine {
    pub sched: Arc<Scheduler>,
    pub settings: Arc<RuntimeSettings>,
    pub listing: Arc<dyn TreeSource>,
    pub idle: Arc<dyn IdleProbe>,
    pub sink: Arc<dyn MessageSink>,
    pub provider: StoreProvider,
    pub queues: WorkQueueSet,
    pub pool: WorkerPool,
    pub exclusions: RootExclusions,
    fatal: Mutex<Option<Error>>,
    shutdown: AtomicBool,
    write_gate_tripped: AtomicBool,
}

impl CrawlEngine {
    pub fn new(config: &AppConfig) -> Arc<Self> {
        let settings = Arc::new(config.to_settings());
        let listing: Arc<dyn TreeSource> = Arc::new(FsSource::new(&config.ignore_patterns));
        let idle: Arc<dyn IdleProbe> = Arc::new(CpuIdleProbe::new(config.idle_cpu_percent));
        let sink: Arc<dyn MessageSink> = Arc::new(LogSink);
        Self::with_parts(settings, listing, idle, sink)
    }

    /// Assemble an engine from explicit collaborators. Tests inject fakes
    /// here.
    pub fn with_parts(
        settings: Arc<RuntimeSettings>,
        listing: Arc<dyn TreeSource>,
        idle: Arc<dyn IdleProbe>,
        sink: Arc<dyn MessageSink>,
    ) -> Arc<Self> {
        let sched = Scheduler::new();
        let provider = StoreProvider::new(
            Arc::clone(&sched),
            Arc::clone(&settings),
            Arc::clone(&sink),
        );
        Arc::new(CrawlEngine {
            sched,
            settings,
            listing,
            idle,
            sink,
            provider,
            queues: WorkQueueSet::new(),
            pool: WorkerPool::new(),
            exclusions: RootExclusions::new(),
            fatal: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            write_gate_tripped: AtomicBool::new(false),
        })
    }

    /// Queue one task on its root and lazily grow the worker pool.
    pub fn enqueue(self: &Arc<Self>, root: RootId, task: CrawlTask) -> Result<()> {
        let class = task.class();
        let depth = self.queues.enqueue(root, class, task);
        trace!("Enqueued {:?} work on root {} (depth {})", class, root, depth);
        self.pool.ensure_workers(self)
    }

    /// Hysteresis gate from the pending-write buffer into the crawl layer:
    /// trips at the high watermark, clears below the low one. While
    /// tripped, no new list work is admitted.
    pub fn write_gate_blocked(&self, store: &Store) -> bool {
        let depth = store.pending_depth();
        if depth >= PENDING_HIGH_WATERMARK {
            self.write_gate_tripped.store(true, Ordering::SeqCst);
        } else if depth < PENDING_LOW_WATERMARK {
            self.write_gate_tripped.store(false, Ordering::SeqCst);
        }
        self.write_gate_tripped.load(Ordering::SeqCst)
    }

    pub fn record_fatal(&self, err: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            self.sink.fatal("Maintenance failed", &err.to_string());
            *fatal = Some(err);
        }
        drop(fatal);
        self.shutdown.store(true, Ordering::SeqCst);
        self.sched.cancel_all();
    }

    pub fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.sched.cancel_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run a foreground accessor: a high-priority worker sharing the store
    /// handle. The driver and crawl workers cede the token at their next
    /// yield point.
    pub fn accessor<T, F>(self: &Arc<Self>, name: &str, f: F) -> Result<WorkerJoin<T>>
    where
        F: FnOnce(&WorkerHandle, &Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(self);
        self.sched.spawn(name, false, move |h| {
            h.raise_to_top_priority()?;
            let store = engine.provider.open_if_not(h)?;
            let result = f(h, &store);
            engine.provider.close_if_possible(h)?;
            result
        })
    }

    /// Top-level supervisor: run the maintainer driver until shutdown or
    /// failure. Any unrecoverable error has already been flushed through
    /// the message sink; the caller maps an Err to process termination.
    pub fn run(self: &Arc<Self>, root_paths: Vec<String>) -> Result<()> {
        info!("Maintenance engine starting for {} root(s)", root_paths.len());
        let engine = Arc::clone(self);
        let driver = self
            .sched
            .spawn("maintainer", true, move |h| {
                maintain::run_driver(&engine, h, &root_paths)
            })?;

        let driver_result = driver.join();
        self.sched.cancel_all();
        self.pool.shutdown();

        if let Some(fatal) = self.take_fatal() {
            return Err(fatal);
        }
        match driver_result {
            Err(err) if err.is_fatal() => {
                self.sink.fatal("Maintenance failed", &err.to_string());
                Err(err)
            }
            _ => Ok(()),
        }
    }
}
