use crate::dispatch::Dispatcher;
use crate::engine::CrawlEngine;
use crate::error::{Error, Result};
use crate::queues::RootId;
use crate::sched::{WorkerHandle, WorkerJoin};
use crate::storage::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Lazily grown pool of crawl workers, capped at the runtime ceiling.
/// Finished slots are reaped and reused before new ones are added.
pub struct WorkerPool {
    slots: Mutex<Vec<WorkerJoin<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        WorkerPool {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Called on every enqueue: grow the pool while there is work and the
    /// ceiling allows it.
    pub fn ensure_workers(&self, engine: &Arc<CrawlEngine>) -> Result<()> {
        if engine.shutdown_requested() {
            return Ok(());
        }
        let ceiling = engine.settings.worker_ceiling();
        let mut slots = self.slots.lock();
        slots.retain(|join| !join.is_finished());
        while slots.len() < ceiling && engine.queues.has_work() {
            let index = slots.len();
            let engine_for_worker = Arc::clone(engine);
            let join = engine
                .sched
                .spawn(&format!("crawl-{index}"), true, move |h| {
                    crawl_worker(engine_for_worker, h)
                })?;
            debug!("Crawl worker {} started (pool size {})", join.id(), index + 1);
            slots.push(join);
        }
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|join| !join.is_finished())
            .count()
    }

    /// Join every worker. Callers cancel first; cancellation is observed
    /// at the workers' next yield points.
    pub fn shutdown(&self) {
        let slots: Vec<WorkerJoin<()>> = std::mem::take(&mut *self.slots.lock());
        for join in slots {
            let _ = join.join();
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A crawl worker's whole life: attach to the store, drain roots until
/// nothing is claimable, detach. Cancellation stops only this worker; any
/// structural failure is recorded as the engine's fatal error.
fn crawl_worker(engine: Arc<CrawlEngine>, h: &WorkerHandle) -> Result<()> {
    match crawl_worker_inner(&engine, h) {
        Ok(()) => Ok(()),
        Err(Error::Cancelled) => {
            trace!("Crawl worker {} cancelled", h.id());
            Ok(())
        }
        Err(err) => {
            let message = err.to_string();
            engine.record_fatal(err);
            Err(Error::Other(message))
        }
    }
}

fn crawl_worker_inner(engine: &Arc<CrawlEngine>, h: &WorkerHandle) -> Result<()> {
    let store = engine.provider.open_if_not(h)?;
    let outcome = drain_all(engine, &store, h);
    engine.queues.release_all_for(h.id());
    let closed = engine.provider.close_if_possible(h);
    outcome?;
    closed
}

fn drain_all(engine: &Arc<CrawlEngine>, store: &Store, h: &WorkerHandle) -> Result<()> {
    loop {
        h.yield_point()?;
        if engine.shutdown_requested() {
            return Ok(());
        }
        let Some(root) = engine.queues.claim_next(h.id()) else {
            // Nothing claimable anywhere: this worker retires. The pool
            // regrows on the next enqueue.
            return Ok(());
        };
        let drained = drain_root(engine, store, h, root);
        engine.queues.release(root, h.id())?;
        drained?;
    }
}

fn drain_root(
    engine: &Arc<CrawlEngine>,
    store: &Store,
    h: &WorkerHandle,
    root: RootId,
) -> Result<()> {
    trace!("Worker {} draining root {}", h.id(), root);
    while let Some((_, task)) = engine.queues.pop_owned(root, h.id())? {
        Dispatcher::new(engine, store, h).execute(task)?;
    }
    Ok(())
}
