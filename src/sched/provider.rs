use super::coop::{Scheduler, WorkerHandle, WorkerId};
use crate::error::{Error, Result};
use crate::messages::MessageSink;
use crate::settings::RuntimeSettings;
use crate::storage::Store;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Reference-counted open/close of the shared store handle. The first
/// worker in opens the handle; the last one out closes it. Open failure is
/// unrecoverable for the whole process and is reported to the sink before
/// propagating.
pub struct StoreProvider {
    sched: Arc<Scheduler>,
    settings: Arc<RuntimeSettings>,
    sink: Arc<dyn MessageSink>,
    state: Mutex<ProviderState>,
}

struct ProviderState {
    store: Option<Arc<Store>>,
    attached: HashSet<WorkerId>,
}

impl StoreProvider {
    pub fn new(
        sched: Arc<Scheduler>,
        settings: Arc<RuntimeSettings>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        StoreProvider {
            sched,
            settings,
            sink,
            state: Mutex::new(ProviderState {
                store: None,
                attached: HashSet::new(),
            }),
        }
    }

    /// Idempotent open: the first caller opens the handle, later callers
    /// attach to the same one.
    pub fn open_if_not(&self, worker: &WorkerHandle) -> Result<Arc<Store>> {
        worker.yield_point()?;
        let mut state = self.state.lock();
        if state.store.is_none() {
            let path = self.settings.store_path();
            match Store::open(&path) {
                Ok(store) => {
                    info!("Opened catalog store at {}", path);
                    state.store = Some(Arc::new(store));
                }
                Err(err) => {
                    self.sink.fatal(
                        "Catalog store unavailable",
                        &format!("failed to open '{path}': {err}"),
                    );
                    return Err(err);
                }
            }
        }
        state.attached.insert(worker.id());
        match &state.store {
            Some(store) => Ok(Arc::clone(store)),
            None => Err(Error::invariant("store handle missing after open")),
        }
    }

    /// Detach the calling worker, prune attachments of terminated workers,
    /// and physically close the handle when nobody is left.
    pub fn close_if_possible(&self, worker: &WorkerHandle) -> Result<()> {
        worker.yield_point()?;
        let mut state = self.state.lock();
        let worker_id = worker.id();
        let sched = &self.sched;
        state
            .attached
            .retain(|id| *id != worker_id && sched.is_alive(*id));
        if state.attached.is_empty() {
            if state.store.take().is_some() {
                debug!("Last worker out, catalog store closed");
            }
        }
        Ok(())
    }

    /// The currently open handle, if any. Accessor convenience; does not
    /// attach.
    pub fn current(&self) -> Option<Arc<Store>> {
        self.state.lock().store.clone()
    }

    pub fn attached_count(&self) -> usize {
        self.state.lock().attached.len()
    }
}

impl Drop for StoreProvider {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.store.take().is_some() && !state.attached.is_empty() {
            debug!("Provider dropped with workers still attached");
        }
    }
}
