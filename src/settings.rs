use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

/// A runtime setting changed. Subscribers receive one event per publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    WorkerCeiling(usize),
    ArchiveExtension { extension: String, enabled: bool },
    StorePath(String),
}

/// Runtime-observable configuration: crawling-worker ceiling, per-extension
/// archive-traversal enablement, and the store file path. Readers pull the
/// current value; interested parties subscribe for change events.
pub struct RuntimeSettings {
    worker_ceiling: RwLock<usize>,
    store_path: RwLock<String>,
    archive_extensions: DashMap<String, bool>,
    subscribers: Mutex<Vec<Sender<SettingsEvent>>>,
}

impl RuntimeSettings {
    pub fn new(worker_ceiling: usize, store_path: impl Into<String>) -> Self {
        RuntimeSettings {
            worker_ceiling: RwLock::new(worker_ceiling),
            store_path: RwLock::new(store_path.into()),
            archive_extensions: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<SettingsEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: SettingsEvent) {
        debug!("Settings changed: {:?}", event);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn worker_ceiling(&self) -> usize {
        *self.worker_ceiling.read()
    }

    pub fn set_worker_ceiling(&self, ceiling: usize) {
        *self.worker_ceiling.write() = ceiling;
        self.publish(SettingsEvent::WorkerCeiling(ceiling));
    }

    pub fn store_path(&self) -> String {
        self.store_path.read().clone()
    }

    pub fn set_store_path(&self, path: impl Into<String>) {
        let path = path.into();
        *self.store_path.write() = path.clone();
        self.publish(SettingsEvent::StorePath(path));
    }

    pub fn archive_enabled(&self, extension: &str) -> bool {
        self.archive_extensions
            .get(extension)
            .map(|enabled| *enabled)
            .unwrap_or(false)
    }

    pub fn enabled_archive_extensions(&self) -> Vec<String> {
        self.archive_extensions
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn set_archive_extension(&self, extension: impl Into<String>, enabled: bool) {
        let extension = extension.into().to_ascii_lowercase();
        self.archive_extensions.insert(extension.clone(), enabled);
        self.publish(SettingsEvent::ArchiveExtension { extension, enabled });
    }
}
