use crate::dispatch::CrawlTask;
use crate::error::{Error, Result};
use crate::sched::WorkerId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub type RootId = i64;

/// The two work classes. Insert-capable work must never interleave
/// arbitrarily with relationship maintenance on the same root, so each
/// root keeps one FIFO per class and insertable work drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    Insertable,
    UpdateOnly,
}

#[derive(Default)]
struct RootQueues {
    insertable: VecDeque<CrawlTask>,
    update_only: VecDeque<CrawlTask>,
    owner: Option<WorkerId>,
}

impl RootQueues {
    fn depth(&self, class: QueueClass) -> usize {
        match class {
            QueueClass::Insertable => self.insertable.len(),
            QueueClass::UpdateOnly => self.update_only.len(),
        }
    }

    fn has_work(&self) -> bool {
        !self.insertable.is_empty() || !self.update_only.is_empty()
    }
}

/// Per-root task queues, keyed by root id. Ephemeral, in-process only.
/// The ownership token (at most one draining worker per root) lives under
/// the same lock as the queues themselves.
pub struct WorkQueueSet {
    inner: Mutex<HashMap<RootId, RootQueues>>,
}

impl WorkQueueSet {
    pub fn new() -> Self {
        WorkQueueSet {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Push a task; returns the depth of that root's class queue after the
    /// push.
    pub fn enqueue(&self, root: RootId, class: QueueClass, task: CrawlTask) -> usize {
        let mut inner = self.inner.lock();
        let queues = inner.entry(root).or_default();
        match class {
            QueueClass::Insertable => queues.insertable.push_back(task),
            QueueClass::UpdateOnly => queues.update_only.push_back(task),
        }
        queues.depth(class)
    }

    pub fn class_depth(&self, class: QueueClass) -> usize {
        self.inner
            .lock()
            .values()
            .map(|queues| queues.depth(class))
            .sum()
    }

    pub fn root_depth(&self, root: RootId, class: QueueClass) -> usize {
        self.inner
            .lock()
            .get(&root)
            .map(|queues| queues.depth(class))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, class: QueueClass) -> bool {
        self.class_depth(class) == 0
    }

    pub fn has_work(&self) -> bool {
        self.inner.lock().values().any(|queues| queues.has_work())
    }

    /// Claim an unowned root that has pending work. Across roots no
    /// ordering is guaranteed.
    pub fn claim_next(&self, worker: WorkerId) -> Option<RootId> {
        let mut inner = self.inner.lock();
        for (root, queues) in inner.iter_mut() {
            if queues.owner.is_none() && queues.has_work() {
                queues.owner = Some(worker);
                return Some(*root);
            }
        }
        None
    }

    /// Pop the next task of an owned root: the insertable queue drains
    /// fully before the update-only queue is touched.
    pub fn pop_owned(
        &self,
        root: RootId,
        worker: WorkerId,
    ) -> Result<Option<(QueueClass, CrawlTask)>> {
        let mut inner = self.inner.lock();
        let queues = inner
            .get_mut(&root)
            .ok_or_else(|| Error::invariant(format!("pop from unknown root {root}")))?;
        if queues.owner != Some(worker) {
            return Err(Error::invariant(format!(
                "worker {worker} popped root {root} without owning it"
            )));
        }
        if let Some(task) = queues.insertable.pop_front() {
            return Ok(Some((QueueClass::Insertable, task)));
        }
        if let Some(task) = queues.update_only.pop_front() {
            return Ok(Some((QueueClass::UpdateOnly, task)));
        }
        Ok(None)
    }

    pub fn release(&self, root: RootId, worker: WorkerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let queues = inner
            .get_mut(&root)
            .ok_or_else(|| Error::invariant(format!("release of unknown root {root}")))?;
        if queues.owner != Some(worker) {
            return Err(Error::invariant(format!(
                "worker {worker} released root {root} it does not own"
            )));
        }
        queues.owner = None;
        Ok(())
    }

    /// Safety net on worker exit: drop any ownership the worker still
    /// holds.
    pub fn release_all_for(&self, worker: WorkerId) {
        let mut inner = self.inner.lock();
        for queues in inner.values_mut() {
            if queues.owner == Some(worker) {
                queues.owner = None;
            }
        }
    }

    #[cfg(test)]
    pub fn owner_of(&self, root: RootId) -> Option<WorkerId> {
        self.inner.lock().get(&root).and_then(|queues| queues.owner)
    }
}

impl Default for WorkQueueSet {
    fn default() -> Self {
        Self::new()
    }
}
