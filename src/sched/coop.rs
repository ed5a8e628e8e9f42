use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::trace;

pub type WorkerId = u64;

/// Emulates strict priority scheduling over a single execution token. The
/// storage backend tolerates only one active caller, so every logical
/// worker — driver, crawl workers, foreground accessors — time-slices over
/// this token, releasing it only at defined suspension points.
///
/// The worker list is a priority stack: tail = highest priority. A worker
/// that reaches a yield point while on top keeps running; anyone else
/// releases the token and requeues behind the highest-priority waiter.
pub struct Scheduler {
    state: Mutex<SchedState>,
    freed: Condvar,
}

struct Slot {
    name: String,
    alive: bool,
    cancelled: bool,
    low_priority: bool,
}

struct SchedState {
    /// Priority order; tail is top.
    stack: Vec<WorkerId>,
    slots: HashMap<WorkerId, Slot>,
    holder: Option<WorkerId>,
    waiting: Vec<WorkerId>,
    next_id: WorkerId,
}

impl SchedState {
    fn top_waiting(&self) -> Option<WorkerId> {
        self.stack
            .iter()
            .rev()
            .find(|id| self.waiting.contains(id))
            .copied()
    }

    fn prune_dead_top(&mut self) {
        while let Some(&top) = self.stack.last() {
            let dead = self.slots.get(&top).map(|s| !s.alive).unwrap_or(true);
            if dead {
                self.stack.pop();
            } else {
                break;
            }
        }
    }
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Scheduler {
            state: Mutex::new(SchedState {
                stack: Vec::new(),
                slots: HashMap::new(),
                holder: None,
                waiting: Vec::new(),
                next_id: 1,
            }),
            freed: Condvar::new(),
        })
    }

    fn alloc_slot(&self, name: &str, low_priority: bool) -> WorkerId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.slots.insert(
            id,
            Slot {
                name: name.to_string(),
                alive: true,
                cancelled: false,
                low_priority,
            },
        );
        if low_priority {
            state.stack.insert(0, id);
        } else {
            state.stack.push(id);
        }
        trace!("Registered worker {} '{}' (low={})", id, name, low_priority);
        id
    }

    /// Register the calling thread as a worker and acquire the token.
    /// Blocks until this worker is the highest-priority waiter.
    pub fn register(self: &Arc<Self>, name: &str, low_priority: bool) -> WorkerHandle {
        let id = self.alloc_slot(name, low_priority);
        let handle = WorkerHandle {
            sched: Arc::clone(self),
            id,
        };
        handle.acquire();
        handle
    }

    /// Spawn a worker on a new thread. Deregistration is guaranteed on
    /// every exit path — success, error, cancellation, panic — via the
    /// handle's drop guard.
    pub fn spawn<T, F>(
        self: &Arc<Self>,
        name: &str,
        low_priority: bool,
        f: F,
    ) -> Result<WorkerJoin<T>>
    where
        F: FnOnce(&WorkerHandle) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.alloc_slot(name, low_priority);
        let sched = Arc::clone(self);
        let join = thread::Builder::new()
            .name(format!("packrat-{name}"))
            .spawn(move || {
                let handle = WorkerHandle { sched, id };
                handle.acquire();
                f(&handle)
            })?;
        Ok(WorkerJoin { id, join })
    }

    /// Request cooperative cancellation; observed at the worker's next
    /// yield point, never forced.
    pub fn cancel(&self, id: WorkerId) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            slot.cancelled = true;
        }
    }

    pub fn cancel_all(&self) {
        for slot in self.state.lock().slots.values_mut() {
            slot.cancelled = true;
        }
    }

    pub fn is_alive(&self, id: WorkerId) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .map(|slot| slot.alive)
            .unwrap_or(false)
    }

    pub fn worker_name(&self, id: WorkerId) -> Option<String> {
        self.state.lock().slots.get(&id).map(|s| s.name.clone())
    }
}

/// A registered worker's capability to hold and cede the execution token.
/// Held tokens are released on drop; the slot is deregistered on drop.
pub struct WorkerHandle {
    sched: Arc<Scheduler>,
    id: WorkerId,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn acquire(&self) {
        let mut state = self.sched.state.lock();
        state.waiting.push(self.id);
        loop {
            if state.holder.is_none() && state.top_waiting() == Some(self.id) {
                state.waiting.retain(|w| *w != self.id);
                state.holder = Some(self.id);
                return;
            }
            self.sched.freed.wait(&mut state);
        }
    }

    /// The cooperative suspension point. Checks the private cancellation
    /// flag (clearing it and failing with Cancelled when set), prunes dead
    /// entries off the stack top, then either keeps the token (caller is
    /// top-of-stack) or releases and reacquires it, ceding one rotation to
    /// the highest-priority waiter.
    pub fn yield_point(&self) -> Result<()> {
        let mut state = self.sched.state.lock();
        let slot = state
            .slots
            .get_mut(&self.id)
            .ok_or_else(|| Error::invariant("yield point on unregistered worker"))?;
        if slot.cancelled {
            slot.cancelled = false;
            return Err(Error::Cancelled);
        }
        state.prune_dead_top();
        if state.stack.last() == Some(&self.id) {
            return Ok(());
        }
        if state.holder != Some(self.id) {
            return Err(Error::invariant(
                "yield point without holding the execution token",
            ));
        }
        state.holder = None;
        state.waiting.push(self.id);
        self.sched.freed.notify_all();
        loop {
            if state.holder.is_none() && state.top_waiting() == Some(self.id) {
                state.waiting.retain(|w| *w != self.id);
                state.holder = Some(self.id);
                return Ok(());
            }
            self.sched.freed.wait(&mut state);
        }
    }

    /// Release the token entirely, sleep off-schedule, then requeue by
    /// priority. Used for idle-waits so lower-priority workers can run
    /// while this one sleeps.
    pub fn yield_for(&self, duration: Duration) -> Result<()> {
        {
            let mut state = self.sched.state.lock();
            let slot = state
                .slots
                .get_mut(&self.id)
                .ok_or_else(|| Error::invariant("yield on unregistered worker"))?;
            if slot.cancelled {
                slot.cancelled = false;
                return Err(Error::Cancelled);
            }
            if state.holder != Some(self.id) {
                return Err(Error::invariant(
                    "timed yield without holding the execution token",
                ));
            }
            state.holder = None;
            self.sched.freed.notify_all();
        }
        if !duration.is_zero() {
            thread::sleep(duration);
        }
        let mut state = self.sched.state.lock();
        if let Some(slot) = state.slots.get_mut(&self.id) {
            if slot.cancelled {
                slot.cancelled = false;
                return Err(Error::Cancelled);
            }
        }
        state.waiting.push(self.id);
        loop {
            if state.holder.is_none() && state.top_waiting() == Some(self.id) {
                state.waiting.retain(|w| *w != self.id);
                state.holder = Some(self.id);
                return Ok(());
            }
            self.sched.freed.wait(&mut state);
        }
    }

    /// Move this worker to the top of the priority stack. By contract
    /// low-priority workers never request promotion; doing so is a bug.
    pub fn raise_to_top_priority(&self) -> Result<()> {
        let mut state = self.sched.state.lock();
        let slot = state
            .slots
            .get(&self.id)
            .ok_or_else(|| Error::invariant("promotion of unregistered worker"))?;
        if slot.low_priority {
            return Err(Error::invariant(
                "low-priority worker requested top priority",
            ));
        }
        state.stack.retain(|w| *w != self.id);
        state.stack.push(self.id);
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let mut state = self.sched.state.lock();
        if let Some(slot) = state.slots.get_mut(&self.id) {
            slot.alive = false;
        }
        state.stack.retain(|w| *w != self.id);
        state.waiting.retain(|w| *w != self.id);
        if state.holder == Some(self.id) {
            state.holder = None;
        }
        state.slots.remove(&self.id);
        self.sched.freed.notify_all();
        trace!("Deregistered worker {}", self.id);
    }
}

/// Join guard for a spawned worker.
pub struct WorkerJoin<T> {
    id: WorkerId,
    join: JoinHandle<Result<T>>,
}

impl<T> WorkerJoin<T> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<T> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(Error::invariant("worker thread panicked")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn token_is_mutually_exclusive_under_stress() {
        let sched = Scheduler::new();
        let in_critical = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for worker in 0..4 {
            let in_critical = Arc::clone(&in_critical);
            let violations = Arc::clone(&violations);
            joins.push(
                sched
                    .spawn(&format!("stress-{worker}"), false, move |h| {
                        for _ in 0..50 {
                            if in_critical.swap(true, Ordering::SeqCst) {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::sleep(Duration::from_micros(50));
                            in_critical.store(false, Ordering::SeqCst);
                            // release the token every unit so the others
                            // genuinely interleave
                            h.yield_for(Duration::ZERO)?;
                        }
                        Ok(())
                    })
                    .unwrap(),
            );
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn low_priority_driver_cedes_to_high_priority_accessor() {
        let sched = Scheduler::new();
        let events: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));

        let driver_events = Arc::clone(&events);
        let driver = sched
            .spawn("driver", true, move |h| {
                for step in 0..10 {
                    driver_events.lock().push(format!("driver-{step}"));
                    h.yield_for(Duration::from_millis(5))?;
                }
                Ok(())
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(15));
        let accessor_events = Arc::clone(&events);
        let accessor = sched
            .spawn("accessor", false, move |h| {
                h.raise_to_top_priority()?;
                accessor_events.lock().push("accessor".to_string());
                Ok(())
            })
            .unwrap();

        accessor.join().unwrap();
        driver.join().unwrap();

        let log = events.lock();
        let accessor_at = log.iter().position(|e| e == "accessor").unwrap();
        // The accessor must have run before the driver finished its laps:
        // the driver's next yield cedes the token.
        assert!(accessor_at < log.len() - 1, "accessor ran last: {log:?}");
    }

    #[test]
    fn cancellation_is_observed_at_the_next_yield_point() {
        let sched = Scheduler::new();
        let progressed = Arc::new(AtomicUsize::new(0));
        let progressed_in_worker = Arc::clone(&progressed);
        let worker = sched
            .spawn("cancellable", true, move |h| {
                loop {
                    h.yield_point()?;
                    progressed_in_worker.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();

        while progressed.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        sched.cancel(worker.id());
        let result: Result<()> = worker.join();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn low_priority_workers_may_not_request_promotion() {
        let sched = Scheduler::new();
        let handle = sched.register("background", true);
        assert!(matches!(
            handle.raise_to_top_priority(),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn top_of_stack_keeps_the_token_through_a_yield() {
        let sched = Scheduler::new();
        let handle = sched.register("solo", false);
        handle.yield_point().unwrap();
        handle.yield_point().unwrap();
    }
}
