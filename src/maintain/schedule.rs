use crate::engine::CrawlEngine;
use crate::error::Result;
use crate::queues::{QueueClass, RootId};
use crate::sched::WorkerHandle;
use crate::storage::Store;
use std::sync::Arc;

use super::{PENDING_HIGH_WATERMARK, QUEUE_HIGH_WATERMARK};

/// What one schedule step reports back to its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Revisit this schedule on the next pass.
    Continue,
    /// This schedule finished a lap; the layer advances, wrapping.
    EndOfLap,
}

/// Context handed to every schedule step: the engine, the open store and
/// the driver's worker handle for yield points.
pub struct MaintCx<'a> {
    pub engine: &'a Arc<CrawlEngine>,
    pub store: &'a Arc<Store>,
    pub worker: &'a WorkerHandle,
}

impl<'a> MaintCx<'a> {
    pub fn enqueue(&self, root: RootId, task: crate::dispatch::CrawlTask) -> Result<()> {
        self.engine.enqueue(root, task)
    }

    /// The queue-limit predicate, checked after each unit of work: trips
    /// when the pending-write buffer or the relevant work queue reaches
    /// its high watermark, suspending the current pass resumably.
    pub fn queue_limit_hit(&self, class: QueueClass) -> bool {
        self.store.pending_depth() >= PENDING_HIGH_WATERMARK
            || self.engine.queues.class_depth(class) >= QUEUE_HIGH_WATERMARK
    }
}

/// A named, resumable state machine visited round-robin within its layer.
pub trait Schedule: Send {
    fn name(&self) -> &'static str;

    fn step(&mut self, cx: &MaintCx<'_>) -> Result<StepOutcome>;
}

/// Resumption pointer of a cursor-based sweep: the last processed row id,
/// or a disabled sentinel that makes the schedule a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Disabled,
    At(i64),
}

impl Cursor {
    pub fn start() -> Self {
        Cursor::At(0)
    }

    pub fn position(&self) -> Option<i64> {
        match self {
            Cursor::Disabled => None,
            Cursor::At(id) => Some(*id),
        }
    }

    pub fn advance(&mut self, id: i64) {
        if let Cursor::At(position) = self {
            if id > *position {
                *position = id;
            }
        }
    }

    pub fn reset(&mut self) {
        if !matches!(self, Cursor::Disabled) {
            *self = Cursor::start();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advances_monotonically_and_resets_to_start() {
        let mut cursor = Cursor::start();
        cursor.advance(10);
        cursor.advance(7);
        assert_eq!(cursor.position(), Some(10));
        cursor.reset();
        assert_eq!(cursor.position(), Some(0));
    }

    #[test]
    fn disabled_cursor_stays_disabled() {
        let mut cursor = Cursor::Disabled;
        cursor.advance(5);
        cursor.reset();
        assert_eq!(cursor.position(), None);
    }
}
