mod pool;
mod set;

pub use pool::WorkerPool;
pub use set::{QueueClass, RootId, WorkQueueSet};
