mod coop;
mod idle;
mod provider;

pub use coop::{Scheduler, WorkerHandle, WorkerId, WorkerJoin};
pub use idle::{AlwaysIdle, CpuIdleProbe, FlagProbe, IdleProbe};
pub use provider::StoreProvider;
