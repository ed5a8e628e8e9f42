use parking_lot::Mutex;
use sysinfo::System;

/// Polled host-idleness probe. The maintainer driver blocks while this
/// reports false, at roughly one-second resolution.
pub trait IdleProbe: Send + Sync {
    fn is_idle(&self) -> bool;
}

/// CPU-load probe: the host counts as idle while total CPU usage stays
/// below the configured threshold.
pub struct CpuIdleProbe {
    system: Mutex<System>,
    threshold_percent: f32,
}

impl CpuIdleProbe {
    pub fn new(threshold_percent: f32) -> Self {
        let mut system = System::new();
        // Prime the counters; the first reading after creation is
        // meaningless otherwise.
        system.refresh_cpu_usage();
        CpuIdleProbe {
            system: Mutex::new(system),
            threshold_percent,
        }
    }
}

impl IdleProbe for CpuIdleProbe {
    fn is_idle(&self) -> bool {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.global_cpu_usage() < self.threshold_percent
    }
}

/// Probe that always reports idle. Used by tests and one-shot commands.
pub struct AlwaysIdle;

impl IdleProbe for AlwaysIdle {
    fn is_idle(&self) -> bool {
        true
    }
}

/// Probe backed by a shared flag, for exercising the driver's idle gate.
pub struct FlagProbe(std::sync::atomic::AtomicBool);

impl FlagProbe {
    pub fn new(idle: bool) -> Self {
        FlagProbe(std::sync::atomic::AtomicBool::new(idle))
    }

    pub fn set_idle(&self, idle: bool) {
        self.0.store(idle, std::sync::atomic::Ordering::SeqCst);
    }
}

impl IdleProbe for FlagProbe {
    fn is_idle(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
