use std::sync::atomic::{AtomicBool, Ordering};

/// Completion marker for an asynchronous RHI command
///
/// Signalled by the RHI thread once the command it was issued with has
/// executed. Fences do not support a blocking wait, callers poll.
#[derive(Debug)]
pub struct GpuFence {
    name: &'static str,
    signalled: AtomicBool,
}

impl GpuFence {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            signalled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the command has completed
    pub fn poll(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        self.signalled.store(true, Ordering::Release);
    }

    /// Spin until signalled, yielding the thread between polls.
    ///
    /// Never returns if the fence is never signalled.
    pub fn spin_wait(&self) {
        while !self.poll() {
            std::thread::yield_now();
        }
    }
}
