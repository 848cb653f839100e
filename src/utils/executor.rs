//! Dedicated-thread task executor
//!
//! Several pipeline stages own one OS thread and accept work from any
//! other thread: the RHI thread, the encode worker and the stats thread.
//! Tasks run one at a time in posting order. The thread stops once every
//! handle is dropped and the queue has drained.

use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Executor {
    name: String,
    tx: mpsc::UnboundedSender<Task>,
    thread_id: ThreadId,
}

impl Executor {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("[{}] thread started", thread_name);
                while let Some(task) = rx.blocking_recv() {
                    task();
                }
                debug!("[{}] thread stopped", thread_name);
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn {} thread: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            tx,
            thread_id: handle.thread().id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on this executor's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue a task. Returns `false` if the thread has exited.
    pub fn post(&self, task: Task) -> bool {
        if self.tx.send(task).is_err() {
            warn!("[{}] thread has exited, task dropped", self.name);
            return false;
        }
        true
    }

    /// Run `f` inline when already on this thread, otherwise queue it
    pub fn ensure_on<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            f();
        } else {
            self.post(Box::new(f));
        }
    }

    /// Block the calling thread until every task posted so far has run
    ///
    /// Must not be called from the executor's own thread.
    pub fn drain(&self) {
        if self.is_current() {
            return;
        }
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        if self.post(Box::new(move || {
            let _ = tx.send(());
        })) {
            let _ = rx.recv();
        }
    }
}
