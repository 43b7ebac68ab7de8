//! Worker-activity observation hooks.

use crate::types::{Domain, WorkKind};

/// Immutable view of a task handed to observer callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskView {
    pub kind: WorkKind,
    pub domain: Domain,
}

/// Inspection interface for worker activity.
///
/// An executor keeps at most one observer. `on_entry`/`on_exit` bracket
/// every user callable and are invoked concurrently from all workers, so
/// implementations must be internally synchronized.
pub trait Observer: Send + Sync {
    /// Called once when the observer is installed.
    fn set_up(&mut self, num_workers: usize) {
        let _ = num_workers;
    }

    /// Called on a worker thread immediately before a user callable runs.
    fn on_entry(&self, worker_id: usize, task: TaskView) {
        let _ = (worker_id, task);
    }

    /// Called on a worker thread immediately after a user callable returns.
    fn on_exit(&self, worker_id: usize, task: TaskView) {
        let _ = (worker_id, task);
    }
}
