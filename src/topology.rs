//! Per-run metadata and the completion promise.
//!
//! Every submission creates a [`Topology`]: one execution instance of a
//! graph, carrying the source set, the outstanding-work counter, the stop
//! predicate, an optional completion callback, and the promise behind the
//! [`RunFuture`] handed back to the caller. A topology stays alive until its
//! counter drains to zero *and* its predicate asks to stop.

use crate::{
    graph::{Graph, NodeRef},
    sync::{AtomicUsize, Condvar, Mutex},
    types::{Domain, SyncUnsafeCell},
};
use std::sync::Arc;
use thiserror::Error;

/// Why a run completed unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RunError {
    /// A user callable panicked. Carries the panic message of the first
    /// failure; other in-flight tasks ran to completion but further
    /// iterations of the run were abandoned.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    /// The graph contains tasks pinned to a domain this executor has no
    /// workers for.
    #[error("no workers available for domain {0:?}")]
    DomainUnavailable(Domain),
}

struct FutureState {
    result: Mutex<Option<Result<(), RunError>>>,
    cv: Condvar,
}

/// Completion handle of a submission.
///
/// Resolves after the final iteration's completion callback has run. Safe
/// to wait on from any thread; waiting repeatedly returns the same result.
#[derive(Clone, derive_more::Debug)]
#[debug("RunFuture")]
pub struct RunFuture {
    state: Arc<FutureState>,
}

impl RunFuture {
    fn pending() -> Self {
        Self {
            state: Arc::new(FutureState {
                result: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// An already-resolved future, for submissions that never schedule
    /// (empty graph, immediately-true predicate, rejected domain).
    pub(crate) fn ready(result: Result<(), RunError>) -> Self {
        let fut = Self::pending();
        *fut.state.result.lock().unwrap() = Some(result);
        fut
    }

    /// Block until the run completes.
    pub fn wait(&self) -> Result<(), RunError> {
        let mut slot = self.state.result.lock().unwrap();
        loop {
            match &*slot {
                Some(result) => return result.clone(),
                None => slot = self.state.cv.wait(slot).unwrap(),
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.result.lock().unwrap().is_some()
    }

    fn complete(&self, result: Result<(), RunError>) {
        let mut slot = self.state.result.lock().unwrap();
        debug_assert!(slot.is_none(), "run promise fulfilled twice");
        *slot = Some(result);
        self.state.cv.notify_all();
    }
}

/// One execution instance of a graph.
#[derive(derive_more::Debug)]
#[debug("Topology(outstanding: {join:?})")]
pub(crate) struct Topology {
    pub(crate) graph: Arc<Graph>,
    /// Nodes with no dependents, rebuilt by topology setup. Accessed only
    /// from the single thread performing setup or teardown.
    pub(crate) sources: SyncUnsafeCell<Vec<NodeRef>>,
    /// Outstanding-work counter: seeded with the source count, raised by
    /// cross-domain handoffs and spawn second-visits, drained by workers'
    /// batched join accounting. Zero means the iteration finished.
    pub(crate) join: AtomicUsize,
    /// Stop predicate, polled between iterations. Only the thread tearing
    /// the topology down touches it.
    pred: SyncUnsafeCell<Box<dyn FnMut() -> bool + Send>>,
    /// Completion callback, taken on the final iteration.
    call: SyncUnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    /// First recorded failure; suppresses further iterations.
    failure: Mutex<Option<RunError>>,
    promise: RunFuture,
}

impl Topology {
    pub(crate) fn new(
        graph: Arc<Graph>,
        pred: impl FnMut() -> bool + Send + 'static,
        call: Option<Box<dyn FnOnce() + Send>>,
    ) -> (Arc<Self>, RunFuture) {
        let promise = RunFuture::pending();
        let topology = Arc::new(Self {
            graph,
            sources: SyncUnsafeCell::new(Vec::new()),
            join: AtomicUsize::new(0),
            pred: SyncUnsafeCell::new(Box::new(pred)),
            call: SyncUnsafeCell::new(call),
            failure: Mutex::new(None),
            promise: promise.clone(),
        });
        (topology, promise)
    }

    /// Evaluate the stop predicate.
    ///
    /// # Safety
    /// Caller must be the unique thread tearing this topology down (the one
    /// that drained the join counter to zero).
    pub(crate) unsafe fn should_stop(&self) -> bool {
        if self.failed() {
            return true;
        }
        self.pred.with_mut(|p| (*p)())
    }

    /// Invoke the completion callback, if any.
    ///
    /// # Safety
    /// Same uniqueness requirement as [`should_stop`](Self::should_stop).
    pub(crate) unsafe fn invoke_callback(&self) {
        if let Some(call) = self.call.with_mut(|c| (*c).take()) {
            call();
        }
    }

    /// Record the first failure of this run.
    pub(crate) fn record_failure(&self, error: RunError) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.failure.lock().unwrap().is_some()
    }

    /// Fulfill the promise with the recorded outcome. Called exactly once,
    /// after the completion callback.
    pub(crate) fn complete(&self) {
        let result = match self.failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        self.promise.complete(result);
    }
}
