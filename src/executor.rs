//! The work-stealing executor.
//!
//! An [`Executor`] owns a fixed pool of worker threads partitioned into
//! domains (host CPUs, and optionally accelerator workers). Each worker
//! keeps one local deque per domain, so it can buffer work destined for any
//! domain while only ever executing tasks of its own; per-domain global
//! queues absorb submissions from threads outside the pool. Workers drain
//! work in priority order (bypass cache, own deque, steals, global queue)
//! and park through the two-phase [`Notifier`](crate::Notifier) protocol
//! when no work is reachable.

mod invoke;
mod schedule;

use crate::{
    graph::{Graph, NodeRef},
    notifier::Notifier,
    observer::Observer,
    queue::TaskQueue,
    sync::{thread, AtomicBool, AtomicUsize, Condvar, Mutex, Ordering, RwLock},
    topology::{RunError, RunFuture, Topology},
    types::{Domain, NUM_DOMAINS},
};
use core::cell::RefCell;
use crossbeam_utils::CachePadded;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when an executor cannot be constructed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorBuildError {
    /// A domain was enabled with zero workers.
    #[error("no workers to run {0:?} tasks")]
    NoWorkers(Domain),
}

/// Executor identities are process-global so that the thread-local worker
/// registry can tell executors apart.
static NEXT_EXECUTOR_ID: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

thread_local! {
    /// executor id → worker index of the current thread.
    static WORKER_REGISTRY: RefCell<FxHashMap<usize, usize>> =
        RefCell::new(FxHashMap::default());
}

fn register_worker(executor_id: usize, index: usize) {
    WORKER_REGISTRY.with(|r| r.borrow_mut().insert(executor_id, index));
}

fn deregister_worker(executor_id: usize) {
    WORKER_REGISTRY.with(|r| r.borrow_mut().remove(&executor_id));
}

fn registered_worker(executor_id: usize) -> Option<usize> {
    WORKER_REGISTRY.with(|r| r.borrow().get(&executor_id).copied())
}

/// Shared, per-worker scheduling state. Deques are owner-push/pop,
/// any-thread steal; the mutable bypass cache and RNG live on the worker's
/// own stack (see `schedule::WorkerCtx`).
pub(crate) struct Worker {
    pub(crate) domain: Domain,
    /// Waiter slot in this domain's notifier.
    pub(crate) waiter: usize,
    /// One local deque per domain: a worker buffers work for any domain
    /// locally and lets the right workers steal it.
    pub(crate) wsq: [TaskQueue<NodeRef>; NUM_DOMAINS],
}

pub(crate) struct Inner {
    pub(crate) id: usize,
    pub(crate) workers: Box<[Worker]>,
    pub(crate) domain_workers: [usize; NUM_DOMAINS],
    /// Per-domain global queues for external producers; pushes are
    /// serialized by `injector_lock`, steals are lock-free.
    pub(crate) injector: [TaskQueue<NodeRef>; NUM_DOMAINS],
    pub(crate) injector_lock: Mutex<()>,
    pub(crate) notifier: [Notifier; NUM_DOMAINS],
    pub(crate) num_actives: [CachePadded<AtomicUsize>; NUM_DOMAINS],
    pub(crate) num_thieves: [CachePadded<AtomicUsize>; NUM_DOMAINS],
    pub(crate) done: AtomicBool,
    num_topologies: Mutex<usize>,
    topology_cv: Condvar,
    pub(crate) observer: RwLock<Option<Box<dyn Observer>>>,
}

impl Inner {
    /// The calling thread's worker record, if it belongs to this executor.
    pub(crate) fn local_worker(&self) -> Option<(usize, &Worker)> {
        let index = registered_worker(self.id)?;
        Some((index, &self.workers[index]))
    }

    pub(crate) fn increment_topology(&self) {
        *self.num_topologies.lock().unwrap() += 1;
    }

    pub(crate) fn decrement_topology(&self) {
        *self.num_topologies.lock().unwrap() -= 1;
    }

    pub(crate) fn decrement_topology_and_notify(&self) {
        let mut count = self.num_topologies.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.topology_cv.notify_all();
        }
    }

    fn wait_for_all(&self) {
        let mut count = self.num_topologies.lock().unwrap();
        while *count > 0 {
            count = self.topology_cv.wait(count).unwrap();
        }
    }
}

/// Execution interface for running task graphs.
///
/// Construct with a worker count per enabled domain, build a [`Graph`], and
/// submit it with one of the `run*` methods; each submission returns a
/// [`RunFuture`]. Dropping the executor waits for all pending runs, then
/// shuts the workers down cooperatively.
pub struct Executor {
    inner: Arc<Inner>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Executor {
    /// Create an executor with `host_workers` CPU workers and no device
    /// domain.
    ///
    /// # Errors
    /// If `host_workers` is zero.
    pub fn new(host_workers: usize) -> Result<Self, ExecutorBuildError> {
        Self::build(host_workers, 0, false)
    }

    /// Create an executor with `host_workers` CPU workers and
    /// `device_workers` accelerator workers.
    ///
    /// # Errors
    /// If either count is zero.
    pub fn with_device_workers(
        host_workers: usize,
        device_workers: usize,
    ) -> Result<Self, ExecutorBuildError> {
        Self::build(host_workers, device_workers, true)
    }

    fn build(
        host_workers: usize,
        device_workers: usize,
        device_enabled: bool,
    ) -> Result<Self, ExecutorBuildError> {
        if host_workers == 0 {
            return Err(ExecutorBuildError::NoWorkers(Domain::Host));
        }
        if device_enabled && device_workers == 0 {
            return Err(ExecutorBuildError::NoWorkers(Domain::Device));
        }

        let id = NEXT_EXECUTOR_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let mut workers = Vec::with_capacity(host_workers + device_workers);
        for waiter in 0..host_workers {
            workers.push(Worker {
                domain: Domain::Host,
                waiter,
                wsq: [TaskQueue::new(), TaskQueue::new()],
            });
        }
        for waiter in 0..device_workers {
            workers.push(Worker {
                domain: Domain::Device,
                waiter,
                wsq: [TaskQueue::new(), TaskQueue::new()],
            });
        }

        let inner = Arc::new(Inner {
            id,
            workers: workers.into_boxed_slice(),
            domain_workers: [host_workers, device_workers],
            injector: [TaskQueue::new(), TaskQueue::new()],
            injector_lock: Mutex::new(()),
            notifier: [Notifier::new(host_workers), Notifier::new(device_workers)],
            num_actives: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            num_thieves: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            done: AtomicBool::new(false),
            num_topologies: Mutex::new(0),
            topology_cv: Condvar::new(),
            observer: RwLock::new(None),
        });

        let threads = (0..inner.workers.len())
            .map(|index| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || schedule::worker_loop(inner, index))
            })
            .collect();

        tracing::debug!(host_workers, device_workers, "executor started");
        Ok(Self { inner, threads })
    }

    /// Run the graph once.
    pub fn run(&self, graph: Arc<Graph>) -> RunFuture {
        self.run_n(graph, 1)
    }

    /// Run the graph once, invoking `call` on completion.
    pub fn run_with(&self, graph: Arc<Graph>, call: impl FnOnce() + Send + 'static) -> RunFuture {
        self.run_n_with(graph, 1, call)
    }

    /// Run the graph `repeat` times.
    pub fn run_n(&self, graph: Arc<Graph>, repeat: usize) -> RunFuture {
        self.submit(graph, repeat_predicate(repeat), None)
    }

    /// Run the graph `repeat` times, invoking `call` after the final run.
    pub fn run_n_with(
        &self,
        graph: Arc<Graph>,
        repeat: usize,
        call: impl FnOnce() + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, repeat_predicate(repeat), Some(Box::new(call)))
    }

    /// Run the graph repeatedly until `pred` returns true. The predicate is
    /// evaluated before the first iteration and after every completed one.
    pub fn run_until(
        &self,
        graph: Arc<Graph>,
        pred: impl FnMut() -> bool + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, pred, None)
    }

    /// Like [`run_until`](Self::run_until), invoking `call` after the final
    /// iteration.
    pub fn run_until_with(
        &self,
        graph: Arc<Graph>,
        pred: impl FnMut() -> bool + Send + 'static,
        call: impl FnOnce() + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, pred, Some(Box::new(call)))
    }

    fn submit(
        &self,
        graph: Arc<Graph>,
        mut pred: impl FnMut() -> bool + Send + 'static,
        call: Option<Box<dyn FnOnce() + Send>>,
    ) -> RunFuture {
        let inner = &self.inner;
        inner.increment_topology();

        // Nothing to schedule: resolve without creating a topology. The
        // completion callback is tied to a final run, so it is skipped.
        if graph.is_empty() || pred() {
            inner.decrement_topology_and_notify();
            return RunFuture::ready(Ok(()));
        }

        if graph.requires_domain(Domain::Device)
            && inner.domain_workers[Domain::Device.index()] == 0
        {
            inner.decrement_topology_and_notify();
            return RunFuture::ready(Err(RunError::DomainUnavailable(Domain::Device)));
        }

        let (topology, future) = Topology::new(Arc::clone(&graph), pred, call);
        let run_now = {
            let mut queue = graph.topologies.lock().unwrap();
            queue.push_back(Arc::clone(&topology));
            queue.len() == 1
        };

        // Later submissions queue behind the running topology and are
        // started by its teardown.
        if run_now {
            inner.set_up_topology(&topology);
            // SAFETY: setup just finished and no source has been scheduled
            // yet, so this thread has exclusive access to the source list.
            unsafe {
                topology.sources.with(|s| inner.schedule_batch(&*s));
            }
        }
        future
    }

    /// Block until every submitted run has completed.
    pub fn wait_for_all(&self) {
        self.inner.wait_for_all();
    }

    /// Total number of worker threads across all domains.
    pub fn num_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Number of domains with at least one worker.
    pub fn num_domains(&self) -> usize {
        self.inner
            .domain_workers
            .iter()
            .filter(|&&n| n > 0)
            .count()
    }

    /// Number of runs submitted but not yet completed.
    pub fn num_topologies(&self) -> usize {
        *self.inner.num_topologies.lock().unwrap()
    }

    /// The calling thread's worker id, if it is one of this executor's
    /// workers.
    pub fn this_worker_id(&self) -> Option<usize> {
        registered_worker(self.inner.id)
    }

    /// Install an observer, replacing any previous one. `set_up` is called
    /// with the worker count before installation. Installing while runs are
    /// in flight is memory-safe, but which observer sees a given task during
    /// the swap is unspecified; install while idle.
    pub fn make_observer<O: Observer + 'static>(&self, mut observer: O) {
        observer.set_up(self.num_workers());
        *self.inner.observer.write().unwrap() = Some(Box::new(observer));
    }

    /// Remove the installed observer, if any.
    pub fn remove_observer(&self) {
        *self.inner.observer.write().unwrap() = None;
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.wait_for_all();
        self.inner.done.store(true, Ordering::SeqCst);
        for notifier in &self.inner.notifier {
            notifier.notify_all();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        tracing::debug!("executor shut down");
    }
}

fn repeat_predicate(repeat: usize) -> impl FnMut() -> bool + Send + 'static {
    let mut remaining = repeat;
    move || {
        if remaining == 0 {
            true
        } else {
            remaining -= 1;
            false
        }
    }
}
