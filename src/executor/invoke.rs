//! Node invocation, successor release, and the topology lifecycle.
//!
//! `invoke` dispatches on the node's work kind, then releases successors by
//! decrementing their join counters; the last predecessor to decrement wins
//! and hands the successor back to the scheduler. All but one ready
//! same-domain successor go to the deque (so peers can steal them) while
//! the last one is deposited in the worker's bypass cache for the tail of
//! the chain. The bypass path is also what keeps condition-driven cycles in
//! constant space: the chosen branch never touches a queue.

use super::{schedule::WorkerCtx, Inner};
use crate::{
    graph::{DynamicWork, Node, NodeRef, Subflow, Work, BRANCH, SPAWNED},
    observer::TaskView,
    sync::{AtomicUsize, Ordering},
    topology::{RunError, Topology},
    types::WorkKind,
};
use core::ptr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

impl Inner {
    /// Run one node and release its successors.
    pub(crate) fn invoke(&self, ctx: &mut WorkerCtx, task: NodeRef) {
        // SAFETY: an in-flight task's graph is kept alive by its running
        // topology, which holds the graph's Arc.
        let node = unsafe { task.get() };
        debug_assert_eq!(ctx.domain, node.domain, "task popped by a foreign-domain worker");

        // Captured before the user callable runs; spawning may reshape
        // everything around the node.
        let num_successors = node.successors.len();
        let tpg = node.topology_ptr();
        let par = node.parent_ptr();
        // The join site charged for work this invocation publishes: the
        // parent of a spawned node, the topology otherwise.
        //
        // SAFETY: both referents outlive the invocation (see above; a
        // parent cannot retire before its spawned children finish).
        let site: &AtomicUsize = unsafe {
            if par.is_null() {
                &(*tpg).join
            } else {
                &(*par).join
            }
        };

        match node.kind {
            WorkKind::Static => {
                // SAFETY: the release protocol invokes a node at most once
                // at a time, so this worker has exclusive payload access.
                unsafe {
                    node.work.with_mut(|w| {
                        if let Work::Static(work) = &mut *w {
                            self.run_user(ctx.index, node, tpg, || work());
                        }
                    });
                }
            }
            WorkKind::Device => {
                // SAFETY: as for `Static`.
                unsafe {
                    node.work.with_mut(|w| {
                        if let Work::Device(work) = &mut *w {
                            self.run_user(ctx.index, node, tpg, || work());
                        }
                    });
                }
            }
            WorkKind::Dynamic => {
                if !node.has_state(SPAWNED) && self.spawn_subflow(ctx, task, node, tpg, site) {
                    // Joined subflow: successors are released by the second
                    // visit, after the subflow drains.
                    return;
                }
            }
            WorkKind::Module => {
                let first_time = !node.has_state(SPAWNED);
                if first_time {
                    node.set_state(SPAWNED);
                    let module = node.module.as_ref().expect("module task without a target");
                    if !module.nodes.is_empty() {
                        let mut sources = Vec::new();
                        for child in &module.nodes {
                            child.set_topology(tpg);
                            child.set_parent(task.as_ptr());
                            child.set_up_join_counter();
                            if child.num_dependents == 0 {
                                sources.push(NodeRef::new(child));
                            }
                        }
                        node.join.fetch_add(sources.len(), Ordering::Relaxed);
                        site.fetch_add(1, Ordering::Relaxed);
                        self.schedule_batch(&sources);
                        return;
                    }
                    // Empty module: degenerates to a pass-through.
                }
            }
            WorkKind::Condition => {
                // Restore this node's own dependency state first: the
                // chosen branch may cycle back and re-release it.
                if node.has_state(BRANCH) {
                    node.join
                        .store(node.num_strong_dependents, Ordering::Relaxed);
                } else {
                    node.join.store(node.num_dependents, Ordering::Relaxed);
                }

                // SAFETY: as for `Static`.
                let branch = unsafe {
                    node.work.with_mut(|w| match &mut *w {
                        Work::Condition(work) => {
                            self.run_user(ctx.index, node, tpg, || work()).flatten()
                        }
                        _ => None,
                    })
                };

                if let Some(id) = branch {
                    if id < num_successors {
                        let chosen = node.successors[id];
                        // SAFETY: successors share the graph's lifetime.
                        let succ = unsafe { chosen.get() };
                        // A condition edge releases its branch
                        // unconditionally.
                        succ.join.store(0, Ordering::Relaxed);
                        if succ.domain == ctx.domain {
                            self.schedule_one(Some(&mut ctx.cache), chosen, true);
                        } else {
                            site.fetch_add(1, Ordering::Relaxed);
                            self.schedule_one(None, chosen, false);
                        }
                    }
                }
                // Condition tasks never apply the normal release rule.
                return;
            }
        }

        // Restore the dependency state before releasing successors: with a
        // condition cycle downstream, this node can be re-released as soon
        // as they run.
        if node.has_state(BRANCH) {
            node.join
                .store(node.num_strong_dependents, Ordering::Relaxed);
        } else {
            node.join.store(node.num_dependents, Ordering::Relaxed);
        }
        node.clear_state(SPAWNED);

        let mut hot: Option<NodeRef> = None;
        for &succ_ref in &node.successors[..num_successors] {
            // SAFETY: successors share the graph's lifetime.
            let succ = unsafe { succ_ref.get() };
            if succ.join.fetch_sub(1, Ordering::AcqRel) == 1 {
                if succ.domain != ctx.domain {
                    // Cross-domain handoff is tracked at the join site; the
                    // add happens-before the drain via the queue hand-off.
                    site.fetch_add(1, Ordering::Relaxed);
                    self.schedule_one(None, succ_ref, false);
                } else if let Some(prev) = hot.replace(succ_ref) {
                    // Only the latest ready successor stays hot; earlier
                    // ones go to the deque where peers can steal them.
                    site.fetch_add(1, Ordering::Relaxed);
                    self.schedule_one(None, prev, false);
                }
            }
        }
        if let Some(hot) = hot {
            self.schedule_one(Some(&mut ctx.cache), hot, true);
        }
    }

    /// First visit of a dynamic task: run the user callable with a fresh
    /// subflow sink and seed whatever it built. Returns true when the
    /// caller must skip successor release (joined, non-empty subflow).
    fn spawn_subflow(
        &self,
        ctx: &mut WorkerCtx,
        task: NodeRef,
        node: &Node,
        tpg: *mut Topology,
        site: &AtomicUsize,
    ) -> bool {
        // SAFETY: exclusive payload access, as in `invoke`.
        let (detached, sources) = unsafe {
            node.work.with_mut(|w| {
                let Work::Dynamic(DynamicWork { work, nodes }) = &mut *w else {
                    unreachable!("dynamic task with a non-dynamic payload");
                };
                nodes.clear();
                let mut subflow = Subflow::new(&mut *nodes);
                self.run_user(ctx.index, node, tpg, || work(&mut subflow));
                let detached = subflow.is_detached();

                if nodes.is_empty() {
                    return (detached, None);
                }
                let mut sources = Vec::new();
                for child in nodes.iter() {
                    child.set_topology(tpg);
                    child.set_parent(if detached {
                        ptr::null_mut()
                    } else {
                        task.as_ptr()
                    });
                    child.set_up_join_counter();
                    if child.num_dependents == 0 {
                        sources.push(NodeRef::new(child));
                    }
                }
                (detached, Some(sources))
            })
        };
        node.set_state(SPAWNED);

        let Some(sources) = sources else {
            // Empty subflow: plain release on this visit.
            return false;
        };

        if detached {
            // Detached children report straight to the topology.
            //
            // SAFETY: the topology outlives its in-flight tasks.
            unsafe { &*tpg }.join.fetch_add(sources.len(), Ordering::Relaxed);
        } else {
            node.join.fetch_add(sources.len(), Ordering::Relaxed);
            // The spawning node's identity is visited a second time for the
            // join, which costs one more token at the surrounding site.
            site.fetch_add(1, Ordering::Relaxed);
        }
        self.schedule_batch(&sources);
        !detached
    }

    /// Bracket a user callable with observer callbacks and panic capture.
    /// A panic is recorded as the run's first failure and the node is
    /// treated as completed, keeping every counter consistent.
    fn run_user<R>(
        &self,
        worker: usize,
        node: &Node,
        tpg: *mut Topology,
        work: impl FnOnce() -> R,
    ) -> Option<R> {
        let view = TaskView {
            kind: node.kind,
            domain: node.domain,
        };
        if let Some(observer) = self.observer.read().unwrap().as_deref() {
            observer.on_entry(worker, view);
        }
        let result = panic::catch_unwind(AssertUnwindSafe(work));
        if let Some(observer) = self.observer.read().unwrap().as_deref() {
            observer.on_exit(worker, view);
        }
        match result {
            Ok(value) => Some(value),
            Err(payload) => {
                let message = panic_message(payload);
                // SAFETY: the topology outlives its in-flight tasks.
                unsafe { &*tpg }.record_failure(RunError::TaskPanicked(message));
                None
            }
        }
    }

    /// Prepare a topology for (re-)execution: clear node state, rearm join
    /// counters, and collect the source set.
    pub(crate) fn set_up_topology(&self, topology: &Arc<Topology>) {
        let tpg = Arc::as_ptr(topology) as *mut Topology;
        let mut sources = Vec::new();
        for node in &topology.graph.nodes {
            node.set_topology(tpg);
            // The graph may have been composed elsewhere earlier; running
            // it standalone must not inherit stale parent links.
            node.set_parent(ptr::null_mut());
            node.set_up_join_counter();
            if node.num_dependents == 0 {
                sources.push(NodeRef::new(node));
            }
        }
        topology.join.store(sources.len(), Ordering::Relaxed);
        // SAFETY: setup runs strictly before any source is scheduled, or
        // from the unique teardown thread.
        unsafe {
            topology.sources.with_mut(|s| *s = sources);
        }
        tracing::trace!(graph = ?topology.graph, "topology set up");
    }

    /// Called by the worker whose join-counter drain hit zero. Either
    /// re-seeds the topology (predicate not yet satisfied) or completes it
    /// and starts the next queued submission; `current` is nulled when no
    /// submission remains.
    pub(crate) fn tear_down_topology(&self, current: &mut *mut Topology) {
        // SAFETY: only the unique draining thread gets here, and the
        // topology is still held by its graph's submission queue.
        let topology = unsafe { &**current };

        // SAFETY: unique teardown thread, as required by `should_stop`.
        if !unsafe { topology.should_stop() } {
            // SAFETY: with the counter at zero nothing else touches the
            // source list.
            unsafe {
                let count = topology.sources.with(|s| (*s).len());
                topology.join.store(count, Ordering::Relaxed);
                topology.sources.with(|s| self.schedule_batch(&*s));
            }
            return;
        }

        // SAFETY: unique teardown thread.
        unsafe { topology.invoke_callback() };

        let graph = Arc::clone(&topology.graph);
        let mut queue = graph.topologies.lock().unwrap();
        let finished = queue.pop_front().expect("tearing down an unqueued topology");
        debug_assert_eq!(Arc::as_ptr(&finished), *current as *const Topology);
        let next = queue.front().cloned();
        drop(queue);

        tracing::trace!(graph = ?graph, pending = next.is_some(), "topology complete");
        match next {
            Some(next) => {
                finished.complete();
                self.decrement_topology();
                self.set_up_topology(&next);
                *current = Arc::as_ptr(&next) as *mut Topology;
                // SAFETY: setup above ran on this thread; nothing is
                // scheduled yet.
                unsafe {
                    next.sources.with(|s| self.schedule_batch(&*s));
                }
                // `next` stays alive through the graph's submission queue.
            }
            None => {
                finished.complete();
                self.decrement_topology_and_notify();
                *current = ptr::null_mut();
            }
        }
    }
}

fn panic_message(payload: Box<dyn core::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
