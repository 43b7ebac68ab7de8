//! Worker loops and scheduling entry points.
//!
//! Every worker cycles between exploiting a chain of ready work and waiting
//! for more. The wait path keeps the pool's central invariant: while work
//! may still arrive for a domain, at least one of its workers is active or
//! thieving, so a push into any queue is always observed. Sleeping goes
//! through the notifier's prepare/recheck/commit protocol; the rechecks
//! between `prepare_wait` and `commit_wait` are what make a concurrent
//! push-then-notify impossible to miss.

use super::{deregister_worker, register_worker, Inner};
use crate::{
    graph::{Node, NodeRef},
    sync::{thread, Ordering},
    topology::Topology,
    types::Domain,
    utils::XorShift64,
};
use std::sync::Arc;

/// Per-thread mutable scheduling state. Lives on the worker's stack; the
/// shared [`Worker`](super::Worker) record only carries what other threads
/// must see.
pub(crate) struct WorkerCtx {
    pub(crate) index: usize,
    pub(crate) domain: Domain,
    /// Bypass slot: the next task to run, skipping the deque. Written at
    /// most once per invocation and consumed before the next scheduling
    /// decision.
    pub(crate) cache: Option<NodeRef>,
    rng: XorShift64,
}

pub(crate) fn worker_loop(inner: Arc<Inner>, index: usize) {
    register_worker(inner.id, index);
    let domain = inner.workers[index].domain;
    tracing::trace!(worker = index, ?domain, "worker started");

    let mut ctx = WorkerCtx {
        index,
        domain,
        cache: None,
        rng: XorShift64::new(((inner.id as u64) << 32) ^ index as u64),
    };
    let mut task: Option<NodeRef> = None;
    loop {
        inner.exploit_task(&mut ctx, &mut task);
        if !inner.wait_for_task(&mut ctx, &mut task) {
            break;
        }
    }

    deregister_worker(inner.id);
    tracing::trace!(worker = index, "worker stopped");
}

impl Inner {
    /// Schedule a single ready node.
    ///
    /// Worker callers push onto their own per-domain deque, or, with
    /// `bypass`, into the caller's cache slot (`bypass_slot` must then be
    /// the caller's empty cache). External callers go through the global
    /// queue of the node's domain and always notify.
    pub(crate) fn schedule_one(
        &self,
        bypass_slot: Option<&mut Option<NodeRef>>,
        node: NodeRef,
        bypass: bool,
    ) {
        // SAFETY: scheduled nodes belong to a graph kept alive by its
        // running topology.
        let d = unsafe { node.get() }.domain.index();

        if let Some((_, worker)) = self.local_worker() {
            if bypass {
                let slot = bypass_slot.expect("bypass schedule without a cache slot");
                debug_assert!(slot.is_none(), "bypass cache overwritten before consumption");
                *slot = Some(node);
            } else {
                // SAFETY: the calling thread owns this worker's deques.
                unsafe { worker.wsq[d].push(node) };
                if worker.domain.index() != d
                    && self.num_actives[d].load(Ordering::SeqCst) == 0
                    && self.num_thieves[d].load(Ordering::SeqCst) == 0
                {
                    self.notifier[d].notify_one();
                }
            }
            return;
        }

        {
            let _guard = self.injector_lock.lock().unwrap();
            // SAFETY: external pushes are serialized by `injector_lock`.
            unsafe { self.injector[d].push(node) };
        }
        self.notifier[d].notify_one();
    }

    /// Schedule a batch of ready nodes, issuing one notification per
    /// domain that received work.
    pub(crate) fn schedule_batch(&self, nodes: &[NodeRef]) {
        if nodes.is_empty() {
            return;
        }
        let mut count = [0usize; crate::types::NUM_DOMAINS];

        if let Some((_, worker)) = self.local_worker() {
            for &node in nodes {
                // SAFETY: node liveness as in `schedule_one`; the calling
                // thread owns this worker's deques.
                unsafe {
                    let d = node.get().domain.index();
                    worker.wsq[d].push(node);
                    count[d] += 1;
                }
            }
            for (d, &n) in count.iter().enumerate() {
                if n > 0
                    && d != worker.domain.index()
                    && self.num_actives[d].load(Ordering::SeqCst) == 0
                    && self.num_thieves[d].load(Ordering::SeqCst) == 0
                {
                    self.notifier[d].notify_n(n);
                }
            }
            return;
        }

        {
            let _guard = self.injector_lock.lock().unwrap();
            for &node in nodes {
                // SAFETY: node liveness as in `schedule_one`; pushes are
                // serialized by `injector_lock`.
                unsafe {
                    let d = node.get().domain.index();
                    self.injector[d].push(node);
                    count[d] += 1;
                }
            }
        }
        for (d, &n) in count.iter().enumerate() {
            if n > 0 {
                self.notifier[d].notify_n(n);
            }
        }
    }

    /// Run `task` and every further task reachable without leaving this
    /// worker: the bypass cache first, then the local deque. Join-counter
    /// drains for the chain's parent site are batched in `exe` and settled
    /// when the site changes or the deque runs dry.
    pub(crate) fn exploit_task(&self, ctx: &mut WorkerCtx, task: &mut Option<NodeRef>) {
        debug_assert!(ctx.cache.is_none());
        let Some(first) = task.take() else { return };

        let d = ctx.domain.index();
        // First active worker with no thieves around must wake a peer so
        // the work it is about to publish can be stolen.
        if self.num_actives[d].fetch_add(1, Ordering::SeqCst) == 0
            && self.num_thieves[d].load(Ordering::SeqCst) == 0
        {
            self.notifier[d].notify_one();
        }

        // The chain's current join site: a parent node, or the topology
        // when parent is null.
        let (mut tpg, mut par) = {
            // SAFETY: see `schedule_one`; additionally a task handed to a
            // worker always has its topology pointer set.
            let node = unsafe { first.get() };
            (node.topology_ptr(), node.parent_ptr())
        };
        let mut exe: usize = 1;
        let mut cur = Some(first);

        while let Some(node) = cur.take() {
            self.invoke(ctx, node);

            if let Some(cached) = ctx.cache.take() {
                // Bypass continuation: same join site, token inherited.
                cur = Some(cached);
                continue;
            }

            // SAFETY: this worker owns its own deques.
            match unsafe { self.workers[ctx.index].wsq[d].pop() } {
                Some(next) => {
                    // SAFETY: as above.
                    let (next_par, next_tpg) = {
                        let n = unsafe { next.get() };
                        (n.parent_ptr(), n.topology_ptr())
                    };
                    if next_par == par && (!par.is_null() || next_tpg == tpg) {
                        exe += 1;
                    } else {
                        // Join-site boundary: settle the batch before
                        // continuing under the new site.
                        self.settle_site(ctx, tpg, par, exe);
                        exe = 1;
                        par = next_par;
                        tpg = next_tpg;
                    }
                    cur = Some(next);
                }
                None => {
                    if par.is_null() {
                        // SAFETY: the topology of an in-flight task is kept
                        // alive by its graph's topology queue.
                        let topology = unsafe { &*tpg };
                        if topology.join.fetch_sub(exe, Ordering::AcqRel) == exe {
                            let mut current = tpg;
                            self.tear_down_topology(&mut current);
                            if !current.is_null() {
                                // Re-seeded, or advanced to a queued
                                // submission; its sources may sit in our
                                // deque.
                                //
                                // SAFETY: own deque.
                                if let Some(next) = unsafe { self.workers[ctx.index].wsq[d].pop() }
                                {
                                    // SAFETY: as above.
                                    let n = unsafe { next.get() };
                                    par = n.parent_ptr();
                                    tpg = n.topology_ptr();
                                    exe = 1;
                                    cur = Some(next);
                                }
                            }
                        }
                    } else {
                        // SAFETY: a parent node outlives its spawned
                        // children's execution.
                        let parent = unsafe { &*par };
                        if parent.join.fetch_sub(exe, Ordering::AcqRel) == exe {
                            if parent.domain.index() == d {
                                // The join visit runs right here; climb one
                                // level.
                                cur = Some(NodeRef::new(parent));
                                par = parent.parent_ptr();
                                exe = 1;
                            } else {
                                self.schedule_one(None, NodeRef::new(parent), false);
                            }
                        }
                    }
                }
            }
        }

        self.num_actives[d].fetch_sub(1, Ordering::SeqCst);
    }

    /// Settle a finished batch of `exe` drained tokens against a join site
    /// that the chain is leaving.
    fn settle_site(&self, ctx: &mut WorkerCtx, tpg: *mut Topology, par: *mut Node, exe: usize) {
        let d = ctx.domain.index();
        if par.is_null() {
            // SAFETY: as in `exploit_task`.
            let topology = unsafe { &*tpg };
            if topology.join.fetch_sub(exe, Ordering::AcqRel) == exe {
                let mut current = tpg;
                self.tear_down_topology(&mut current);
            }
        } else {
            // SAFETY: as in `exploit_task`.
            let parent = unsafe { &*par };
            if parent.join.fetch_sub(exe, Ordering::AcqRel) == exe {
                if parent.domain.index() == d {
                    // SAFETY: own deque.
                    unsafe { self.workers[ctx.index].wsq[d].push(NodeRef::new(parent)) };
                } else {
                    self.schedule_one(None, NodeRef::new(parent), false);
                }
            }
        }
    }

    /// Steal from a random victim until something is found, shutdown is
    /// requested, or the bounded spin/yield budget is exhausted.
    fn explore_task(&self, ctx: &mut WorkerCtx, task: &mut Option<NodeRef>) {
        debug_assert!(task.is_none());
        let d = ctx.domain.index();
        let num_workers = self.workers.len();
        let fail_limit = (num_workers + 1) << 1;
        let yield_limit = 100;
        let mut failures = 0usize;
        let mut yields = 0usize;

        while !self.done.load(Ordering::SeqCst) {
            let victim = ctx.rng.next_below(num_workers);
            *task = if victim == ctx.index {
                self.injector[d].steal()
            } else {
                self.workers[victim].wsq[d].steal()
            };
            if task.is_some() {
                break;
            }
            failures += 1;
            if failures > fail_limit {
                thread::yield_now();
                yields += 1;
                if yields > yield_limit {
                    break;
                }
            }
        }
    }

    /// The sleep path. Returns false when the executor is shutting down.
    pub(crate) fn wait_for_task(&self, ctx: &mut WorkerCtx, task: &mut Option<NodeRef>) -> bool {
        let d = ctx.domain.index();
        let waiter = self.workers[ctx.index].waiter;

        'wait: loop {
            debug_assert!(task.is_none());
            self.num_thieves[d].fetch_add(1, Ordering::SeqCst);

            'explore: loop {
                self.explore_task(ctx, task);

                if task.is_some() {
                    // Keep a thief alive while work may still arrive.
                    if self.num_thieves[d].fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.notifier[d].notify_one();
                    }
                    return true;
                }

                self.notifier[d].prepare_wait(waiter);

                // Recheck the global queue: a push may have raced with the
                // exploration above.
                if !self.injector[d].is_empty() {
                    self.notifier[d].cancel_wait(waiter);
                    *task = self.injector[d].steal();
                    if task.is_some() {
                        if self.num_thieves[d].fetch_sub(1, Ordering::SeqCst) == 1 {
                            self.notifier[d].notify_one();
                        }
                        return true;
                    }
                    continue 'explore;
                }

                if self.done.load(Ordering::SeqCst) {
                    self.notifier[d].cancel_wait(waiter);
                    for notifier in &self.notifier {
                        notifier.notify_all();
                    }
                    self.num_thieves[d].fetch_sub(1, Ordering::SeqCst);
                    return false;
                }

                if self.num_thieves[d].fetch_sub(1, Ordering::SeqCst) == 1 {
                    // Last thief of the domain: an active worker may be
                    // about to publish work with nobody left to steal it.
                    if self.num_actives[d].load(Ordering::SeqCst) > 0 {
                        self.notifier[d].cancel_wait(waiter);
                        continue 'wait;
                    }
                    // Final sweep over every worker's deque for this
                    // domain.
                    if self.workers.iter().any(|w| !w.wsq[d].is_empty()) {
                        self.notifier[d].cancel_wait(waiter);
                        continue 'wait;
                    }
                }

                self.notifier[d].commit_wait(waiter);
                return true;
            }
        }
    }
}
