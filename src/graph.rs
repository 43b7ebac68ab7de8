//! Task-graph model: nodes, work handles, and the builder surface.
//!
//! A [`Graph`] owns its nodes; the executor only ever holds non-owning
//! references to them for the duration of a run. Dependency structure
//! (successor links, dependent counts) is immutable once a graph has been
//! submitted; the per-node join counter and state bits are the only fields
//! the executor mutates, and both are restored when a run completes.

use crate::{
    sync::{AtomicPtr, AtomicU8, AtomicUsize, Ordering},
    topology::Topology,
    types::{Domain, SyncUnsafeCell, WorkKind},
};
use core::ptr::{self, NonNull};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Identifier of a task within the graph (or subflow) that created it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

/// Non-owning reference to a node. Valid while the owning graph is alive,
/// which the executor guarantees by holding the graph's `Arc` on the
/// topology for the whole run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NodeRef(NonNull<Node>);

unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    pub(crate) fn new(node: &Node) -> Self {
        Self(NonNull::from(node))
    }

    /// # Safety
    /// The owning graph must still be alive.
    pub(crate) unsafe fn get<'a>(self) -> &'a Node {
        self.0.as_ref()
    }

    pub(crate) fn as_ptr(self) -> *mut Node {
        self.0.as_ptr()
    }
}

/// Node state bit: a dynamic or module task has spawned its children and is
/// awaiting its second (join) visit.
pub(crate) const SPAWNED: u8 = 1;
/// Node state bit: at least one predecessor is a condition task, so the
/// join counter counts only strong predecessors.
pub(crate) const BRANCH: u8 = 1 << 1;

/// Payload of a dynamic task: the user callable plus the subgraph container
/// it fills on every spawn.
#[derive(derive_more::Debug)]
#[debug("DynamicWork({} spawned)", nodes.len())]
pub(crate) struct DynamicWork {
    pub(crate) work: Box<dyn FnMut(&mut Subflow<'_>) + Send>,
    pub(crate) nodes: Vec<Box<Node>>,
}

/// Tagged task body. Dispatch is by [`WorkKind`] (a plain node field), so
/// the cell holding this enum is only entered for kinds that carry a
/// callable.
#[derive(derive_more::Debug)]
pub(crate) enum Work {
    Static(#[debug(skip)] Box<dyn FnMut() + Send>),
    Dynamic(DynamicWork),
    Condition(#[debug(skip)] Box<dyn FnMut() -> Option<usize> + Send>),
    Device(#[debug(skip)] Box<dyn FnMut() + Send>),
    /// Body is another graph; the target lives in [`Node::module`] so that
    /// submission-time validation can read it without touching this cell.
    Module,
}

/// The unit of scheduled work.
#[derive(derive_more::Debug)]
#[debug("Node({kind:?}, {domain:?})")]
pub(crate) struct Node {
    pub(crate) kind: WorkKind,
    pub(crate) domain: Domain,
    /// User callable and per-kind payload. Entered mutably only by the
    /// single worker currently invoking this node.
    pub(crate) work: SyncUnsafeCell<Work>,
    /// Target graph of a module task. Immutable after build.
    pub(crate) module: Option<Arc<Graph>>,
    /// Ordered successor links; branch indices of a condition task follow
    /// link order. Immutable during a run.
    pub(crate) successors: Vec<NodeRef>,
    pub(crate) num_dependents: usize,
    /// Predecessors whose edge is not a condition branch.
    pub(crate) num_strong_dependents: usize,
    pub(crate) join: AtomicUsize,
    pub(crate) state: AtomicU8,
    /// Topology of the current run. Written during single-threaded setup
    /// phases, published to workers by the queue operations that schedule
    /// the node.
    pub(crate) topology: AtomicPtr<Topology>,
    /// Back-pointer to the dynamic or module node this node was spawned
    /// under, or null for topology-level nodes.
    pub(crate) parent: AtomicPtr<Node>,
}

impl Node {
    fn new(kind: WorkKind, domain: Domain, work: Work, module: Option<Arc<Graph>>) -> Box<Self> {
        Box::new(Self {
            kind,
            domain,
            work: SyncUnsafeCell::new(work),
            module,
            successors: Vec::new(),
            num_dependents: 0,
            num_strong_dependents: 0,
            join: AtomicUsize::new(0),
            state: AtomicU8::new(0),
            topology: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Restore the at-rest scheduling state: clear `SPAWNED`, derive
    /// `BRANCH` from the link structure, and arm the join counter with the
    /// strong predecessor count.
    pub(crate) fn set_up_join_counter(&self) {
        let state = if self.num_dependents > self.num_strong_dependents {
            BRANCH
        } else {
            0
        };
        self.state.store(state, Ordering::Relaxed);
        self.join.store(self.num_strong_dependents, Ordering::Relaxed);
    }

    pub(crate) fn has_state(&self, bit: u8) -> bool {
        self.state.load(Ordering::Relaxed) & bit != 0
    }

    pub(crate) fn set_state(&self, bit: u8) {
        self.state.fetch_or(bit, Ordering::Relaxed);
    }

    pub(crate) fn clear_state(&self, bit: u8) {
        self.state.fetch_and(!bit, Ordering::Relaxed);
    }

    pub(crate) fn topology_ptr(&self) -> *mut Topology {
        self.topology.load(Ordering::Relaxed)
    }

    pub(crate) fn set_topology(&self, tpg: *mut Topology) {
        self.topology.store(tpg, Ordering::Relaxed);
    }

    pub(crate) fn parent_ptr(&self) -> *mut Node {
        self.parent.load(Ordering::Relaxed)
    }

    pub(crate) fn set_parent(&self, parent: *mut Node) {
        self.parent.store(parent, Ordering::Relaxed);
    }
}

fn push_node(
    nodes: &mut Vec<Box<Node>>,
    kind: WorkKind,
    domain: Domain,
    work: Work,
    module: Option<Arc<Graph>>,
) -> TaskId {
    nodes.push(Node::new(kind, domain, work, module));
    TaskId(nodes.len() - 1)
}

fn link_nodes(nodes: &mut [Box<Node>], from: TaskId, to: TaskId) {
    assert_ne!(from, to, "a task cannot precede itself");
    let from_is_condition = nodes[from.0].kind == WorkKind::Condition;
    let to_ref = {
        let to_node = &mut nodes[to.0];
        to_node.num_dependents += 1;
        if !from_is_condition {
            to_node.num_strong_dependents += 1;
        }
        NodeRef::new(to_node)
    };
    nodes[from.0].successors.push(to_ref);
}

/// A user-owned task graph.
///
/// Build with the `emplace*` methods and [`link`](Graph::link), then wrap in
/// an [`Arc`] and submit via [`Executor::run`](crate::Executor::run) and
/// friends. The same graph may be submitted repeatedly; concurrent
/// submissions queue and execute FIFO.
#[derive(derive_more::Debug)]
#[debug("Graph({} tasks)", nodes.len())]
pub struct Graph {
    pub(crate) nodes: Vec<Box<Node>>,
    /// Pending and running submissions, front first.
    pub(crate) topologies: Mutex<VecDeque<Arc<Topology>>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            topologies: Mutex::new(VecDeque::new()),
        }
    }

    /// Add a static task.
    pub fn emplace(&mut self, work: impl FnMut() + Send + 'static) -> TaskId {
        push_node(
            &mut self.nodes,
            WorkKind::Static,
            Domain::Host,
            Work::Static(Box::new(work)),
            None,
        )
    }

    /// Add a dynamic task. Its callable receives a [`Subflow`] sink and runs
    /// on the first visit of each topology iteration; spawned tasks join
    /// back into the node unless the subflow is detached.
    pub fn emplace_dynamic(
        &mut self,
        work: impl FnMut(&mut Subflow<'_>) + Send + 'static,
    ) -> TaskId {
        push_node(
            &mut self.nodes,
            WorkKind::Dynamic,
            Domain::Host,
            Work::Dynamic(DynamicWork {
                work: Box::new(work),
                nodes: Vec::new(),
            }),
            None,
        )
    }

    /// Add a condition task. Returning `Some(i)` releases successor `i`
    /// (in link order) unconditionally; `None` or an out-of-range index
    /// releases nothing.
    pub fn emplace_condition(
        &mut self,
        work: impl FnMut() -> Option<usize> + Send + 'static,
    ) -> TaskId {
        push_node(
            &mut self.nodes,
            WorkKind::Condition,
            Domain::Host,
            Work::Condition(Box::new(work)),
            None,
        )
    }

    /// Add an accelerator offload task, executed on a device-domain worker.
    pub fn emplace_device(&mut self, work: impl FnMut() + Send + 'static) -> TaskId {
        push_node(
            &mut self.nodes,
            WorkKind::Device,
            Domain::Device,
            Work::Device(Box::new(work)),
            None,
        )
    }

    /// Add a module task whose body is `module`, inlined into the current
    /// run as children of this task. The target graph must not be running
    /// anywhere else while this graph runs.
    pub fn compose(&mut self, module: &Arc<Graph>) -> TaskId {
        push_node(
            &mut self.nodes,
            WorkKind::Module,
            Domain::Host,
            Work::Module,
            Some(Arc::clone(module)),
        )
    }

    /// Add a dependency edge: `to` runs after `from`. Edges out of a
    /// condition task are branch edges; their position in `from`'s link
    /// order is the branch index.
    pub fn link(&mut self, from: TaskId, to: TaskId) {
        link_nodes(&mut self.nodes, from, to);
    }

    /// Link each consecutive pair: `tasks[0] → tasks[1] → …`.
    pub fn linearize(&mut self, tasks: &[TaskId]) {
        for pair in tasks.windows(2) {
            self.link(pair[0], pair[1]);
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when this graph (or a composed module, transitively) contains a
    /// task pinned to `domain`.
    pub(crate) fn requires_domain(&self, domain: Domain) -> bool {
        self.nodes.iter().any(|n| {
            n.domain == domain
                || n.module
                    .as_deref()
                    .is_some_and(|m| m.requires_domain(domain))
        })
    }
}

/// Sink handed to a dynamic task's callable for building its subflow.
///
/// The subflow joins by default: every spawned task completes before any
/// successor of the spawning task is released. Call
/// [`detach`](Subflow::detach) to sever that join; detached tasks then only
/// hold back completion of the whole run.
#[derive(derive_more::Debug)]
#[debug("Subflow({} tasks, detached: {detached})", nodes.len())]
pub struct Subflow<'a> {
    nodes: &'a mut Vec<Box<Node>>,
    detached: bool,
}

impl<'a> Subflow<'a> {
    pub(crate) fn new(nodes: &'a mut Vec<Box<Node>>) -> Self {
        Self {
            nodes,
            detached: false,
        }
    }

    /// Add a static task to the subflow.
    pub fn emplace(&mut self, work: impl FnMut() + Send + 'static) -> TaskId {
        push_node(
            self.nodes,
            WorkKind::Static,
            Domain::Host,
            Work::Static(Box::new(work)),
            None,
        )
    }

    /// Add a nested dynamic task to the subflow.
    pub fn emplace_dynamic(
        &mut self,
        work: impl FnMut(&mut Subflow<'_>) + Send + 'static,
    ) -> TaskId {
        push_node(
            self.nodes,
            WorkKind::Dynamic,
            Domain::Host,
            Work::Dynamic(DynamicWork {
                work: Box::new(work),
                nodes: Vec::new(),
            }),
            None,
        )
    }

    /// Add a condition task to the subflow.
    pub fn emplace_condition(
        &mut self,
        work: impl FnMut() -> Option<usize> + Send + 'static,
    ) -> TaskId {
        push_node(
            self.nodes,
            WorkKind::Condition,
            Domain::Host,
            Work::Condition(Box::new(work)),
            None,
        )
    }

    /// Add an accelerator offload task to the subflow.
    pub fn emplace_device(&mut self, work: impl FnMut() + Send + 'static) -> TaskId {
        push_node(
            self.nodes,
            WorkKind::Device,
            Domain::Device,
            Work::Device(Box::new(work)),
            None,
        )
    }

    /// Add a dependency edge within the subflow.
    pub fn link(&mut self, from: TaskId, to: TaskId) {
        link_nodes(self.nodes, from, to);
    }

    /// Detach the subflow from its spawner: successors of the spawning task
    /// no longer wait for the spawned tasks.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }
}
