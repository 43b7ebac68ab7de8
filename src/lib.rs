//! Heterogeneous work-stealing task-graph executor.
//!
//! This crate runs directed task graphs, including controlled cyclic
//! extensions through condition tasks and dynamically spawned subflows, on
//! a fixed pool of worker threads partitioned into domains (host CPUs, and
//! optionally accelerator workers). It:
//! - Schedules through per-worker Chase–Lev deques with a per-domain global
//!   overflow queue, so ready work is stolen rather than brokered.
//! - Resolves dependencies with per-node atomic join counters: the last
//!   predecessor to finish releases each successor, establishing the
//!   happens-before edge between their callables.
//! - Parks idle workers through a two-phase notifier protocol
//!   (prepare/recheck/commit) that cannot lose wakeups against concurrent
//!   lock-free pushes.
//! - Keeps one task per worker in a bypass cache so chains, including
//!   condition-driven feedback cycles, run back-to-back in constant space.
//!
//! Key modules:
//! - `graph`: the task-graph model and builder ([`Graph`], [`Subflow`]).
//! - `executor`: worker lifecycle, scheduling loops, and the `run*`
//!   submission family ([`Executor`]).
//! - `topology`: per-run state and the completion promise ([`RunFuture`]).
//! - `queue` / `notifier`: the scheduling primitives, reusable on their
//!   own.
//! - `observer`: hooks bracketing every user callable ([`Observer`]).
//!
//! Quick start:
//! 1. Build a [`Graph`] with `emplace*` and [`link`](Graph::link), then
//!    wrap it in an [`Arc`](std::sync::Arc).
//! 2. Create an [`Executor`] with the worker count per domain.
//! 3. Submit with [`run`](Executor::run) / [`run_n`](Executor::run_n) /
//!    [`run_until`](Executor::run_until) and wait on the returned
//!    [`RunFuture`].
//!
//! A graph may be resubmitted while running (submissions queue FIFO) and
//! rerun any number of times; every run restores the graph's at-rest
//! scheduling state.

/// The work-stealing executor: worker lifecycle, scheduling loops, and the
/// submission surface.
pub mod executor;
/// Task-graph model and builder: nodes, work handles, subflows, modules.
pub mod graph;
/// Parkable waiter set with a prepare/commit/cancel wait protocol.
pub mod notifier;
/// Worker-activity observation hooks.
pub mod observer;
/// Single-owner work-stealing deque.
pub mod queue;
mod sync;
/// Per-run topology state and completion futures.
pub mod topology;
mod types;
mod utils;

pub use executor::{Executor, ExecutorBuildError};
pub use graph::{Graph, Subflow, TaskId};
pub use notifier::Notifier;
pub use observer::{Observer, TaskView};
pub use queue::TaskQueue;
pub use topology::{RunError, RunFuture};
pub use types::{Domain, WorkKind};
