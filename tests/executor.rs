#![cfg(not(feature = "loom"))]

//! End-to-end scheduling behavior: ordering, repetition, stress, domains,
//! failure surfacing, and observability.

use magpie::{Domain, Executor, Graph, Observer, RunError, TaskView};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn record(trace: &Trace, label: &'static str) -> impl FnMut() + Send + 'static {
    let trace = Arc::clone(trace);
    move || trace.lock().unwrap().push(label)
}

#[test]
fn chain_preserves_order_across_runs() {
    let executor = Executor::new(4).unwrap();
    let trace: Trace = Arc::default();

    let mut graph = Graph::new();
    let a = graph.emplace(record(&trace, "A"));
    let b = graph.emplace(record(&trace, "B"));
    let c = graph.emplace(record(&trace, "C"));
    graph.linearize(&[a, b, c]);

    executor.run_n(Arc::new(graph), 3).wait().unwrap();

    // A re-seed only happens after the previous iteration fully drains, so
    // iterations never interleave.
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["A", "B", "C", "A", "B", "C", "A", "B", "C"]
    );
}

#[test]
fn diamond_runs_fork_between_endpoints() {
    let executor = Executor::new(4).unwrap();
    let trace: Trace = Arc::default();

    let mut graph = Graph::new();
    let a = graph.emplace(record(&trace, "A"));
    let b = graph.emplace(record(&trace, "B"));
    let c = graph.emplace(record(&trace, "C"));
    let d = graph.emplace(record(&trace, "D"));
    graph.link(a, b);
    graph.link(a, c);
    graph.link(b, d);
    graph.link(c, d);

    executor.run(Arc::new(graph)).wait().unwrap();

    let trace = trace.lock().unwrap();
    assert_eq!(trace.len(), 4);
    assert_eq!(trace[0], "A");
    assert_eq!(trace[3], "D");
    assert!(trace[1..3].contains(&"B") && trace[1..3].contains(&"C"));
}

#[test]
fn every_node_runs_exactly_once_per_iteration() {
    const NODES: usize = 50;
    const RUNS: usize = 7;

    let executor = Executor::new(4).unwrap();
    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..NODES).map(|_| AtomicUsize::new(0)).collect());

    let mut graph = Graph::new();
    for i in 0..NODES {
        let counters = Arc::clone(&counters);
        graph.emplace(move || {
            counters[i].fetch_add(1, Ordering::Relaxed);
        });
    }

    executor.run_n(Arc::new(graph), RUNS).wait().unwrap();

    for counter in counters.iter() {
        assert_eq!(counter.load(Ordering::Relaxed), RUNS);
    }
}

#[test]
fn stress_independent_tasks_accumulate_exact_total() {
    const NODES: usize = 1000;
    const RUNS: usize = 20;

    let executor = Executor::new(4).unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new();
    for i in 0..NODES {
        let total = Arc::clone(&total);
        graph.emplace(move || {
            // Vary the work a little so steals actually happen.
            if i % 97 == 0 {
                std::thread::sleep(Duration::from_micros(50));
            }
            total.fetch_add(i, Ordering::Relaxed);
        });
    }

    executor.run_n(Arc::new(graph), RUNS).wait().unwrap();

    let expected = RUNS * (NODES * (NODES - 1) / 2);
    assert_eq!(total.load(Ordering::Relaxed), expected);
}

#[test]
fn external_submissions_never_lose_wakeups() {
    const PRODUCERS: usize = 4;
    const SUBMISSIONS: usize = 25;

    // A single worker maximizes the park/notify pressure.
    let executor = Executor::new(1).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..PRODUCERS {
            let executor = &executor;
            let completed = Arc::clone(&completed);
            scope.spawn(move || {
                for _ in 0..SUBMISSIONS {
                    let counter = Arc::new(AtomicUsize::new(0));
                    let mut graph = Graph::new();
                    let c = Arc::clone(&counter);
                    let a = graph.emplace(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    });
                    let c = Arc::clone(&counter);
                    let b = graph.emplace(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    });
                    graph.link(a, b);

                    executor.run(Arc::new(graph)).wait().unwrap();
                    assert_eq!(counter.load(Ordering::Relaxed), 2);
                    completed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::Relaxed), PRODUCERS * SUBMISSIONS);
}

#[test]
fn concurrent_submissions_of_one_graph_drain_fifo() {
    let executor = Executor::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let order: Trace = Arc::default();

    let mut graph = Graph::new();
    let runs_in_task = Arc::clone(&runs);
    graph.emplace(move || {
        runs_in_task.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
    });
    let graph = Arc::new(graph);

    let first = {
        let order = Arc::clone(&order);
        executor.run_with(Arc::clone(&graph), move || {
            order.lock().unwrap().push("first")
        })
    };
    let second = {
        let order = Arc::clone(&order);
        executor.run_with(Arc::clone(&graph), move || {
            order.lock().unwrap().push("second")
        })
    };

    first.wait().unwrap();
    second.wait().unwrap();

    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn wait_for_all_drains_every_pending_run() {
    let executor = Executor::new(2).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let count = Arc::clone(&count);
        let mut graph = Graph::new();
        graph.emplace(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
        // Futures intentionally dropped; wait_for_all is the only barrier.
        let _ = executor.run_n(Arc::new(graph), 3);
    }

    executor.wait_for_all();
    assert_eq!(executor.num_topologies(), 0);
    assert_eq!(count.load(Ordering::Relaxed), 24);
}

#[test]
fn empty_graph_resolves_without_scheduling() {
    let executor = Executor::new(1).unwrap();
    let future = executor.run(Arc::new(Graph::new()));
    assert!(future.is_complete());
    future.wait().unwrap();
}

#[test]
fn zero_repeats_resolve_without_running() {
    let executor = Executor::new(1).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new();
    let c = Arc::clone(&count);
    graph.emplace(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });

    let future = executor.run_n(Arc::new(graph), 0);
    assert!(future.is_complete());
    future.wait().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 0);
}

#[test]
fn graph_reruns_after_completed_submission() {
    let executor = Executor::new(2).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new();
    let a = {
        let c = Arc::clone(&count);
        graph.emplace(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    };
    let b = {
        let c = Arc::clone(&count);
        graph.emplace(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    };
    graph.link(a, b);
    let graph = Arc::new(graph);

    executor.run_n(Arc::clone(&graph), 3).wait().unwrap();
    // The completed run restored the at-rest state, so the graph runs
    // again unchanged.
    executor.run(Arc::clone(&graph)).wait().unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 8);
}

#[test]
fn panicking_task_fails_the_future_and_spares_the_executor() {
    let executor = Executor::new(2).unwrap();

    let mut graph = Graph::new();
    let a = graph.emplace(|| {});
    let boom = graph.emplace(|| panic!("boom"));
    graph.link(a, boom);

    let err = executor.run_n(Arc::new(graph), 5).wait().unwrap_err();
    match err {
        RunError::TaskPanicked(message) => assert!(message.contains("boom")),
        other => panic!("unexpected error: {other:?}"),
    }

    // The pool survives and runs subsequent graphs.
    let ok = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();
    let c = Arc::clone(&ok);
    graph.emplace(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });
    executor.run(Arc::new(graph)).wait().unwrap();
    assert_eq!(ok.load(Ordering::Relaxed), 1);
}

#[test]
fn device_tasks_without_device_workers_are_rejected() {
    let executor = Executor::new(2).unwrap();

    let mut graph = Graph::new();
    graph.emplace_device(|| {});

    let err = executor.run(Arc::new(graph)).wait().unwrap_err();
    assert_eq!(err, RunError::DomainUnavailable(Domain::Device));
}

#[test]
fn cross_domain_chain_orders_and_wakes_host_again() {
    let executor = Executor::with_device_workers(2, 1).unwrap();
    let trace: Trace = Arc::default();

    let mut graph = Graph::new();
    let h1 = graph.emplace(record(&trace, "H1"));
    let g1 = {
        let trace = Arc::clone(&trace);
        graph.emplace_device(move || {
            // Long enough for the host workers to go idle and park.
            std::thread::sleep(Duration::from_millis(30));
            trace.lock().unwrap().push("G1");
        })
    };
    let h2 = graph.emplace(record(&trace, "H2"));
    graph.linearize(&[h1, g1, h2]);

    executor.run_n(Arc::new(graph), 3).wait().unwrap();

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["H1", "G1", "H2", "H1", "G1", "H2", "H1", "G1", "H2"]
    );
}

struct CountingObserver {
    workers_seen: Arc<AtomicUsize>,
    entries: Arc<AtomicUsize>,
    exits: Arc<AtomicUsize>,
    num_workers: usize,
}

impl Observer for CountingObserver {
    fn set_up(&mut self, num_workers: usize) {
        self.workers_seen.store(num_workers, Ordering::Relaxed);
        self.num_workers = num_workers;
    }

    fn on_entry(&self, worker_id: usize, _task: TaskView) {
        assert!(worker_id < self.num_workers);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    fn on_exit(&self, worker_id: usize, _task: TaskView) {
        assert!(worker_id < self.num_workers);
        self.exits.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn observer_brackets_every_user_callable() {
    let executor = Executor::new(3).unwrap();
    let workers_seen = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    let exits = Arc::new(AtomicUsize::new(0));

    executor.make_observer(CountingObserver {
        workers_seen: Arc::clone(&workers_seen),
        entries: Arc::clone(&entries),
        exits: Arc::clone(&exits),
        num_workers: 0,
    });
    assert_eq!(workers_seen.load(Ordering::Relaxed), 3);

    let mut graph = Graph::new();
    let a = graph.emplace(|| {});
    let b = graph.emplace(|| {});
    graph.link(a, b);
    let graph = Arc::new(graph);

    executor.run_n(Arc::clone(&graph), 4).wait().unwrap();
    assert_eq!(entries.load(Ordering::Relaxed), 8);
    assert_eq!(exits.load(Ordering::Relaxed), 8);

    // Removal stops the callbacks; the counters stay put.
    executor.remove_observer();
    executor.run(graph).wait().unwrap();
    assert_eq!(entries.load(Ordering::Relaxed), 8);
    assert_eq!(exits.load(Ordering::Relaxed), 8);
}
