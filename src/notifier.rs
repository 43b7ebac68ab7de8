//! Two-phase parking for worker threads.
//!
//! A bare mutex/condvar cannot coordinate sleeping workers with lock-free
//! queues: between "the queue looked empty" and "the worker blocked", a
//! producer may push and notify into the void. The notifier therefore splits
//! waiting into phases:
//!
//! 1. [`Notifier::prepare_wait`] registers the waiter,
//! 2. the worker rechecks its queues,
//! 3. [`Notifier::commit_wait`] blocks, or [`Notifier::cancel_wait`] backs
//!    out.
//!
//! A notification delivered between prepare and commit makes the commit
//! return immediately, and a cancel that races with a notification passes
//! the signal on to another registered waiter, so a wakeup is never lost.

use crate::sync::{Condvar, Mutex};
use std::collections::VecDeque;

struct Waiter {
    signaled: Mutex<bool>,
    cv: Condvar,
}

/// Parkable waiter set with one slot per worker of a domain.
///
/// Waiter indices are assigned by the caller; each index must be driven by
/// exactly one thread at a time. `notify_*` may be called from any thread.
pub struct Notifier {
    /// Indices of waiters currently between `prepare_wait` and
    /// `commit_wait`/`cancel_wait`, or parked. Signaling pops from the
    /// front, so wakeups go to the longest-prepared waiter first.
    prepared: Mutex<VecDeque<usize>>,
    waiters: Box<[Waiter]>,
}

impl Notifier {
    pub fn new(num_waiters: usize) -> Self {
        let waiters = (0..num_waiters)
            .map(|_| Waiter {
                signaled: Mutex::new(false),
                cv: Condvar::new(),
            })
            .collect();
        Self {
            prepared: Mutex::new(VecDeque::with_capacity(num_waiters)),
            waiters,
        }
    }

    /// Mark `waiter` as tentatively waiting. The caller must recheck its
    /// work sources before calling [`commit_wait`](Self::commit_wait).
    pub fn prepare_wait(&self, waiter: usize) {
        let mut prepared = self.prepared.lock().unwrap();
        debug_assert!(!prepared.contains(&waiter));
        prepared.push_back(waiter);
    }

    /// Block until notified. Returns immediately if a notification arrived
    /// after `prepare_wait`.
    pub fn commit_wait(&self, waiter: usize) {
        let slot = &self.waiters[waiter];
        let mut signaled = slot.signaled.lock().unwrap();
        while !*signaled {
            signaled = slot.cv.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Undo a `prepare_wait` without blocking. If a notification already
    /// claimed this waiter, the signal is handed to another registered
    /// waiter instead of being dropped.
    pub fn cancel_wait(&self, waiter: usize) {
        let mut prepared = self.prepared.lock().unwrap();
        if let Some(pos) = prepared.iter().position(|&w| w == waiter) {
            prepared.remove(pos);
            return;
        }
        // A notifier popped us before we canceled. Signals are set under the
        // `prepared` lock, so ours is already observable: consume it and
        // pass it on.
        {
            let mut signaled = self.waiters[waiter].signaled.lock().unwrap();
            debug_assert!(*signaled);
            *signaled = false;
        }
        if let Some(next) = prepared.pop_front() {
            self.signal(next);
        }
    }

    /// Wake one registered waiter, if any.
    pub fn notify_one(&self) {
        let mut prepared = self.prepared.lock().unwrap();
        if let Some(next) = prepared.pop_front() {
            self.signal(next);
        }
    }

    /// Wake up to `n` registered waiters.
    pub fn notify_n(&self, n: usize) {
        let mut prepared = self.prepared.lock().unwrap();
        for _ in 0..n {
            match prepared.pop_front() {
                Some(next) => self.signal(next),
                None => break,
            }
        }
    }

    /// Wake every registered waiter.
    pub fn notify_all(&self) {
        let mut prepared = self.prepared.lock().unwrap();
        while let Some(next) = prepared.pop_front() {
            self.signal(next);
        }
    }

    /// Must be called with the `prepared` lock held, so that "absent from
    /// `prepared`" always implies "signal already set".
    fn signal(&self, waiter: usize) {
        let slot = &self.waiters[waiter];
        let mut signaled = slot.signaled.lock().unwrap();
        *signaled = true;
        slot.cv.notify_one();
    }
}
