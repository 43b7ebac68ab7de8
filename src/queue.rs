//! Unbounded single-owner work-stealing queue.
//!
//! The owner pushes and pops at the bottom (LIFO); any other thread steals
//! from the top (FIFO with respect to pushes). Concurrent `pop`/`steal` on a
//! single remaining element resolve through a compare-exchange on `top` so
//! that exactly one caller obtains it. The ring buffer doubles on overflow;
//! retired buffers are kept alive until the queue is dropped because an
//! in-flight `steal` may still be reading from one.

use crate::{
    sync::{fence, AtomicI64, AtomicPtr, Ordering},
    types::SyncUnsafeCell,
};
use core::mem::MaybeUninit;
use crossbeam_utils::CachePadded;

struct Buffer<T> {
    cap: i64,
    mask: i64,
    slots: Box<[SyncUnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> Buffer<T> {
    fn alloc(cap: i64) -> *mut Self {
        let slots = (0..cap)
            .map(|_| SyncUnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Box::into_raw(Box::new(Self {
            cap,
            mask: cap - 1,
            slots,
        }))
    }

    /// # Safety
    /// Slot `i & mask` must not be concurrently written.
    unsafe fn read(&self, i: i64) -> T {
        self.slots[(i & self.mask) as usize].with(|p| (*p).assume_init())
    }

    /// # Safety
    /// Owner only; slot `i & mask` must not hold a live element.
    unsafe fn write(&self, i: i64, item: T) {
        self.slots[(i & self.mask) as usize].with_mut(|p| *p = MaybeUninit::new(item));
    }
}

/// Chase–Lev deque specialized for `Copy` payloads (the scheduler stores
/// node pointers).
///
/// `push` and `pop` are restricted to the owning worker thread; `steal` and
/// `is_empty` may be called from anywhere.
pub struct TaskQueue<T> {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers retired by `grow`, freed on drop. Owner-only.
    garbage: SyncUnsafeCell<Vec<*mut Buffer<T>>>,
}

unsafe impl<T: Send> Send for TaskQueue<T> {}
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T: Copy> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> TaskQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        Self {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: AtomicPtr::new(Buffer::alloc(capacity as i64)),
            garbage: SyncUnsafeCell::new(Vec::new()),
        }
    }

    /// True when no elements are observable. Callable from any thread.
    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b <= t
    }

    /// Append an element at the bottom.
    ///
    /// # Safety
    /// Must only be called by the queue's owner: the single thread that
    /// performs all `push`/`pop` calls (or, for a shared injection queue,
    /// under a lock serializing the producers).
    pub unsafe fn push(&self, item: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buf = self.buffer.load(Ordering::Relaxed);

        // SAFETY: the owner is the only thread that writes slots or grows.
        unsafe {
            if (*buf).cap - 1 < b - t {
                buf = self.grow(buf, t, b);
            }
            (*buf).write(b, item);
        }
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// Remove the most recently pushed element.
    ///
    /// # Safety
    /// Same ownership contract as [`push`](Self::push).
    pub unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buf = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t <= b {
            // SAFETY: index b is owned by this thread until `top` passes it;
            // the fence above ordered our `bottom` write before the `top`
            // read, so a racing thief serializes through the CAS below.
            let mut item = Some(unsafe { (*buf).read(b) });
            if t == b {
                // Last element: race against thieves for it.
                if self
                    .top
                    .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    item = None;
                }
                self.bottom.store(b + 1, Ordering::Relaxed);
            }
            item
        } else {
            self.bottom.store(b + 1, Ordering::Relaxed);
            None
        }
    }

    /// Take the oldest element. Callable from any thread.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t < b {
            let buf = self.buffer.load(Ordering::Acquire);
            // SAFETY: `t < b` guarantees slot t held a published element when
            // the indices were read; the CAS below discards the read if
            // another consumer claimed it first.
            let item = unsafe { (*buf).read(t) };
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            return Some(item);
        }
        None
    }

    /// # Safety
    /// Owner thread only.
    unsafe fn grow(&self, old: *mut Buffer<T>, t: i64, b: i64) -> *mut Buffer<T> {
        let new = Buffer::alloc((*old).cap * 2);
        for i in t..b {
            (*new).write(i, (*old).read(i));
        }
        // Thieves may still be reading `old`; retire it instead of freeing.
        self.garbage.with_mut(|g| (*g).push(old));
        self.buffer.store(new, Ordering::Release);
        new
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        // SAFETY: drop has exclusive access; every pointer was produced by
        // `Buffer::alloc` and retired exactly once.
        unsafe {
            self.garbage.with_mut(|g| {
                for buf in (*g).drain(..) {
                    drop(Box::from_raw(buf));
                }
            });
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::TaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn owner_pop_is_lifo() {
        let q = TaskQueue::new();
        // SAFETY: this thread is the sole owner throughout the test.
        unsafe {
            q.push(1usize);
            q.push(2);
            q.push(3);
            assert_eq!(q.pop(), Some(3));
            assert_eq!(q.pop(), Some(2));
            assert_eq!(q.pop(), Some(1));
            assert_eq!(q.pop(), None);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn steal_is_fifo() {
        let q = TaskQueue::new();
        // SAFETY: sole owner.
        unsafe {
            q.push(1usize);
            q.push(2);
            q.push(3);
        }
        assert_eq!(q.steal(), Some(1));
        assert_eq!(q.steal(), Some(2));
        assert_eq!(q.steal(), Some(3));
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn growth_preserves_elements() {
        let q = TaskQueue::with_capacity(2);
        // SAFETY: sole owner.
        let mut drained: Vec<_> = unsafe {
            for i in 0..1000usize {
                q.push(i);
            }
            std::iter::from_fn(|| q.pop()).collect()
        };
        drained.sort_unstable();
        assert_eq!(drained, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn no_element_is_duplicated_or_lost_under_contention() {
        const N: usize = 100_000;
        const THIEVES: usize = 4;

        let q = Arc::new(TaskQueue::with_capacity(64));
        let taken = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let q = Arc::clone(&q);
                let taken = Arc::clone(&taken);
                let sum = Arc::clone(&sum);
                std::thread::spawn(move || {
                    while taken.load(Ordering::Relaxed) < N {
                        if let Some(v) = q.steal() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            taken.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        // SAFETY: only this thread pushes and pops.
        unsafe {
            for i in 0..N {
                q.push(i);
                if i % 7 == 0 {
                    if let Some(v) = q.pop() {
                        sum.fetch_add(v, Ordering::Relaxed);
                        taken.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            while taken.load(Ordering::Relaxed) < N {
                if let Some(v) = q.pop() {
                    sum.fetch_add(v, Ordering::Relaxed);
                    taken.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        for th in thieves {
            th.join().unwrap();
        }

        assert_eq!(taken.load(Ordering::Relaxed), N);
        assert_eq!(sum.load(Ordering::Relaxed), N * (N - 1) / 2);
    }
}
