use crate::sync::UnsafeCell;

/// Worker class bound to one execution environment.
///
/// Every task carries a domain tag and is only ever executed by a worker of
/// the same domain. [`Domain::Host`] workers run ordinary CPU tasks;
/// [`Domain::Device`] workers run accelerator offload tasks (the closure of a
/// device task is where a backend would materialize, launch, and synchronize
/// its native work).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Domain {
    /// CPU workers.
    Host = 0,
    /// Accelerator workers.
    Device = 1,
}

/// Total number of worker domains.
pub(crate) const NUM_DOMAINS: usize = 2;

impl Domain {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Kind of work a task performs, as exposed to observers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkKind {
    /// A plain callable.
    Static,
    /// A callable that spawns a subflow.
    Dynamic,
    /// A callable selecting one successor branch.
    Condition,
    /// A task whose body is another composed graph.
    Module,
    /// An accelerator offload callable.
    Device,
}

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used internally by the executor to enable interior mutability across
/// threads while correctness is ensured by scheduling (a slot is only ever
/// accessed by the single thread that currently owns the enclosing node or
/// topology phase).
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    /// Run `f` with a shared pointer to the contents.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent mutable access to the slot.
    pub(crate) unsafe fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        self.0.with(f)
    }

    /// Run `f` with an exclusive pointer to the contents.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent access of any kind to the
    /// slot.
    pub(crate) unsafe fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        self.0.with_mut(f)
    }
}
