#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        cell::UnsafeCell,
        sync::atomic::{fence, AtomicBool, AtomicI64, AtomicPtr, AtomicU8, AtomicUsize, Ordering},
        sync::{Condvar, Mutex, RwLock},
        thread,
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{
        fence, AtomicBool, AtomicI64, AtomicPtr, AtomicU8, AtomicUsize, Ordering,
    };
    pub(crate) use std::{
        sync::{Condvar, Mutex, RwLock},
        thread,
    };

    /// `core::cell::UnsafeCell` behind loom's closure-based access API, so
    /// code written against the shim compiles identically under both
    /// configurations.
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(core::cell::UnsafeCell::new(val))
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }
}

pub(crate) use imp::*;
