//! Thin typed layer over `seize`: pointers to `Linked` allocations, loaded under a guard.
pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::{fmt, ptr};

/// An atomic slot holding a pointer to a `Linked<T>`, or null.
pub(crate) struct Atomic<T>(AtomicPtr<Linked<T>>);

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Loads the pointer, protecting what it points to for as long as `guard` lives.
    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        Shared::from(guard.protect(&self.0, ordering))
    }

    /// Loads the pointer without going through a guard.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to whatever this pointer leads to, because the
    /// owning structure is being dropped or was never published to other threads.
    pub(crate) unsafe fn load_unguarded<'g>(&self) -> Shared<'g, T> {
        Shared::from(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ordering: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        Shared::from(self.0.swap(new.ptr, ordering))
    }

    /// Installs `new` if the slot still holds `current`. On failure, returns what the slot
    /// held instead.
    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'g, T>,
        success: Ordering,
        failure: Ordering,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.0
            .compare_exchange(current.ptr, new.ptr, success, failure)
            .map(Shared::from)
            .map_err(Shared::from)
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(AtomicPtr::new(shared.ptr))
    }
}

/// A pointer loaded under a guard living for `'g`.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _g: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    /// Allocates `value` as a `Linked` node of `collector`.
    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    /// Takes back ownership of the allocation.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, and nothing else may still reach the allocation.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// # Safety
    ///
    /// The pointer must be non-null and must not have been reclaimed; in practice, it was
    /// loaded under a guard that is still alive, or is owned by the caller.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.ptr, other.ptr)
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _g: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

pub(crate) trait RetireShared {
    /// Hands `shared` to the collector, to be freed once no guard can still reach it.
    ///
    /// # Safety
    ///
    /// `shared` must be non-null and already unreachable for threads entering from now on.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.defer_retire(shared.ptr, seize::reclaim::boxed::<Linked<T>>) }
    }
}
