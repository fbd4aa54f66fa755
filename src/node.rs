use crate::error::Error;
use crate::reclaim::{Atomic, Guard, RetireShared, Shared};
use std::sync::atomic::Ordering;

/// Key-value entry in a bucket chain.
///
/// The key and its hash never change once the pair is created. The value and the link to the
/// next pair are swapped atomically, so readers can walk a chain without taking any lock.
pub(crate) struct Pair<V> {
    pub(crate) key: Box<str>,
    pub(crate) hash: u64,
    value: Atomic<V>,
    next: Atomic<Pair<V>>,
    /// Identifies the map this pair was allocated for.
    pub(crate) origin: usize,
}

impl<V> Pair<V> {
    pub(crate) fn new(key: Box<str>, hash: u64, value: Shared<'_, V>, origin: usize) -> Self {
        Self {
            key,
            hash,
            value: Atomic::from(value),
            next: Atomic::null(),
            origin,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn value<'g>(&'g self, guard: &'g Guard<'_>) -> &'g V {
        let v = self.value.load(Ordering::SeqCst, guard);
        assert!(!v.is_null());
        // safety: the value is only retired once it has been swapped out of every reachable
        // pair, and we loaded it under `guard`, so it lives at least as long as the guard.
        unsafe { v.deref() }
    }

    pub(crate) fn value_ptr<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, V> {
        self.value.load(Ordering::SeqCst, guard)
    }

    /// Replaces the value, retiring the previous one.
    ///
    /// Must only be called on a pair that is reachable from its bucket, with the owning
    /// segment locked; see `Bucket::put`.
    pub(crate) fn set_value(&self, value: Shared<'_, V>, guard: &Guard<'_>) -> Result<(), Error> {
        if value.is_null() {
            return Err(Error::illegal_parameter("value is absent"));
        }
        let old = self.value.swap(value, Ordering::SeqCst, guard);
        if !old.is_null() {
            // safety: `old` was only reachable through this pair, and we just unlinked it.
            // readers that loaded it before the swap hold guards that keep it alive.
            unsafe { guard.retire_shared(old) };
        }
        Ok(())
    }

    pub(crate) fn next<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Pair<V>> {
        self.next.load(Ordering::SeqCst, guard)
    }

    /// # Safety
    ///
    /// See [`Atomic::load_unguarded`].
    pub(crate) unsafe fn next_unguarded<'g>(&self) -> Shared<'g, Pair<V>> {
        unsafe { self.next.load_unguarded() }
    }

    /// Links `next` behind this pair.
    ///
    /// Fails if `next` was allocated for a different map: its memory is tied to another
    /// collector, and retiring it through ours would be unsound.
    pub(crate) fn set_next(&self, next: Shared<'_, Pair<V>>) -> Result<(), Error> {
        if !next.is_null() {
            // safety: callers only pass pairs they loaded under a guard or allocated
            // themselves.
            let n = unsafe { next.deref() };
            if n.origin != self.origin {
                return Err(Error::illegal_pair_type(format!(
                    "pair {:?} belongs to map #{}, not map #{}",
                    n.key, n.origin, self.origin
                )));
            }
        }
        self.next.store(next, Ordering::SeqCst);
        Ok(())
    }

    /// Creates a detached pair with the same key and the current value.
    ///
    /// The copy shares the value allocation with `self`. The caller must make sure `self`
    /// becomes unreachable (and is retired without its value) once the copy is published.
    pub(crate) fn copy(&self, guard: &Guard<'_>) -> Self {
        Self {
            key: self.key.clone(),
            hash: self.hash,
            value: Atomic::from(self.value.load(Ordering::SeqCst, guard)),
            next: Atomic::null(),
            origin: self.origin,
        }
    }

    /// Retires the value of a pair that has just been unlinked.
    ///
    /// # Safety
    ///
    /// No reachable pair may still point at this value.
    pub(crate) unsafe fn retire_value(&self, guard: &Guard<'_>) {
        let v = self.value.load(Ordering::SeqCst, guard);
        if !v.is_null() {
            unsafe { guard.retire_shared(v) };
        }
    }

    /// Frees the value of this pair immediately.
    ///
    /// # Safety
    ///
    /// The pair must not be reachable by any other thread, and no other pair may share its
    /// value.
    pub(crate) unsafe fn drop_value(&self) {
        let v = unsafe { self.value.load_unguarded() };
        if !v.is_null() {
            self.value.store(Shared::null(), Ordering::Relaxed);
            drop(unsafe { v.into_box() });
        }
    }
}

/// Frees a pair that was never published, together with its value.
///
/// # Safety
///
/// `pair` must have been allocated by the caller and never made reachable to other threads.
pub(crate) unsafe fn discard<V>(pair: Shared<'_, Pair<V>>) {
    unsafe {
        pair.deref().drop_value();
        drop(pair.into_box());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Collector;

    fn pair(key: &str, value: usize, origin: usize, collector: &Collector) -> Pair<usize> {
        Pair::new(key.into(), key.len() as u64, Shared::boxed(value, collector), origin)
    }

    #[test]
    fn value_swaps() {
        let collector = Collector::new();
        let guard = collector.enter();
        let p = pair("a", 1, 0, &collector);
        assert_eq!(p.key(), "a");
        assert_eq!(*p.value(&guard), 1);
        p.set_value(Shared::boxed(2, &collector), &guard).unwrap();
        assert_eq!(*p.value(&guard), 2);
        unsafe { p.drop_value() };
    }

    #[test]
    fn absent_value_is_rejected() {
        let collector = Collector::new();
        let guard = collector.enter();
        let p = pair("a", 1, 0, &collector);
        let e = p.set_value(Shared::null(), &guard).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::IllegalParameter);
        assert_eq!(*p.value(&guard), 1);
        unsafe { p.drop_value() };
    }

    #[test]
    fn links_only_within_one_map() {
        let collector = Collector::new();
        let guard = collector.enter();
        let head = pair("a", 1, 7, &collector);
        let same = Shared::boxed(pair("b", 2, 7, &collector), &collector);
        let foreign = Shared::boxed(pair("c", 3, 8, &collector), &collector);

        head.set_next(same).unwrap();
        assert_eq!(head.next(&guard), same);

        let e = head.set_next(foreign).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::IllegalPairType);
        // the failed link leaves the chain untouched
        assert_eq!(head.next(&guard), same);

        head.set_next(Shared::null()).unwrap();
        assert!(head.next(&guard).is_null());

        unsafe {
            head.drop_value();
            discard(same);
            discard(foreign);
        }
    }

    #[test]
    fn copy_is_detached() {
        let collector = Collector::new();
        let guard = collector.enter();
        let p = pair("key", 5, 0, &collector);
        p.set_next(Shared::boxed(pair("other", 6, 0, &collector), &collector))
            .unwrap();
        let c = p.copy(&guard);
        assert_eq!(c.key(), "key");
        assert_eq!(c.hash, p.hash);
        assert_eq!(*c.value(&guard), 5);
        assert!(c.next(&guard).is_null());
        unsafe {
            discard(p.next(&guard));
            // the copy shares its value with `p`, so only one of them may free it
            p.drop_value();
        }
    }
}
