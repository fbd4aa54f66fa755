use crate::debug::debug_log;
use crate::error::{Error, PairRedistributorError};
use crate::node::{self, Pair};
use crate::raw::{Buckets, Stamp, Table};
use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::redistributor::PairRedistributor;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What the segment lock protects besides the right to edit the buckets.
struct Writer<V> {
    redistributor: Box<dyn PairRedistributor<V>>,
    /// Bumped on every redistribution check; a rebuilt table is only accepted in the round
    /// it was built for.
    round: u64,
}

/// One independently locked shard of a map.
///
/// Writers hold the lock for the whole operation, including any resize it triggers. Readers
/// only hold it while they load the current bucket table, and walk the chain without it.
pub(crate) struct Segment<V> {
    table: Atomic<Table<V>>,
    pair_total: AtomicUsize,
    lock: Mutex<Writer<V>>,
    id: usize,
    origin: usize,
}

impl<V> Segment<V> {
    pub(crate) fn new(
        bucket_number: usize,
        redistributor: Box<dyn PairRedistributor<V>>,
        id: usize,
        origin: usize,
        collector: &Collector,
    ) -> Self {
        Self {
            table: Atomic::from(Shared::boxed(Table::new(bucket_number, origin), collector)),
            pair_total: AtomicUsize::new(0),
            lock: Mutex::new(Writer {
                redistributor,
                round: 0,
            }),
            id,
            origin,
        }
    }

    /// Inserts `pair`, returning whether its key is new to the segment.
    ///
    /// The segment takes ownership of `pair` in every case. `total` is the map-wide pair
    /// count; it is bumped before the lock is released.
    pub(crate) fn put<'g>(
        &'g self,
        pair: Shared<'g, Pair<V>>,
        total: &AtomicUsize,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Result<bool, Error> {
        let mut writer = self.lock.lock();
        // safety: the table is only retired while the lock is held, and we hold it.
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).deref() };
        // safety: the caller handed us `pair` and nobody else has seen it.
        let bucket = table.bucket_for(unsafe { pair.deref() }.hash);
        let inserted = match bucket.put(pair, true, collector, guard) {
            Ok(inserted) => inserted,
            Err(e) => {
                // safety: on error the bucket did not take `pair`.
                unsafe { node::discard(pair) };
                return Err(e);
            }
        };
        if inserted {
            total.fetch_add(1, Ordering::SeqCst);
            let pair_total = self.pair_total.fetch_add(1, Ordering::SeqCst) + 1;
            let size = bucket.size(guard);
            if let Err(source) = self.redistribute(&mut writer, pair_total, size, collector, guard)
            {
                return Err(Error::PairRedistributor {
                    applied: true,
                    source,
                });
            }
        }
        Ok(inserted)
    }

    /// Looks up `key`, whose hash the caller has already computed.
    pub(crate) fn get_with_hash<'g>(
        &'g self,
        key: &str,
        hash: u64,
        guard: &'g Guard<'_>,
    ) -> Option<&'g Pair<V>> {
        let table = {
            let _lock = self.lock.lock();
            self.table.load(Ordering::SeqCst, guard)
        };
        // safety: we loaded the table under `guard`; if a resize retires it from now on, it
        // stays around until the guard is dropped.
        let table = unsafe { table.deref() };
        table.bucket_for(hash).get(key, guard)
    }

    /// Removes `key`, returning whether it was present. `total` is updated as in `put`.
    pub(crate) fn delete(
        &self,
        key: &str,
        hash: u64,
        total: &AtomicUsize,
        collector: &Collector,
        guard: &Guard<'_>,
    ) -> Result<bool, Error> {
        let mut writer = self.lock.lock();
        // safety: see `put`.
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).deref() };
        let bucket = table.bucket_for(hash);
        if !bucket.delete(key, true, collector, guard)? {
            return Ok(false);
        }
        total.fetch_sub(1, Ordering::SeqCst);
        let pair_total = self.pair_total.fetch_sub(1, Ordering::SeqCst) - 1;
        let size = bucket.size(guard);
        if let Err(source) = self.redistribute(&mut writer, pair_total, size, collector, guard) {
            return Err(Error::PairRedistributor {
                applied: true,
                source,
            });
        }
        Ok(true)
    }

    /// The number of pairs in the segment.
    pub(crate) fn size(&self) -> usize {
        self.pair_total.load(Ordering::SeqCst)
    }

    /// Calls `f` on every pair, with the segment locked throughout. The lock is not
    /// reentrant: `f` must not call back into anything that takes it.
    pub(crate) fn for_each<F>(&self, guard: &Guard<'_>, f: &mut F)
    where
        F: FnMut(&str, &V),
    {
        let _lock = self.lock.lock();
        // safety: see `put`.
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).deref() };
        for bucket in table.buckets() {
            bucket.for_each(guard, |pair| f(pair.key(), pair.value(guard)));
        }
    }

    /// Removes every pair, returning how many there were.
    pub(crate) fn clear(&self, total: &AtomicUsize, guard: &Guard<'_>) -> usize {
        let _lock = self.lock.lock();
        // safety: see `put`.
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).deref() };
        let removed: usize = table.buckets().iter().map(|b| b.clear(guard)).sum();
        total.fetch_sub(removed, Ordering::SeqCst);
        self.pair_total.fetch_sub(removed, Ordering::SeqCst);
        removed
    }

    /// The current number of buckets.
    pub(crate) fn bucket_number(&self, guard: &Guard<'_>) -> usize {
        let _lock = self.lock.lock();
        // safety: see `put`.
        unsafe { self.table.load(Ordering::SeqCst, guard).deref() }.len()
    }

    /// Runs the redistributor after a successful mutation and installs whatever table it
    /// rebuilt. Must be called with the lock held, which `writer` proves.
    fn redistribute(
        &self,
        writer: &mut Writer<V>,
        pair_total: usize,
        bucket_size: usize,
        collector: &Collector,
        guard: &Guard<'_>,
    ) -> Result<(), PairRedistributorError> {
        writer.round = writer.round.wrapping_add(1);
        let stamp = Stamp {
            segment: self.id,
            round: writer.round,
        };
        // safety: see `put`.
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).deref() };
        let buckets = Buckets::new(table, collector, guard, stamp);
        let redistributor = &mut writer.redistributor;

        // the redistributor may be user code: a panic in it must not unwind through the
        // segment while it is mid-update
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            redistributor.update_threshold(pair_total, table.len());
            let status = redistributor.check_bucket_status(pair_total, bucket_size);
            redistributor.redistribute(status, &buckets)
        }));
        let rebuilt = match outcome {
            Ok(Ok(Some(rebuilt))) => rebuilt,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(segment = self.id, error = %e, "pair redistribution failed");
                return Err(e);
            }
            Err(payload) => {
                let e = PairRedistributorError::from_panic(payload);
                tracing::warn!(segment = self.id, error = %e, "pair redistributor panicked");
                return Err(e);
            }
        };

        if rebuilt.origin != self.origin {
            let e = PairRedistributorError::from(Error::illegal_pair_type(format!(
                "bucket table of map #{} returned to map #{}",
                rebuilt.origin, self.origin
            )));
            tracing::warn!(segment = self.id, error = %e, "rejected rebuilt bucket table");
            return Err(e);
        }
        if rebuilt.stamp != Some(stamp) {
            let e = PairRedistributorError::new(
                "bucket table was not rebuilt from the current buckets",
            );
            tracing::warn!(segment = self.id, error = %e, "rejected rebuilt bucket table");
            return Err(e);
        }

        debug_log!(
            segment = self.id,
            from = table.len(),
            to = rebuilt.len(),
            pair_total,
            "switched bucket table"
        );
        let old = self
            .table
            .swap(Shared::boxed(rebuilt, collector), Ordering::SeqCst, guard);
        // safety: the old table is unreachable now that it has been swapped out. readers that
        // loaded it hold guards that keep it alive; its pairs go with it, while their values
        // now belong to the copies in the new table.
        unsafe { guard.retire_shared(old) };
        Ok(())
    }
}

impl<V> Drop for Segment<V> {
    fn drop(&mut self) {
        // safety: we have &mut self, and the map never hands out references that outlive
        // its own borrow, so nothing else can reach the table.
        let table = unsafe { self.table.load_unguarded() };
        if table.is_null() {
            return;
        }
        self.table.store(Shared::null(), Ordering::Relaxed);
        // safety: same as above.
        let table = unsafe { table.into_box() };
        unsafe { table.drop_values() };
        drop(table);
    }
}

impl<V> fmt::Debug for Segment<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("pair_total", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redistributor::{BucketStatus, DefaultPairRedistributor};
    use crate::ErrorKind;
    use std::sync::Arc;

    const ORIGIN: usize = 11;

    fn segment(
        redistributor: Box<dyn PairRedistributor<usize>>,
        collector: &Collector,
    ) -> Segment<usize> {
        Segment::new(16, redistributor, 0, ORIGIN, collector)
    }

    fn hash(key: &str) -> u64 {
        // BKDR: deterministic, and spreads short keys well enough for these tests
        key.bytes()
            .fold(0u64, |h, b| h.wrapping_mul(13131).wrapping_add(u64::from(b)))
    }

    fn put(
        s: &Segment<usize>,
        key: &str,
        value: usize,
        total: &AtomicUsize,
        collector: &Collector,
    ) -> Result<bool, Error> {
        let guard = collector.enter();
        let pair = Shared::boxed(
            Pair::new(key.into(), hash(key), Shared::boxed(value, collector), ORIGIN),
            collector,
        );
        s.put(pair, total, collector, &guard)
    }

    fn get(s: &Segment<usize>, key: &str, collector: &Collector) -> Option<usize> {
        let guard = collector.enter();
        s.get_with_hash(key, hash(key), &guard)
            .map(|p| *p.value(&guard))
    }

    fn delete(
        s: &Segment<usize>,
        key: &str,
        total: &AtomicUsize,
        collector: &Collector,
    ) -> Result<bool, Error> {
        let guard = collector.enter();
        s.delete(key, hash(key), total, collector, &guard)
    }

    fn bucket_number(s: &Segment<usize>, collector: &Collector) -> usize {
        s.bucket_number(&collector.enter())
    }

    #[test]
    fn put_get_delete() {
        let collector = Collector::new();
        let total = AtomicUsize::new(0);
        let s = segment(Box::new(DefaultPairRedistributor::new(16)), &collector);
        assert_eq!(put(&s, "a", 1, &total, &collector), Ok(true));
        assert_eq!(put(&s, "a", 2, &total, &collector), Ok(false));
        assert_eq!(get(&s, "a", &collector), Some(2));
        assert_eq!(s.size(), 1);
        assert_eq!(total.load(Ordering::SeqCst), 1);
        assert_eq!(delete(&s, "a", &total, &collector), Ok(true));
        assert_eq!(delete(&s, "a", &total, &collector), Ok(false));
        assert_eq!(get(&s, "a", &collector), None);
        assert_eq!(s.size(), 0);
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn grows_and_shrinks_without_losing_pairs() {
        let collector = Collector::new();
        let total = AtomicUsize::new(0);
        let s = segment(Box::new(DefaultPairRedistributor::new(16)), &collector);
        let n = 20_000;
        for i in 0..n {
            assert_eq!(put(&s, &format!("key-{}", i), i, &total, &collector), Ok(true));
        }
        assert_eq!(s.size(), n);
        let grown = bucket_number(&s, &collector);
        assert!(grown >= 128, "only grew to {} buckets", grown);
        for i in 0..n {
            assert_eq!(get(&s, &format!("key-{}", i), &collector), Some(i));
        }

        let keep = 10;
        for i in keep..n {
            assert_eq!(delete(&s, &format!("key-{}", i), &total, &collector), Ok(true));
        }
        assert_eq!(s.size(), keep);
        let shrunk = bucket_number(&s, &collector);
        assert!(shrunk < grown, "stayed at {} buckets", shrunk);
        for i in 0..keep {
            assert_eq!(get(&s, &format!("key-{}", i), &collector), Some(i));
        }
        for i in keep..n {
            assert_eq!(get(&s, &format!("key-{}", i), &collector), None);
        }
    }

    #[test]
    fn for_each_and_clear() {
        let collector = Collector::new();
        let total = AtomicUsize::new(0);
        let s = segment(Box::new(DefaultPairRedistributor::new(16)), &collector);
        for (i, key) in ["x", "y", "z"].into_iter().enumerate() {
            put(&s, key, i, &total, &collector).unwrap();
        }
        let mut seen = Vec::new();
        s.for_each(&collector.enter(), &mut |k: &str, v: &usize| {
            seen.push((k.to_owned(), *v))
        });
        seen.sort();
        assert_eq!(
            seen,
            [("x".to_owned(), 0), ("y".to_owned(), 1), ("z".to_owned(), 2)]
        );

        assert_eq!(total.load(Ordering::SeqCst), 3);
        assert_eq!(s.clear(&total, &collector.enter()), 3);
        assert_eq!(s.size(), 0);
        assert_eq!(total.load(Ordering::SeqCst), 0);
        assert_eq!(get(&s, "x", &collector), None);
    }

    struct Panicking;

    impl PairRedistributor<usize> for Panicking {
        fn update_threshold(&mut self, _: usize, _: usize) {}

        fn check_bucket_status(&mut self, _: usize, _: usize) -> BucketStatus {
            panic!("check exploded");
        }

        fn redistribute(
            &mut self,
            _: BucketStatus,
            _: &Buckets<'_, usize>,
        ) -> Result<Option<Table<usize>>, PairRedistributorError> {
            Ok(None)
        }
    }

    #[test]
    fn panics_become_errors() {
        let collector = Collector::new();
        let total = AtomicUsize::new(0);
        let s = segment(Box::new(Panicking), &collector);
        let e = put(&s, "a", 1, &total, &collector).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PairRedistributor);
        assert_eq!(e.applied(), Some(true));
        match &e {
            Error::PairRedistributor { source, .. } => assert_eq!(source.message(), "check exploded"),
            other => panic!("unexpected error {:?}", other),
        }
        // the insert went through all the same
        assert_eq!(get(&s, "a", &collector), Some(1));
        assert_eq!(s.size(), 1);
        assert_eq!(total.load(Ordering::SeqCst), 1);

        // replacing a value does not consult the redistributor
        assert_eq!(put(&s, "a", 2, &total, &collector), Ok(false));

        let e = delete(&s, "a", &total, &collector).unwrap_err();
        assert_eq!(e.applied(), Some(true));
        assert_eq!(get(&s, "a", &collector), None);
        assert_eq!(s.size(), 0);
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    /// Checks the shared count from inside the segment lock.
    struct Counting(Arc<AtomicUsize>);

    impl PairRedistributor<usize> for Counting {
        fn update_threshold(&mut self, pair_total: usize, _: usize) {
            assert_eq!(self.0.load(Ordering::SeqCst), pair_total);
        }

        fn check_bucket_status(&mut self, _: usize, _: usize) -> BucketStatus {
            BucketStatus::Normal
        }

        fn redistribute(
            &mut self,
            _: BucketStatus,
            _: &Buckets<'_, usize>,
        ) -> Result<Option<Table<usize>>, PairRedistributorError> {
            Ok(None)
        }
    }

    #[test]
    fn shared_count_moves_under_the_lock() {
        let collector = Collector::new();
        let total = Arc::new(AtomicUsize::new(0));
        let s = segment(Box::new(Counting(total.clone())), &collector);
        for i in 0..50 {
            assert_eq!(put(&s, &format!("{}", i), i, &total, &collector), Ok(true));
        }
        for i in 0..50 {
            assert_eq!(delete(&s, &format!("{}", i), &total, &collector), Ok(true));
        }
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    /// Rebuilds the table on every call, but hands back one built in an earlier call.
    struct Stale {
        saved: Option<Table<usize>>,
    }

    impl PairRedistributor<usize> for Stale {
        fn update_threshold(&mut self, _: usize, _: usize) {}

        fn check_bucket_status(&mut self, _: usize, _: usize) -> BucketStatus {
            BucketStatus::Overweight
        }

        fn redistribute(
            &mut self,
            _: BucketStatus,
            buckets: &Buckets<'_, usize>,
        ) -> Result<Option<Table<usize>>, PairRedistributorError> {
            let fresh = buckets.rehash(buckets.len())?;
            Ok(self.saved.replace(fresh))
        }
    }

    #[test]
    fn stale_tables_are_rejected() {
        let collector = Collector::new();
        let total = AtomicUsize::new(0);
        let s = segment(Box::new(Stale { saved: None }), &collector);
        assert_eq!(put(&s, "a", 1, &total, &collector), Ok(true));
        let e = put(&s, "b", 2, &total, &collector).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PairRedistributor);
        assert_eq!(get(&s, "a", &collector), Some(1));
        assert_eq!(get(&s, "b", &collector), Some(2));
        assert_eq!(delete(&s, "a", &total, &collector).unwrap_err().applied(), Some(true));
        assert_eq!(get(&s, "a", &collector), None);
        assert_eq!(get(&s, "b", &collector), Some(2));
    }
}
