use crate::error::Error;
use crate::node::Pair;
use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use std::fmt;
use std::sync::atomic::Ordering;

/// One hash slot: the head of a singly linked chain of pairs.
///
/// Readers walk the chain without locking. Structural edits never rewrite the links of a
/// chain that readers may be walking; they build a replacement prefix and swap the head.
pub(crate) struct Bucket<V> {
    head: Atomic<Pair<V>>,
}

/// The result of rebuilding the front of a chain around one pair.
struct Splice<'g, V> {
    /// Head of the replacement chain.
    head: Shared<'g, Pair<V>>,
    /// Fresh copies of the pairs in front of the match.
    copies: Vec<Shared<'g, Pair<V>>>,
    /// The old pairs in front of the match, followed by the match itself.
    unlinked: Vec<Shared<'g, Pair<V>>>,
}

impl<'g, V> Splice<'g, V> {
    /// Frees a replacement chain that lost the race for the head.
    ///
    /// # Safety
    ///
    /// The replacement chain must never have been published.
    unsafe fn abandon(self) {
        for copy in self.copies {
            // the copies borrow their values from the old chain, so only the pairs go
            drop(unsafe { copy.into_box() });
        }
    }

    /// Retires the old front of the chain once the replacement is installed.
    ///
    /// # Safety
    ///
    /// The replacement chain must have been installed as the head of the bucket.
    unsafe fn commit(self, guard: &Guard<'_>) {
        let mut unlinked = self.unlinked;
        if let Some(matched) = unlinked.pop() {
            unsafe {
                // the value of the matched pair was either removed or replaced
                matched.deref().retire_value(guard);
                guard.retire_shared(matched);
            }
        }
        for old in unlinked {
            // the copies took over these values
            unsafe { guard.retire_shared(old) };
        }
    }
}

impl<V> Bucket<V> {
    pub(crate) fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    pub(crate) fn first_pair<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Pair<V>> {
        self.head.load(Ordering::SeqCst, guard)
    }

    pub(crate) fn get<'g>(&self, key: &str, guard: &'g Guard<'_>) -> Option<&'g Pair<V>> {
        Self::find(self.first_pair(guard), key, guard)
    }

    /// Inserts `pair`, or moves its value into the pair already holding its key.
    ///
    /// Returns `true` if the key was not present before. On success the bucket has taken
    /// ownership of `pair`; on error it is left to the caller.
    ///
    /// With `lock_held` the caller guarantees that no other writer touches this bucket, so an
    /// existing pair gets its value swapped in place and a new one is stored as the head.
    /// Without it, every edit is a compare-and-swap of the head; replacing a value then also
    /// rebuilds the front of the chain, so a racing writer never writes through a pair that
    /// has just been unlinked.
    pub(crate) fn put<'g>(
        &self,
        pair: Shared<'g, Pair<V>>,
        lock_held: bool,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Result<bool, Error> {
        // safety: `pair` is owned by the caller until we publish it.
        let new = unsafe { pair.deref() };
        loop {
            let head = self.first_pair(guard);
            if let Some(existing) = Self::find(head, new.key(), guard) {
                if lock_held {
                    existing.set_value(new.value_ptr(guard), guard)?;
                    // safety: `pair` was never published and its value now lives in
                    // `existing`.
                    drop(unsafe { pair.into_box() });
                    return Ok(false);
                }
                let splice = match self.splice(head, new.key(), pair, collector, guard)? {
                    Some(splice) => splice,
                    None => continue,
                };
                match self.head.compare_exchange(
                    head,
                    splice.head,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => {
                        // safety: the replacement chain is now the head.
                        unsafe { splice.commit(guard) };
                        return Ok(false);
                    }
                    Err(_) => {
                        // safety: the replacement chain was never visible.
                        unsafe { splice.abandon() };
                        continue;
                    }
                }
            }

            new.set_next(head)?;
            if lock_held {
                self.head.store(pair, Ordering::SeqCst);
                return Ok(true);
            }
            if self
                .head
                .compare_exchange(head, pair, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    /// Removes the pair holding `key`, returning whether there was one.
    ///
    /// The pairs in front of it are copied into a new chain that links straight to the pairs
    /// behind it, and that chain is installed as the new head.
    pub(crate) fn delete(
        &self,
        key: &str,
        lock_held: bool,
        collector: &Collector,
        guard: &Guard<'_>,
    ) -> Result<bool, Error> {
        loop {
            let head = self.first_pair(guard);
            let splice = match self.splice(head, key, Shared::null(), collector, guard)? {
                Some(splice) => splice,
                None => return Ok(false),
            };
            if lock_held {
                self.head.store(splice.head, Ordering::SeqCst);
            } else if self
                .head
                .compare_exchange(head, splice.head, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_err()
            {
                // safety: the replacement chain was never visible.
                unsafe { splice.abandon() };
                continue;
            }
            // safety: the replacement chain is now the head.
            unsafe { splice.commit(guard) };
            return Ok(true);
        }
    }

    /// Counts the pairs in the chain.
    pub(crate) fn size(&self, guard: &Guard<'_>) -> usize {
        let mut n = 0;
        let mut current = self.first_pair(guard);
        while !current.is_null() {
            n += 1;
            // safety: see `find`.
            current = unsafe { current.deref() }.next(guard);
        }
        n
    }

    /// Empties the bucket, retiring every pair and value in it. Returns how many pairs were
    /// removed.
    pub(crate) fn clear(&self, guard: &Guard<'_>) -> usize {
        let mut current = self.head.swap(Shared::null(), Ordering::SeqCst, guard);
        let mut n = 0;
        while !current.is_null() {
            // safety: the chain is no longer reachable from the bucket. concurrent readers
            // that got in before the swap are protected by their guards.
            let pair = unsafe { current.deref() };
            let next = pair.next(guard);
            unsafe {
                pair.retire_value(guard);
                guard.retire_shared(current);
            }
            current = next;
            n += 1;
        }
        n
    }

    /// Visits every pair in the chain.
    pub(crate) fn for_each<'g, F>(&self, guard: &'g Guard<'_>, mut f: F)
    where
        F: FnMut(&'g Pair<V>),
        V: 'g,
    {
        let mut current = self.first_pair(guard);
        while !current.is_null() {
            // safety: see `find`.
            let pair: &'g Pair<V> = unsafe { current.deref() };
            f(pair);
            current = pair.next(guard);
        }
    }

    fn find<'g>(
        mut current: Shared<'g, Pair<V>>,
        key: &str,
        guard: &'g Guard<'_>,
    ) -> Option<&'g Pair<V>> {
        while !current.is_null() {
            // safety: pairs are only retired after being unlinked, and we reached this one
            // through links loaded under `guard`.
            let pair: &'g Pair<V> = unsafe { current.deref() };
            if pair.key() == key {
                return Some(pair);
            }
            current = pair.next(guard);
        }
        None
    }

    /// Builds a chain equal to the one starting at `head`, except that the pair holding `key`
    /// is replaced by `replacement`, or dropped if `replacement` is null.
    ///
    /// Returns `None` if `key` is not in the chain.
    fn splice<'g>(
        &self,
        head: Shared<'g, Pair<V>>,
        key: &str,
        replacement: Shared<'g, Pair<V>>,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Result<Option<Splice<'g, V>>, Error>
    where
        V: 'g,
    {
        let mut unlinked = Vec::new();
        let mut current = head;
        let matched = loop {
            if current.is_null() {
                return Ok(None);
            }
            // safety: see `find`.
            let pair: &'g Pair<V> = unsafe { current.deref() };
            if pair.key() == key {
                break pair;
            }
            unlinked.push(current);
            current = pair.next(guard);
        };

        let mut tail = matched.next(guard);
        if !replacement.is_null() {
            // safety: the caller owns `replacement`.
            unsafe { replacement.deref() }.set_next(tail)?;
            tail = replacement;
        }

        let mut copies = Vec::with_capacity(unlinked.len());
        for old in unlinked.iter().rev() {
            // safety: `old` was loaded under `guard`.
            let copy = Shared::boxed(unsafe { old.deref() }.copy(guard), collector);
            copies.push(copy);
            // safety: we just allocated `copy`.
            if let Err(e) = unsafe { copy.deref() }.set_next(tail) {
                for copy in copies {
                    drop(unsafe { copy.into_box() });
                }
                return Err(e);
            }
            tail = copy;
        }
        unlinked.push(current);

        Ok(Some(Splice {
            head: tail,
            copies,
            unlinked,
        }))
    }

    /// Frees every pair in the chain, and with `with_values` their values too.
    ///
    /// # Safety
    ///
    /// No other thread may be able to reach this bucket, and the pairs must not be reachable
    /// from anywhere else.
    unsafe fn drop_chain(&self, with_values: bool) {
        let mut current = unsafe { self.head.load_unguarded() };
        self.head.store(Shared::null(), Ordering::Relaxed);
        while !current.is_null() {
            let pair = unsafe { current.deref() };
            let next = unsafe { pair.next_unguarded() };
            if with_values {
                unsafe { pair.drop_value() };
            }
            drop(unsafe { current.into_box() });
            current = next;
        }
    }
}

/// Identifies the redistribution round a bucket table was rebuilt in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Stamp {
    pub(crate) segment: usize,
    pub(crate) round: u64,
}

/// The bucket array of one segment.
///
/// A `Table` handed back by a [`PairRedistributor`](crate::PairRedistributor) comes from
/// [`Buckets::rehash`], and is only accepted by the segment and round it was built for.
pub struct Table<V> {
    bins: Box<[Bucket<V>]>,
    pub(crate) origin: usize,
    pub(crate) stamp: Option<Stamp>,
}

impl<V> Table<V> {
    pub(crate) fn new(bins: usize, origin: usize) -> Self {
        Self {
            bins: (0..bins).map(|_| Bucket::new()).collect(),
            origin,
            stamp: None,
        }
    }

    /// The number of buckets.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Whether the table has no buckets at all.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        (hash % self.bins.len() as u64) as usize
    }

    #[inline]
    pub(crate) fn bucket_for(&self, hash: u64) -> &Bucket<V> {
        &self.bins[self.bini(hash)]
    }

    pub(crate) fn buckets(&self) -> &[Bucket<V>] {
        &self.bins
    }

    /// Frees the values of every pair in the table.
    ///
    /// # Safety
    ///
    /// The table must be the live table of a segment that is being dropped.
    pub(crate) unsafe fn drop_values(&self) {
        for bin in self.bins.iter() {
            unsafe { bin.drop_chain(true) };
        }
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so the table is no longer reachable by any reader. its
        // pairs are not shared with any other table: tables are rebuilt from copies. values,
        // however, may have been moved into a newer table, so they are left alone here.
        for bin in self.bins.iter() {
            unsafe { bin.drop_chain(false) };
        }
    }
}

impl<V> fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("buckets", &self.bins.len())
            .field("origin", &self.origin)
            .finish()
    }
}

/// A segment's current buckets, as seen by a [`PairRedistributor`](crate::PairRedistributor)
/// while the segment is locked.
pub struct Buckets<'a, V> {
    table: &'a Table<V>,
    collector: &'a Collector,
    guard: &'a Guard<'a>,
    stamp: Stamp,
}

impl<'a, V> Buckets<'a, V> {
    pub(crate) fn new(
        table: &'a Table<V>,
        collector: &'a Collector,
        guard: &'a Guard<'a>,
        stamp: Stamp,
    ) -> Self {
        Self {
            table,
            collector,
            guard,
            stamp,
        }
    }

    /// The number of buckets in the segment.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the segment has no buckets. Never true for a live segment.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The number of pairs in the bucket at `index`.
    pub fn bucket_size(&self, index: usize) -> Option<usize> {
        self.table.bins.get(index).map(|b| b.size(self.guard))
    }

    /// The number of pairs across all buckets, counted by walking every chain.
    pub fn pair_total(&self) -> usize {
        self.table.bins.iter().map(|b| b.size(self.guard)).sum()
    }

    /// Builds a table with `bucket_number` buckets holding every pair of the segment.
    ///
    /// The segment only switches to the new table if it is returned from
    /// [`PairRedistributor::redistribute`](crate::PairRedistributor::redistribute) in the
    /// same call.
    pub fn rehash(&self, bucket_number: usize) -> Result<Table<V>, Error> {
        if bucket_number == 0 {
            return Err(Error::illegal_parameter("bucket number must be positive"));
        }

        let mut pairs = Vec::new();
        for bin in self.table.bins.iter() {
            bin.for_each(self.guard, |pair| pairs.push(pair));
        }

        let mut table = Table::new(bucket_number, self.table.origin);
        table.stamp = Some(self.stamp);
        for pair in pairs {
            let copy = Shared::boxed(pair.copy(self.guard), self.collector);
            // nobody else can see `table` yet
            if let Err(e) = table
                .bucket_for(pair.hash)
                .put(copy, true, self.collector, self.guard)
            {
                // safety: `copy` was never published. its value still belongs to `pair`.
                drop(unsafe { copy.into_box() });
                return Err(e);
            }
        }
        Ok(table)
    }
}

impl<V> fmt::Debug for Buckets<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.table.bins.iter().map(|b| b.size(self.guard)))
            .finish()
    }
}
