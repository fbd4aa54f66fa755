use crate::debug::debug_log;
use crate::error::Error;
use crate::node::Pair;
use crate::reclaim::{Collector, Guard, Shared};
use crate::redistributor::{DefaultPairRedistributor, PairRedistributor};
use crate::segment::Segment;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The largest number of segments a map can be split into.
pub const MAX_CONCURRENCY: usize = 65536;

/// The number of buckets each segment starts out with.
pub const DEFAULT_BUCKET_NUMBER: usize = 16;

/// Hands out the identities that keep pairs and bucket tables from crossing between maps.
static NEXT_ORIGIN: AtomicUsize = AtomicUsize::new(1);

/// A concurrent map from string keys to values, split into independently locked segments.
///
/// Every key is routed to exactly one segment by its hash. Writers lock only that segment, so
/// writes to different segments never contend; readers take the segment lock just long enough
/// to find the current bucket table, then search the bucket without it. Each segment grows
/// and shrinks its bucket table on its own, as decided by its [`PairRedistributor`].
///
/// ```
/// # use segmap::ConcurrentMap;
/// let map = ConcurrentMap::new(4)?;
/// assert_eq!(map.put("a", 1)?, true);
/// assert_eq!(map.put("a", 2)?, false);
/// assert_eq!(map.get("a"), Some(2));
/// assert_eq!(map.delete("a")?, true);
/// assert_eq!(map.get("a"), None);
/// assert_eq!(map.len(), 0);
/// # Ok::<(), segmap::Error>(())
/// ```
pub struct ConcurrentMap<V, S = crate::DefaultHashBuilder> {
    segments: Box<[Segment<V>]>,
    total: AtomicUsize,
    build_hasher: S,
    /// Declared after `segments` so that it is dropped last: retired nodes and tables must
    /// not be reclaimed while the segments still point into them.
    collector: Collector,
    origin: usize,
}

// all operations that move values into the map require `V: Send + Sync`, so a map that is
// shared between threads only ever holds values that may be.

impl<V> ConcurrentMap<V, crate::DefaultHashBuilder> {
    /// Creates a map split into `concurrency` segments, using the default hasher and
    /// redistribution policy.
    ///
    /// Fails with [`Error::IllegalParameter`] if `concurrency` is zero or larger than
    /// [`MAX_CONCURRENCY`].
    pub fn new(concurrency: usize) -> Result<Self, Error> {
        Self::with_hasher(concurrency, crate::DefaultHashBuilder::default())
    }
}

impl<V, S> Default for ConcurrentMap<V, S>
where
    S: Default,
{
    /// Creates a map with four segments per CPU.
    fn default() -> Self {
        let concurrency = num_cpus::get().saturating_mul(4).clamp(1, MAX_CONCURRENCY);
        Self::from_parts(
            concurrency,
            DEFAULT_BUCKET_NUMBER,
            S::default(),
            default_redistributor,
        )
    }
}

fn default_redistributor<V>(bucket_number: usize) -> Box<dyn PairRedistributor<V>> {
    Box::new(DefaultPairRedistributor::new(bucket_number))
}

impl<V, S> ConcurrentMap<V, S> {
    /// Creates a map that routes and places keys by the hashes of `build_hasher`.
    ///
    /// The map works best when keys hash uniformly; see [`ConcurrentMap::new`] for errors.
    pub fn with_hasher(concurrency: usize, build_hasher: S) -> Result<Self, Error> {
        Self::with_options(
            concurrency,
            DEFAULT_BUCKET_NUMBER,
            build_hasher,
            default_redistributor,
        )
    }

    /// Creates a map whose segments resize according to the redistributors built by
    /// `factory`.
    ///
    /// `factory` is called once per segment with the segment's initial bucket count.
    pub fn with_redistributor<F>(
        concurrency: usize,
        build_hasher: S,
        factory: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(usize) -> Box<dyn PairRedistributor<V>>,
    {
        Self::with_options(concurrency, DEFAULT_BUCKET_NUMBER, build_hasher, factory)
    }

    /// Creates a map whose segments start out with `bucket_number` buckets each.
    ///
    /// Fails with [`Error::IllegalParameter`] if `bucket_number` is zero, and otherwise as
    /// [`ConcurrentMap::new`].
    pub fn with_options<F>(
        concurrency: usize,
        bucket_number: usize,
        build_hasher: S,
        factory: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(usize) -> Box<dyn PairRedistributor<V>>,
    {
        if concurrency == 0 {
            return Err(Error::illegal_parameter("concurrency is too small"));
        }
        if concurrency > MAX_CONCURRENCY {
            return Err(Error::illegal_parameter(format!(
                "concurrency is too large (at most {})",
                MAX_CONCURRENCY
            )));
        }
        if bucket_number == 0 {
            return Err(Error::illegal_parameter("bucket number must be positive"));
        }
        Ok(Self::from_parts(
            concurrency,
            bucket_number,
            build_hasher,
            factory,
        ))
    }

    fn from_parts<F>(
        concurrency: usize,
        bucket_number: usize,
        build_hasher: S,
        mut factory: F,
    ) -> Self
    where
        F: FnMut(usize) -> Box<dyn PairRedistributor<V>>,
    {
        let collector = Collector::new();
        let origin = NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed);
        let segments = (0..concurrency)
            .map(|id| Segment::new(bucket_number, factory(bucket_number), id, origin, &collector))
            .collect();
        debug_log!(origin, concurrency, bucket_number, "created concurrent map");
        Self {
            segments,
            total: AtomicUsize::new(0),
            build_hasher,
            collector,
            origin,
        }
    }

    /// The number of segments, fixed at construction.
    pub fn concurrency(&self) -> usize {
        self.segments.len()
    }

    /// The number of pairs in the map.
    ///
    /// This is a single atomic read. Segments update it while still locked, so it never
    /// counts a delete before the matching insert, but while other threads are writing it
    /// may not yet reflect their most recent changes.
    pub fn len(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Returns `true` if the map holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` on every pair in the map.
    ///
    /// Segments are visited one at a time, each locked while it is visited. Writes to other
    /// segments may go on meanwhile, so the pairs seen are not a snapshot of the whole map.
    ///
    /// The segment lock is held while `f` runs and is not reentrant: `f` must not call any
    /// method of this map other than [`len`](Self::len), [`is_empty`](Self::is_empty) and
    /// [`concurrency`](Self::concurrency), or it may deadlock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V),
    {
        let guard = self.collector.enter();
        for segment in self.segments.iter() {
            segment.for_each(&guard, &mut f);
        }
    }

    /// Removes every pair from the map.
    ///
    /// Like [`for_each`](Self::for_each), this clears one segment at a time.
    pub fn clear(&self) {
        let guard = self.collector.enter();
        for segment in self.segments.iter() {
            segment.clear(&self.total, &guard);
        }
    }

    /// The current bucket count of every segment, in segment order.
    pub fn bucket_numbers(&self) -> Vec<usize> {
        let guard = self.collector.enter();
        self.segments
            .iter()
            .map(|segment| segment.bucket_number(&guard))
            .collect()
    }

    fn segment_for(&self, hash: u64) -> &Segment<V> {
        let n = self.segments.len();
        if n == 1 {
            return &self.segments[0];
        }
        // the low bits pick the bucket within a segment, so route by the high ones
        &self.segments[((hash >> 32) as usize) % n]
    }
}

impl<V, S> ConcurrentMap<V, S>
where
    S: BuildHasher,
{
    fn hash(&self, key: &str) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn find<'g>(&'g self, key: &str, guard: &'g Guard<'_>) -> Option<&'g V> {
        let hash = self.hash(key);
        self.segment_for(hash)
            .get_with_hash(key, hash, guard)
            .map(|pair| pair.value(guard))
    }

    /// Returns a clone of the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let guard = self.collector.enter();
        self.find(key, &guard).cloned()
    }

    /// Calls `f` with a reference to the value stored for `key`, without cloning it.
    ///
    /// The value stays valid for the duration of the call even if another thread replaces or
    /// deletes it meanwhile. No lock is held while `f` runs, so `f` may use the map freely.
    pub fn get_and<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let guard = self.collector.enter();
        self.find(key, &guard).map(f)
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        let guard = self.collector.enter();
        self.find(key, &guard).is_some()
    }

    /// Stores `value` for `key`, returning `true` if the key was not in the map before.
    ///
    /// If the segment's redistributor fails afterwards, the value has still been stored: the
    /// error is an [`Error::PairRedistributor`] whose `applied` field holds what this method
    /// would have returned.
    pub fn put<K>(&self, key: K, value: V) -> Result<bool, Error>
    where
        K: Into<String>,
        V: Send + Sync,
    {
        let key = key.into().into_boxed_str();
        let hash = self.hash(&key);
        let guard = self.collector.enter();
        let value = Shared::boxed(value, &self.collector);
        let pair = Shared::boxed(Pair::new(key, hash, value, self.origin), &self.collector);
        self.segment_for(hash)
            .put(pair, &self.total, &self.collector, &guard)
    }

    /// Removes `key` from the map, returning `true` if it was there.
    ///
    /// Redistributor failures are reported as for [`put`](Self::put).
    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        let hash = self.hash(key);
        let guard = self.collector.enter();
        self.segment_for(hash)
            .delete(key, hash, &self.total, &self.collector, &guard)
    }
}

impl<V, S> Debug for ConcurrentMap<V, S>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.for_each(|k, v| {
            map.entry(&k, v);
        });
        map.finish()
    }
}
