//! Bucket-count resizing policy for segments.
use crate::debug::debug_log;
use crate::error::{Error, PairRedistributorError};
use crate::raw::{Buckets, Table};

/// The default load factor applied to the average bucket size.
pub const DEFAULT_BUCKET_LOAD_FACTOR: f64 = 0.75;

/// A bucket holding more pairs than this is always overweight.
pub const DEFAULT_BUCKET_MAX_SIZE: usize = 1000;

/// The average bucket size never counts as lower than this when computing the threshold.
const MIN_AVERAGE: usize = 100;

/// Segments with fewer buckets than this are never shrunk.
const MIN_SHRINK_BUCKET_NUMBER: usize = 100;

/// Shrinking never goes below this many buckets.
const MIN_BUCKET_NUMBER: usize = 2;

/// The largest bucket count a segment will grow to.
const MAXIMUM_BUCKET_NUMBER: usize = 1 << 30;

/// The state of a bucket after a mutation, as judged by a [`PairRedistributor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketStatus {
    /// Nothing to do.
    Normal,
    /// Enough buckets of the segment have been seen empty that it may shrink.
    Underweight,
    /// The bucket has reached the size threshold, and the segment may grow.
    Overweight,
}

/// Decides when a segment's bucket array should grow or shrink, and rebuilds it.
///
/// A segment calls the three methods in order after every `put` that inserted a key and
/// every `delete` that removed one, while holding its lock. Each segment owns its own
/// redistributor, so implementations need no synchronization of their own.
///
/// Errors and panics from any of the methods are reported to the caller of the mutation as
/// [`Error::PairRedistributor`]; the segment then keeps its current buckets.
pub trait PairRedistributor<V>: Send {
    /// Recomputes thresholds from the pair count of the segment and its bucket count.
    fn update_threshold(&mut self, pair_total: usize, bucket_number: usize);

    /// Classifies the bucket that was just mutated, which now holds `bucket_size` pairs.
    fn check_bucket_status(&mut self, pair_total: usize, bucket_size: usize) -> BucketStatus;

    /// Returns a rebuilt table if the segment should switch to a different bucket count, or
    /// `None` to keep the current one.
    ///
    /// A rebuilt table can only be obtained from [`Buckets::rehash`] on the `buckets` passed
    /// to this very call.
    fn redistribute(
        &mut self,
        status: BucketStatus,
        buckets: &Buckets<'_, V>,
    ) -> Result<Option<Table<V>>, PairRedistributorError>;
}

/// The redistribution policy segments use unless told otherwise.
///
/// A bucket is overweight once it holds at least `load_factor` times the average bucket size
/// (with the average taken to be at least 100), or more than [`DEFAULT_BUCKET_MAX_SIZE`]
/// pairs. The segment doubles its buckets once a quarter of its bucket count has been seen
/// overweight. It halves them, down to no fewer than two, once it has at least 100 buckets and
/// a quarter of them have been seen empty after a delete. Both tallies restart whenever a
/// resize is decided.
#[derive(Clone, Debug)]
pub struct DefaultPairRedistributor {
    load_factor: f64,
    upper_threshold: usize,
    overweight_bucket_count: usize,
    empty_bucket_count: usize,
    bucket_number: usize,
}

impl DefaultPairRedistributor {
    /// Creates a redistributor for a segment of `bucket_number` buckets with
    /// [`DEFAULT_BUCKET_LOAD_FACTOR`].
    pub fn new(bucket_number: usize) -> Self {
        let mut pr = Self {
            load_factor: DEFAULT_BUCKET_LOAD_FACTOR,
            upper_threshold: 0,
            overweight_bucket_count: 0,
            empty_bucket_count: 0,
            bucket_number,
        };
        pr.update(0, bucket_number);
        pr
    }

    /// Creates a redistributor with a custom load factor.
    ///
    /// Fails with [`Error::IllegalParameter`] unless `load_factor` is finite and positive.
    pub fn with_load_factor(load_factor: f64, bucket_number: usize) -> Result<Self, Error> {
        if !load_factor.is_finite() || load_factor <= 0.0 {
            return Err(Error::illegal_parameter(format!(
                "load factor {} is not a positive number",
                load_factor
            )));
        }
        let mut pr = Self::new(bucket_number);
        pr.load_factor = load_factor;
        pr.update(0, bucket_number);
        Ok(pr)
    }

    /// The load factor in use.
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// The bucket size from which a bucket counts as overweight.
    pub fn upper_threshold(&self) -> usize {
        self.upper_threshold
    }

    fn update(&mut self, pair_total: usize, bucket_number: usize) {
        let bucket_number = bucket_number.max(1);
        let average = (pair_total / bucket_number).max(MIN_AVERAGE);
        self.upper_threshold = (average as f64 * self.load_factor) as usize;
        self.bucket_number = bucket_number;
    }

    fn reset(&mut self) {
        self.overweight_bucket_count = 0;
        self.empty_bucket_count = 0;
    }
}

impl<V> PairRedistributor<V> for DefaultPairRedistributor {
    fn update_threshold(&mut self, pair_total: usize, bucket_number: usize) {
        self.update(pair_total, bucket_number);
        debug_log!(
            pair_total,
            bucket_number,
            upper_threshold = self.upper_threshold,
            empty_bucket_count = self.empty_bucket_count,
            "updated bucket threshold"
        );
    }

    fn check_bucket_status(&mut self, pair_total: usize, bucket_size: usize) -> BucketStatus {
        let status = if bucket_size > DEFAULT_BUCKET_MAX_SIZE || bucket_size >= self.upper_threshold
        {
            self.overweight_bucket_count += 1;
            BucketStatus::Overweight
        } else if bucket_size == 0 {
            self.empty_bucket_count += 1;
            if self.empty_bucket_count * 4 >= self.bucket_number {
                BucketStatus::Underweight
            } else {
                BucketStatus::Normal
            }
        } else {
            BucketStatus::Normal
        };
        debug_log!(
            pair_total,
            bucket_size,
            upper_threshold = self.upper_threshold,
            overweight_bucket_count = self.overweight_bucket_count,
            empty_bucket_count = self.empty_bucket_count,
            ?status,
            "checked bucket status"
        );
        status
    }

    fn redistribute(
        &mut self,
        status: BucketStatus,
        buckets: &Buckets<'_, V>,
    ) -> Result<Option<Table<V>>, PairRedistributorError> {
        let current = buckets.len();
        let target = match status {
            BucketStatus::Overweight => {
                if self.overweight_bucket_count * 4 < current {
                    return Ok(None);
                }
                current.saturating_mul(2).min(MAXIMUM_BUCKET_NUMBER)
            }
            BucketStatus::Underweight => {
                if current < MIN_SHRINK_BUCKET_NUMBER || self.empty_bucket_count * 4 < current {
                    return Ok(None);
                }
                (current / 2).max(MIN_BUCKET_NUMBER)
            }
            BucketStatus::Normal => return Ok(None),
        };

        self.reset();
        if target == current {
            return Ok(None);
        }

        debug_log!(?status, current, target, "redistributing pairs");
        let table = buckets.rehash(target)?;
        Ok(Some(table))
    }
}
