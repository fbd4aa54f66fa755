//! A concurrent map from string keys to values, sharded into independently locked segments.
//!
//! A [`ConcurrentMap`] is split into a fixed number of segments when it is created. A key's
//! hash picks its segment, and then its bucket within that segment. Each bucket is a singly
//! linked chain of pairs.
//!
//! # Reads and writes
//!
//! Writers lock the one segment their key belongs to and hold that lock for the whole
//! operation. Readers take the lock only to look up which bucket table the segment currently
//! uses, and then walk the chain without it. To make that safe, writers never edit a chain
//! that a reader might be walking: replacing a value swaps it atomically, while inserting
//! installs a new head and deleting installs a fresh copy of the pairs in front of the removed
//! one. A reader therefore always sees a chain either from before or after an edit.
//!
//! Unlinked pairs, replaced values and outgrown tables are reclaimed with [`seize`] once no
//! reader can still hold them.
//!
//! # Resizing
//!
//! Every segment has its own [`PairRedistributor`], consulted after each insert of a new key
//! and each delete. The default, [`DefaultPairRedistributor`], doubles a segment's buckets once
//! a quarter of them have been seen overweight, and halves them once a quarter have been seen
//! empty. Custom policies can be plugged in with [`ConcurrentMap::with_redistributor`].
//!
//! A redistributor that fails or panics does not undo the write that triggered it: the write
//! is applied, the segment keeps its buckets, and the failure comes back as
//! [`Error::PairRedistributor`].
//!
//! # Diagnostics
//!
//! [`set_debug`] switches on `tracing` events for threshold updates, bucket checks and
//! resizes. Failed redistributions are logged at `WARN` regardless.
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

mod debug;
mod error;
mod map;
mod node;
mod raw;
mod reclaim;
mod redistributor;
mod segment;

#[cfg(feature = "serde")]
mod serde_impls;

pub use debug::{debug_enabled, set_debug};
pub use error::{Error, ErrorKind, PairRedistributorError};
pub use map::{ConcurrentMap, DEFAULT_BUCKET_NUMBER, MAX_CONCURRENCY};
pub use raw::{Buckets, Table};
pub use redistributor::{
    BucketStatus, DefaultPairRedistributor, PairRedistributor, DEFAULT_BUCKET_LOAD_FACTOR,
    DEFAULT_BUCKET_MAX_SIZE,
};

/// Default hasher for [`ConcurrentMap`].
pub type DefaultHashBuilder = ahash::RandomState;
