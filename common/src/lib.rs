//! Shared vocabulary of the map-combine-reduce engine.
//!
//! Jobs are described by plain data ([`job::JobConfig`]) and executed by
//! named applications ([`Workload`]) that every cluster member resolves
//! locally. Members exchange [`message`]s over a [`cluster::Transport`] and
//! find partition owners through a [`cluster::PartitionDirectory`].

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod error;
pub mod job;
pub mod message;
pub mod source;
pub mod utils;

pub use error::{MapReduceError, Result};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// A combine function folds the values one mapper emitted for a key into a
/// single partial value before they leave the member. Same shape as [`ReduceFn`].
pub type CombineFn = ReduceFn;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,

    /// Applied per chunk, per key, before the chunk is sent or stored.
    pub combine_fn: Option<CombineFn>,

    /// Without a reducer the mapped output stays on the mapping member
    /// and is collected when the job completes.
    pub reduce_fn: Option<ReduceFn>,
}

impl Workload {
    pub fn has_reducer(&self) -> bool {
        self.reduce_fn.is_some()
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("combiner", &self.combine_fn.is_some())
            .field("reducer", &self.reduce_fn.is_some())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes a key. The partition of a key is `ihash(key) % partition_count`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// The partition a key belongs to.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> job::PartitionId {
    if partition_count == 0 {
        return 0;
    }
    ihash(key) % partition_count
}
