//! Per-job partition state table held by the job owner.
//!
//! The table is an immutable snapshot swapped as a whole with
//! compare-and-swap. Readers never lock and never see a half-written
//! snapshot; writers copy, modify and retry against the latest snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

use common::job::{JobPartitionState, PartitionId};
use common::{MapReduceError, Result};

/// One published snapshot, indexed by partition id.
pub type PartitionStates = Arc<Vec<JobPartitionState>>;

/// Told after every successful state transition.
pub trait ProcessingObserver: Send + Sync {
    fn check_fully_processed(&self, info: &JobProcessInformation);
}

pub struct JobProcessInformation {
    partition_states: ArcSwap<Vec<JobPartitionState>>,
    processed_records: AtomicU64,
    observer: Weak<dyn ProcessingObserver>,
}

impl JobProcessInformation {
    /// A table with every partition `WAITING`.
    pub fn new(partition_count: usize, observer: Weak<dyn ProcessingObserver>) -> Self {
        Self {
            partition_states: ArcSwap::from_pointee(vec![JobPartitionState::WAITING; partition_count]),
            processed_records: AtomicU64::new(0),
            observer,
        }
    }

    /// The latest published snapshot.
    pub fn partition_states(&self) -> PartitionStates {
        self.partition_states.load_full()
    }

    pub fn partition_count(&self) -> usize {
        self.partition_states.load().len()
    }

    pub fn processed_records(&self) -> u64 {
        self.processed_records.load(Ordering::Acquire)
    }

    pub fn add_processed_records(&self, records: u64) {
        self.processed_records.fetch_add(records, Ordering::AcqRel);
    }

    /// Replaces the entry of `partition_id` if it still equals `expected`.
    ///
    /// Returns `Ok(false)` without touching anything when the entry holds a
    /// different value. Losing a race against a writer of another entry is
    /// retried internally.
    pub fn update_partition_state(
        &self,
        partition_id: PartitionId,
        expected: JobPartitionState,
        new: JobPartitionState,
    ) -> Result<bool> {
        let index = partition_id as usize;
        loop {
            let current = self.partition_states();
            let Some(entry) = current.get(index) else {
                return Err(MapReduceError::PartitionOutOfRange {
                    partition_id,
                    partition_count: current.len(),
                });
            };
            if *entry != expected {
                return Ok(false);
            }

            let mut next = current.to_vec();
            next[index] = new;
            if self.update_partition_states(&current, next.into())? {
                return Ok(true);
            }
        }
    }

    /// Publishes `new` if `expected` is still the live snapshot.
    pub fn update_partition_states(
        &self,
        expected: &PartitionStates,
        new: PartitionStates,
    ) -> Result<bool> {
        if expected.len() != new.len() {
            return Err(MapReduceError::SnapshotLengthMismatch {
                expected: expected.len(),
                actual: new.len(),
            });
        }

        let previous = self.partition_states.compare_and_swap(expected, new);
        if !Arc::ptr_eq(&*previous, expected) {
            return Ok(false);
        }
        drop(previous);

        if let Some(observer) = self.observer.upgrade() {
            observer.check_fully_processed(self);
        }
        Ok(true)
    }
}

impl fmt::Debug for JobProcessInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcessInformation")
            .field("processed_records", &self.processed_records())
            .field("partition_states", &self.partition_states())
            .finish()
    }
}
