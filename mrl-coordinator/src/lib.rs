//! The job owner's side of a map-combine-reduce job.
//!
//! The member that launches a job owns it: it keeps the authoritative
//! partition state table, hands partitions to workers and decides when the
//! job is done. Every other member keeps a [`supervisor::JobSupervisor`] as
//! well, for reduce-side state and locally collected output.

pub mod jobs;
pub mod launcher;
pub mod process_info;
pub mod supervisor;

pub use jobs::{JobHandle, JobState, JobTracker};
pub use process_info::{JobProcessInformation, PartitionStates, ProcessingObserver};
pub use supervisor::{JobCompletion, JobSupervisor};
