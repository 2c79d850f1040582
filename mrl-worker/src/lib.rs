//! The mapping side of a map-combine-reduce job.
//!
//! Every member runs one [`MapCombineTask`] per job. The task pulls
//! partitions from the job owner one at a time, maps them, and streams the
//! combined output in chunks to the members owning the reduce keys.

pub mod context;
pub mod map;
pub mod task;

pub use context::MapCombineContext;
pub use map::KeyFilter;
pub use task::{ExitReason, MapCombineTask, WorkerSummary};
