//! The data a job maps over.

use std::net::SocketAddr;

use crate::error::Result;
use crate::job::{JobKey, PartitionId, SourceDescriptor};
use crate::KeyValue;

/// What a source can do beyond plain iteration. Read once when a task is
/// built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// The source can be restricted to a single partition.
    pub partition_aware: bool,
}

/// Handed to [`KeyValueSource::open`].
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub job: JobKey,
    pub member: SocketAddr,
}

/// A finite, lazily iterated sequence of key-value pairs.
///
/// Per partition the engine calls `set_partition_id` (partition-aware
/// sources only), `reset`, `open`, then `next_entry` until exhausted, and
/// finally `close` on every exit path.
pub trait KeyValueSource: Send + Sync {
    fn open(&mut self, context: &SourceContext) -> Result<()>;

    /// Rewinds to the beginning.
    fn reset(&mut self) -> Result<()>;

    fn next_entry(&mut self) -> Option<Result<KeyValue>>;

    fn close(&mut self) -> Result<()>;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    /// Restricts iteration to `partition_id`. Only called on sources whose
    /// capabilities say they are partition aware.
    fn set_partition_id(&mut self, _partition_id: PartitionId) {}
}

/// Turns a job's [`SourceDescriptor`] into a source on the local member.
pub trait SourceProvider: Send + Sync {
    fn create_source(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn KeyValueSource>>;
}
