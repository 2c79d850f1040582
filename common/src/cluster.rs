//! Collaborators the engine consumes: who owns what, and how to reach them.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{MapReduceError, Result};
use crate::job::{Chunk, PartitionId};
use crate::message::{Notification, Request, Response};
use crate::partition_for_key;

/// Current partition ownership. Ownership changes under migration, so
/// callers query it each time instead of caching answers.
pub trait PartitionDirectory: Send + Sync {
    fn partition_count(&self) -> u32;

    /// The member currently owning `partition_id`.
    fn partition_owner(&self, partition_id: PartitionId) -> Option<SocketAddr>;

    /// Current cluster members.
    fn members(&self) -> Vec<SocketAddr>;

    /// Partitions currently owned by `member`, in ascending order.
    fn member_partitions(&self, member: SocketAddr) -> Vec<PartitionId> {
        (0..self.partition_count())
            .filter(|&partition_id| self.partition_owner(partition_id) == Some(member))
            .collect()
    }

    fn key_owner(&self, key: &[u8]) -> Option<SocketAddr> {
        self.partition_owner(partition_for_key(key, self.partition_count()))
    }
}

/// Delivery of messages to other members.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request to `target` and waits for its response.
    async fn request(&self, target: SocketAddr, request: Request) -> Result<Response>;

    /// Delivers a one-way notification to `target`.
    async fn notify(&self, target: SocketAddr, notification: Notification) -> Result<()>;
}

/// Groups keys by the member currently owning their partition.
/// Keys of unowned partitions are dropped.
pub fn map_keys_to_members(
    directory: &dyn PartitionDirectory,
    keys: &[Bytes],
) -> HashMap<SocketAddr, Vec<Bytes>> {
    let mut mapped: HashMap<SocketAddr, Vec<Bytes>> = HashMap::new();
    for key in keys {
        match directory.key_owner(key) {
            Some(member) => mapped.entry(member).or_default().push(key.clone()),
            None => tracing::warn!(key = ?key, "no owner for key, skipping"),
        }
    }
    mapped
}

/// Owner of every partition, fixed when a job is launched.
///
/// Reduce keys of a job are routed through this table for the whole run, so
/// all chunks of a key reach the same member even when the partition
/// migrates while the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerTable {
    owners: Vec<SocketAddr>,
}

impl ReducerTable {
    /// Owners indexed by partition id.
    pub fn new(owners: Vec<SocketAddr>) -> Self {
        Self { owners }
    }

    /// The current owners. Fails if a partition has no owner.
    pub fn snapshot(directory: &dyn PartitionDirectory) -> Result<Self> {
        let owners = (0..directory.partition_count())
            .map(|partition_id| {
                directory
                    .partition_owner(partition_id)
                    .ok_or(MapReduceError::NoPartitionOwner(partition_id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { owners })
    }

    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// The member reducing `key`.
    pub fn reducer_of(&self, key: &[u8]) -> Result<SocketAddr> {
        let partition_id = partition_for_key(key, self.partition_count());
        self.owners
            .get(partition_id as usize)
            .copied()
            .ok_or(MapReduceError::NoPartitionOwner(partition_id))
    }
}

/// Splits a chunk into one chunk per member reducing its keys.
pub fn map_result_to_member(
    reducers: &ReducerTable,
    chunk: Chunk,
) -> Result<HashMap<SocketAddr, Chunk>> {
    let mut mapped: HashMap<SocketAddr, Chunk> = HashMap::new();
    for (key, values) in chunk {
        let member = reducers.reducer_of(&key)?;
        mapped.entry(member).or_default().insert(key, values);
    }
    Ok(mapped)
}
