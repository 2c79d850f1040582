use std::net::SocketAddr;

use parking_lot::RwLock;
use tracing::info;

use common::cluster::PartitionDirectory;
use common::job::PartitionId;
use common::{MapReduceError, Result};

/// Partition ownership of a local cluster.
///
/// Partitions are dealt round robin over the members when the cluster is
/// built, and can be moved with [`ClusterDirectory::migrate`] at any time.
#[derive(Debug)]
pub struct ClusterDirectory {
    members: RwLock<Vec<SocketAddr>>,

    /// Owner of every partition, indexed by partition id.
    owners: RwLock<Vec<SocketAddr>>,
}

impl ClusterDirectory {
    pub fn new(members: Vec<SocketAddr>, partition_count: u32) -> Result<Self> {
        if members.is_empty() {
            return Err(MapReduceError::InvalidConfig(
                "a cluster needs at least one member".into(),
            ));
        }
        let owners = (0..partition_count as usize)
            .map(|partition_id| members[partition_id % members.len()])
            .collect();
        Ok(Self {
            members: RwLock::new(members),
            owners: RwLock::new(owners),
        })
    }

    /// Moves `partition_id` to `member`.
    pub fn migrate(&self, partition_id: PartitionId, member: SocketAddr) -> Result<()> {
        if !self.members.read().contains(&member) {
            return Err(MapReduceError::unreachable(member, "not a cluster member"));
        }
        let mut owners = self.owners.write();
        let partition_count = owners.len();
        let owner = owners
            .get_mut(partition_id as usize)
            .ok_or(MapReduceError::PartitionOutOfRange {
                partition_id,
                partition_count,
            })?;
        info!(partition_id, from = %owner, to = %member, "partition migrated");
        *owner = member;
        Ok(())
    }

    /// Drops `member` and deals its partitions round robin over the rest.
    pub fn remove_member(&self, member: SocketAddr) -> Result<()> {
        let mut members = self.members.write();
        if members.len() == 1 && members[0] == member {
            return Err(MapReduceError::InvalidConfig(
                "cannot remove the last member".into(),
            ));
        }
        members.retain(|m| *m != member);

        let mut next = members.iter().cycle();
        for owner in self.owners.write().iter_mut().filter(|o| **o == member) {
            if let Some(&replacement) = next.next() {
                *owner = replacement;
            }
        }
        info!(%member, "member removed");
        Ok(())
    }
}

impl PartitionDirectory for ClusterDirectory {
    fn partition_count(&self) -> u32 {
        self.owners.read().len() as u32
    }

    fn partition_owner(&self, partition_id: PartitionId) -> Option<SocketAddr> {
        self.owners.read().get(partition_id as usize).copied()
    }

    fn members(&self) -> Vec<SocketAddr> {
        self.members.read().clone()
    }

    fn member_partitions(&self, member: SocketAddr) -> Vec<PartitionId> {
        self.owners
            .read()
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == member)
            .map(|(partition_id, _)| partition_id as PartitionId)
            .collect()
    }
}
