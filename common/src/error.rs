use std::net::SocketAddr;

use thiserror::Error;

use crate::job::{JobKey, PartitionId};

pub type Result<T, E = MapReduceError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum MapReduceError {
    /// A job with the same key is already tracked on this member.
    #[error("job {0} is already registered")]
    DuplicateJob(JobKey),

    #[error("job {0} is not known on this member")]
    UnknownJob(JobKey),

    #[error("member {member} is unreachable: {reason}")]
    UnreachableMember { member: SocketAddr, reason: String },

    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("workload `{0}` is not a known workload")]
    UnknownWorkload(String),

    #[error("partition {partition_id} is out of range (partition count {partition_count})")]
    PartitionOutOfRange {
        partition_id: PartitionId,
        partition_count: usize,
    },

    #[error("partition state snapshots differ in length ({expected} != {actual})")]
    SnapshotLengthMismatch { expected: usize, actual: usize },

    #[error("partition {0} has no owner")]
    NoPartitionOwner(PartitionId),

    #[error("key-value source failed: {0}")]
    Source(String),

    #[error("workload function failed: {0}")]
    Workload(#[from] anyhow::Error),

    #[error("job {0} was cancelled")]
    Cancelled(JobKey),

    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse { request: String, response: String },

    #[error("job result channel for {0} closed before completion")]
    ChannelClosed(JobKey),
}

impl MapReduceError {
    pub fn unreachable(member: SocketAddr, reason: impl Into<String>) -> Self {
        Self::UnreachableMember {
            member,
            reason: reason.into(),
        }
    }

    pub fn source(err: impl std::fmt::Display) -> Self {
        Self::Source(err.to_string())
    }
}
