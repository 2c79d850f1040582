//! Requests, responses and one-way notifications exchanged between members.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cluster::ReducerTable;
use crate::job::{Chunk, JobConfig, JobKey, JobOutput, KeyPredicate, PartitionId, PartitionState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Broadcast by the launcher: create the job's local state.
    StartJob {
        config: JobConfig,
        owner: SocketAddr,
        reducers: ReducerTable,
    },

    /// Sent to each member after every member knows the job: start the
    /// member's map-combine loop over its assigned keys.
    StartProcessing {
        job: JobKey,
        workload: String,
        keys: Option<Vec<Bytes>>,
        predicate: Option<KeyPredicate>,
    },

    /// Claim the next partition `member` should map.
    RequestPartitionMapping { job: JobKey, member: SocketAddr },

    /// Mapping of `partition_id` is done; move it towards the reduce stage.
    RequestPartitionReducing {
        job: JobKey,
        member: SocketAddr,
        partition_id: PartitionId,
        /// Number of source records mapped for this partition.
        records: u64,
        /// Members that will receive the partition's last chunk.
        reducers: Vec<SocketAddr>,
    },

    /// Fetch this member's share of the job result.
    GetResult { job: JobKey },

    CancelJob { job: JobKey },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::StartJob { .. } => "StartJob",
            Request::StartProcessing { .. } => "StartProcessing",
            Request::RequestPartitionMapping { .. } => "RequestPartitionMapping",
            Request::RequestPartitionReducing { .. } => "RequestPartitionReducing",
            Request::GetResult { .. } => "GetResult",
            Request::CancelJob { .. } => "CancelJob",
        }
    }
}

/// Outcome of a partition claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    Assigned(PartitionId),

    /// The owner no longer knows the job.
    NoSupervisor,

    /// The owner lost a race marking the partition; claim again.
    Contention,

    NoMorePartitions,
}

/// Outcome of a reduce transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReducingOutcome {
    /// The partition moved to the given state.
    Successful(PartitionState),

    NoSupervisor,

    /// The partition was not in the expected state (cancelled, or claimed
    /// by someone else).
    CheckStateFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Claim(ClaimOutcome),
    Reducing(ReducingOutcome),
    Output(JobOutput),
    /// Whether the cancel request changed anything.
    Cancelled(bool),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "Ack",
            Response::Claim(_) => "Claim",
            Response::Reducing(_) => "Reducing",
            Response::Output(_) => "Output",
            Response::Cancelled(_) => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notification {
    /// More chunks of `partition_id` follow.
    IntermediateChunk {
        job: JobKey,
        sender: SocketAddr,
        partition_id: PartitionId,
        chunk: Chunk,
    },

    /// Final chunk of `partition_id` for the receiving member.
    LastChunk {
        job: JobKey,
        sender: SocketAddr,
        partition_id: PartitionId,
        chunk: Chunk,
    },

    /// A reducer merged the last chunk of `partition_id`.
    ReducingFinished {
        job: JobKey,
        partition_id: PartitionId,
        reducer: SocketAddr,
    },

    /// The job is over; drop its state.
    DestroyJob { job: JobKey },
}

impl Notification {
    pub fn job(&self) -> &JobKey {
        match self {
            Notification::IntermediateChunk { job, .. }
            | Notification::LastChunk { job, .. }
            | Notification::ReducingFinished { job, .. }
            | Notification::DestroyJob { job } => job,
        }
    }
}
