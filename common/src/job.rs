use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MapReduceError, Result};

pub type PartitionId = u32;

/// Default number of emitted values buffered before a chunk is cut.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Identifies one run of a job. `name` is the logical computation,
/// `job_id` tells concurrent runs of the same name apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub job_id: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.job_id)
    }
}

/// Lifecycle of a single partition within a job.
///
/// Moves forward only: `Waiting -> Mapping -> Reducing -> Processed`
/// (`Reducing` is skipped when nothing is sent to a reducer).
/// `Cancelled` can replace any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    Waiting,
    Mapping,
    Reducing,
    Processed,
    Cancelled,
}

impl PartitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Processed | PartitionState::Cancelled)
    }
}

/// An entry of the partition state table: the state plus the member that
/// claimed the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobPartitionState {
    pub owner: Option<SocketAddr>,
    pub state: PartitionState,
}

impl JobPartitionState {
    pub const WAITING: JobPartitionState = JobPartitionState {
        owner: None,
        state: PartitionState::Waiting,
    };

    pub fn new(owner: SocketAddr, state: PartitionState) -> Self {
        Self {
            owner: Some(owner),
            state,
        }
    }

    /// Same owner, different state.
    pub fn with_state(&self, state: PartitionState) -> Self {
        Self {
            owner: self.owner,
            state,
        }
    }
}

impl Default for JobPartitionState {
    fn default() -> Self {
        Self::WAITING
    }
}

/// Which distributed data set a job reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceDescriptor {
    /// A partitioned map, by name.
    Map { name: String },
}

/// Optional filter over input keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPredicate {
    Prefix(Bytes),
    Contains(Bytes),
    OneOf(Vec<Bytes>),
    Not(Box<KeyPredicate>),
}

impl KeyPredicate {
    pub fn test(&self, key: &[u8]) -> bool {
        match self {
            KeyPredicate::Prefix(prefix) => key.starts_with(prefix),
            KeyPredicate::Contains(needle) => {
                needle.is_empty() || key.windows(needle.len()).any(|w| w == needle.as_ref())
            }
            KeyPredicate::OneOf(keys) => keys.iter().any(|k| k.as_ref() == key),
            KeyPredicate::Not(inner) => !inner.test(key),
        }
    }
}

/// Everything a member needs to take part in a job. Immutable once launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub job_id: String,

    /// Name of the workload every member resolves locally.
    pub workload: String,

    /// Auxiliary arguments to pass to the MapReduce application.
    pub aux: Vec<String>,

    /// Number of emitted values buffered before a chunk is cut.
    pub chunk_size: usize,

    pub source: SourceDescriptor,

    /// Restricts the job to these input keys, when set.
    pub keys: Option<Vec<Bytes>>,

    pub predicate: Option<KeyPredicate>,
}

impl JobConfig {
    /// A new job reading the map `source` with a fresh job id.
    pub fn new(name: impl Into<String>, workload: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_id: Uuid::new_v4().to_string(),
            workload: workload.into(),
            aux: vec![],
            chunk_size: DEFAULT_CHUNK_SIZE,
            source: SourceDescriptor::Map {
                name: source.into(),
            },
            keys: None,
            predicate: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_aux(mut self, aux: Vec<String>) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_keys(mut self, keys: Vec<Bytes>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_predicate(mut self, predicate: KeyPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.name.clone(), self.job_id.clone())
    }

    /// Auxiliary arguments as handed to workload functions.
    pub fn aux_bytes(&self) -> Bytes {
        Bytes::from(self.aux.join(" "))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MapReduceError::InvalidConfig("job name is empty".into()));
        }
        if self.workload.is_empty() {
            return Err(MapReduceError::InvalidConfig("workload name is empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(MapReduceError::InvalidConfig(
                "chunk size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A batch of mapped (and possibly combined) output, keyed by output key.
pub type Chunk = HashMap<Bytes, Vec<Bytes>>;

/// The final result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutput {
    /// One value per key, produced by the reducer.
    Reduced(BTreeMap<Bytes, Bytes>),

    /// All mapped values per key, collected from the mapping members.
    Mapped(BTreeMap<Bytes, Vec<Bytes>>),
}

impl JobOutput {
    pub fn len(&self) -> usize {
        match self {
            JobOutput::Reduced(map) => map.len(),
            JobOutput::Mapped(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges a partial result from another member into this one.
    pub fn merge(&mut self, other: JobOutput) {
        match (self, other) {
            (JobOutput::Reduced(into), JobOutput::Reduced(from)) => into.extend(from),
            (JobOutput::Mapped(into), JobOutput::Mapped(from)) => {
                for (key, values) in from {
                    into.entry(key).or_default().extend(values);
                }
            }
            (JobOutput::Reduced(_), JobOutput::Mapped(_))
            | (JobOutput::Mapped(_), JobOutput::Reduced(_)) => {
                tracing::warn!("dropping partial result of a different kind");
            }
        }
    }
}
