use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use common::job::{JobConfig, JobKey, JobOutput};
use common::{MapReduceError, Result};

/// State of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Registered, not yet started on every member.
    Pending,

    /// Workers are mapping and reducing.
    Running,

    /// Job completed.
    Completed,

    /// Launch or result collection failed.
    Failed,

    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A job context.
#[derive(Debug)]
struct TrackedJob {
    state: JobState,

    /// Taken when the job resolves.
    result_tx: Option<oneshot::Sender<Result<JobOutput>>>,
}

/// Jobs launched from this member.
///
/// Finished jobs are kept in order to maintain history.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: DashMap<JobKey, TrackedJob>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `config` and returns the handle its result resolves.
    pub fn register(&self, config: &JobConfig) -> Result<JobHandle> {
        let job = config.key();
        let (result_tx, result_rx) = oneshot::channel();
        match self.jobs.entry(job.clone()) {
            Entry::Occupied(_) => Err(MapReduceError::DuplicateJob(job)),
            Entry::Vacant(slot) => {
                slot.insert(TrackedJob {
                    state: JobState::Pending,
                    result_tx: Some(result_tx),
                });
                Ok(JobHandle {
                    job,
                    receiver: result_rx,
                })
            }
        }
    }

    /// Moves the job to `state`. A finished job keeps its final state.
    pub fn set_state(&self, job: &JobKey, state: JobState) {
        if let Some(mut tracked) = self.jobs.get_mut(job) {
            if tracked.state.is_finished() {
                debug!(%job, current = ?tracked.state, requested = ?state, "job already finished");
                return;
            }
            tracked.state = state;
        }
    }

    /// Resolves the job's handle with `result`. Later calls are ignored.
    pub fn complete(&self, job: &JobKey, result: Result<JobOutput>) {
        let Some(mut tracked) = self.jobs.get_mut(job) else {
            warn!(%job, "completing a job that is not tracked");
            return;
        };
        let Some(result_tx) = tracked.result_tx.take() else {
            debug!(%job, "job already resolved");
            return;
        };
        tracked.state = match &result {
            Ok(_) => JobState::Completed,
            Err(MapReduceError::Cancelled(_)) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        drop(tracked);

        if result_tx.send(result).is_err() {
            debug!(%job, "job handle dropped before completion");
        }
    }

    /// Marks the job failed without a result; its handle sees the channel close.
    pub fn fail(&self, job: &JobKey) {
        if let Some(mut tracked) = self.jobs.get_mut(job) {
            tracked.state = JobState::Failed;
            tracked.result_tx = None;
        }
    }

    pub fn state(&self, job: &JobKey) -> Option<JobState> {
        self.jobs.get(job).map(|tracked| tracked.state)
    }

    /// Every tracked job with its state, ordered by key.
    pub fn jobs(&self) -> Vec<(JobKey, JobState)> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));
        jobs
    }

    /// The number of jobs which have not finished yet.
    pub fn number_of_jobs_pending(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.value().state.is_finished())
            .count()
    }
}

/// Resolves once the job owner saw every partition reach a terminal state
/// and collected the result.
#[derive(Debug)]
pub struct JobHandle {
    job: JobKey,
    receiver: oneshot::Receiver<Result<JobOutput>>,
}

impl JobHandle {
    pub fn job(&self) -> &JobKey {
        &self.job
    }

    pub async fn wait(self) -> Result<JobOutput> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(MapReduceError::ChannelClosed(self.job)),
        }
    }
}
