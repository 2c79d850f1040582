//! One cluster member's map-reduce service.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use common::cluster::{PartitionDirectory, ReducerTable, Transport};
use common::job::{JobConfig, JobKey};
use common::message::{ClaimOutcome, Notification, ReducingOutcome, Request, Response};
use common::source::SourceProvider;
use common::{MapReduceError, Result, Workload};
use mrl_coordinator::{launcher, JobCompletion, JobHandle, JobSupervisor, JobTracker};
use mrl_worker::{KeyFilter, MapCombineTask, WorkerSummary};

use crate::config::NodeConfig;

/// Turns a workload name into the application every member runs.
pub type WorkloadResolver = fn(&str) -> Option<Workload>;

/// Answers requests and notifications addressed to one member, and launches
/// jobs owned by it.
pub struct MapReduceService {
    this: Weak<MapReduceService>,
    member: SocketAddr,
    config: NodeConfig,
    directory: Arc<dyn PartitionDirectory>,
    transport: Arc<dyn Transport>,
    sources: Arc<dyn SourceProvider>,
    resolve_workload: WorkloadResolver,

    /// This member's state of every job it takes part in.
    supervisors: DashMap<JobKey, Arc<JobSupervisor>>,

    /// Map-combine tasks of every job, one tracker per job.
    tasks: DashMap<JobKey, TaskTracker>,

    /// How this member's map-combine task of a job ended.
    summaries: DashMap<JobKey, WorkerSummary>,

    /// Jobs launched from this member.
    tracker: JobTracker,

    completions: mpsc::UnboundedSender<JobCompletion>,
}

impl MapReduceService {
    /// Starts the service. Must be called from within a tokio runtime.
    pub fn start(
        member: SocketAddr,
        config: NodeConfig,
        directory: Arc<dyn PartitionDirectory>,
        transport: Arc<dyn Transport>,
        sources: Arc<dyn SourceProvider>,
        resolve_workload: WorkloadResolver,
    ) -> Arc<Self> {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let service = Arc::new_cyclic(|this| MapReduceService {
            this: this.clone(),
            member,
            config,
            directory,
            transport,
            sources,
            resolve_workload,
            supervisors: DashMap::new(),
            tasks: DashMap::new(),
            summaries: DashMap::new(),
            tracker: JobTracker::new(),
            completions,
        });
        tokio::spawn(completion_loop(Arc::downgrade(&service), completions_rx));
        info!(%member, "member started");
        service
    }

    pub fn member(&self) -> SocketAddr {
        self.member
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn supervisor(&self, job: &JobKey) -> Option<Arc<JobSupervisor>> {
        self.supervisors.get(job).map(|s| Arc::clone(s.value()))
    }

    /// Launches `config` with this member as the job owner.
    pub async fn launch(&self, config: JobConfig) -> Result<JobHandle> {
        launcher::launch_job(
            config,
            self.member,
            &self.tracker,
            self.transport.as_ref(),
            self.directory.as_ref(),
        )
        .await
    }

    /// Asks the job owner to cancel `job`.
    pub async fn cancel(&self, job: &JobKey) -> Result<bool> {
        let owner = self
            .supervisor(job)
            .map(|supervisor| supervisor.job_owner())
            .ok_or_else(|| MapReduceError::UnknownJob(job.clone()))?;
        launcher::cancel_job(job, owner, self.transport.as_ref()).await
    }

    /// Drops this member's state of `job`. Running tasks notice on their next
    /// request to the owner; their summaries stay available.
    pub fn dispose_job(&self, job: &JobKey) -> bool {
        if let Some(tasks) = self.tasks.get(job) {
            tasks.close();
        }
        let removed = self.supervisors.remove(job).is_some();
        if removed {
            debug!(%job, member = %self.member, "job state disposed");
        }
        removed
    }

    /// Waits for this member's map-combine task of `job` and returns how it
    /// ended. `None` when the task never ran here.
    pub async fn worker_summary(&self, job: &JobKey) -> Option<WorkerSummary> {
        let tasks = self.tasks.get(job).map(|tasks| tasks.value().clone());
        if let Some(tasks) = tasks {
            tasks.close();
            tasks.wait().await;
        }
        self.summaries.get(job).map(|summary| summary.value().clone())
    }

    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        match request {
            Request::StartJob {
                config,
                owner,
                reducers,
            } => self.start_job(config, owner, reducers),
            Request::StartProcessing {
                job,
                workload,
                keys,
                predicate,
            } => {
                self.start_processing(job, &workload, KeyFilter::new(keys, predicate))?;
                Ok(Response::Ack)
            }
            Request::RequestPartitionMapping { job, member } => {
                let outcome = match self.owned_supervisor(&job) {
                    Some(supervisor) => supervisor.claim_partition(member, self.directory.as_ref())?,
                    None => ClaimOutcome::NoSupervisor,
                };
                Ok(Response::Claim(outcome))
            }
            Request::RequestPartitionReducing {
                job,
                member,
                partition_id,
                records,
                reducers,
            } => {
                let outcome = match self.owned_supervisor(&job) {
                    Some(supervisor) => {
                        supervisor.request_reducing(member, partition_id, records, reducers)?
                    }
                    None => ReducingOutcome::NoSupervisor,
                };
                Ok(Response::Reducing(outcome))
            }
            Request::GetResult { job } => {
                let supervisor = self
                    .supervisor(&job)
                    .ok_or(MapReduceError::UnknownJob(job))?;
                Ok(Response::Output(supervisor.local_output()?))
            }
            Request::CancelJob { job } => {
                let changed = match self.owned_supervisor(&job) {
                    Some(supervisor) => supervisor.cancel()?,
                    None => false,
                };
                Ok(Response::Cancelled(changed))
            }
        }
    }

    pub async fn handle_notification(&self, notification: Notification) -> Result<()> {
        let Some(supervisor) = self.supervisor(notification.job()) else {
            debug!(job = %notification.job(), member = %self.member, "notification for unknown job dropped");
            return Ok(());
        };

        match notification {
            Notification::IntermediateChunk { chunk, .. } => supervisor.on_chunk(chunk),
            Notification::LastChunk {
                job,
                partition_id,
                chunk,
                ..
            } => {
                supervisor.on_chunk(chunk);
                let acknowledgment = Notification::ReducingFinished {
                    job,
                    partition_id,
                    reducer: self.member,
                };
                self.transport
                    .notify(supervisor.job_owner(), acknowledgment)
                    .await?;
            }
            Notification::ReducingFinished {
                partition_id,
                reducer,
                ..
            } => {
                supervisor.reducer_finished(partition_id, reducer)?;
            }
            Notification::DestroyJob { job } => {
                self.dispose_job(&job);
            }
        }
        Ok(())
    }

    fn start_job(
        &self,
        config: JobConfig,
        owner: SocketAddr,
        reducers: ReducerTable,
    ) -> Result<Response> {
        let job = config.key();
        let workload = (self.resolve_workload)(&config.workload)
            .ok_or_else(|| MapReduceError::UnknownWorkload(config.workload.clone()))?;
        let completions = (owner == self.member).then(|| self.completions.clone());

        match self.supervisors.entry(job.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MapReduceError::DuplicateJob(job));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(JobSupervisor::new(
                    config,
                    workload,
                    owner,
                    self.member,
                    reducers,
                    completions,
                ));
            }
        }
        self.tasks.insert(job.clone(), TaskTracker::new());
        debug!(%job, member = %self.member, %owner, "job registered");
        Ok(Response::Ack)
    }

    fn start_processing(&self, job: JobKey, workload: &str, filter: KeyFilter) -> Result<()> {
        let supervisor = self
            .supervisor(&job)
            .ok_or_else(|| MapReduceError::UnknownJob(job.clone()))?;
        if supervisor.config().workload != workload {
            return Err(MapReduceError::InvalidConfig(format!(
                "job {job} runs `{}`, not `{workload}`",
                supervisor.config().workload
            )));
        }
        let tasks = self
            .tasks
            .get(&job)
            .map(|tasks| tasks.value().clone())
            .ok_or_else(|| MapReduceError::UnknownJob(job.clone()))?;

        let source = self.sources.create_source(&supervisor.config().source)?;
        let task = MapCombineTask::new(
            supervisor,
            source,
            filter,
            self.transport.clone(),
            self.directory.clone(),
        )
        .with_contention_retry_limit(self.config.contention_retry_limit);

        let this = self.this.clone();
        tasks.spawn(async move {
            let summary = task.run().await;
            if let Some(service) = this.upgrade() {
                service.summaries.insert(job, summary);
            }
        });
        Ok(())
    }

    /// The job's supervisor, if this member owns the job.
    fn owned_supervisor(&self, job: &JobKey) -> Option<Arc<JobSupervisor>> {
        self.supervisor(job).filter(|supervisor| supervisor.is_owner())
    }

    async fn finish_job(&self, completion: JobCompletion) {
        launcher::finish_job(
            completion,
            &self.tracker,
            self.transport.as_ref(),
            self.directory.as_ref(),
        )
        .await;
    }
}

/// Resolves jobs owned by the service as their partitions finish.
async fn completion_loop(
    service: Weak<MapReduceService>,
    mut completions: mpsc::UnboundedReceiver<JobCompletion>,
) {
    while let Some(completion) = completions.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.finish_job(completion).await;
    }
    debug!("completion loop stopped");
}

impl Drop for MapReduceService {
    fn drop(&mut self) {
        for tasks in self.tasks.iter() {
            tasks.value().close();
        }
        if !self.supervisors.is_empty() {
            warn!(
                member = %self.member,
                jobs = self.supervisors.len(),
                "member stopped with jobs in flight"
            );
        }
    }
}
