//! Launching a job across the cluster and collecting its result.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use common::cluster::{map_keys_to_members, PartitionDirectory, ReducerTable, Transport};
use common::job::{JobConfig, JobKey, JobOutput};
use common::message::{Notification, Request, Response};
use common::{MapReduceError, Result};

use crate::jobs::{JobHandle, JobState, JobTracker};
use crate::supervisor::JobCompletion;

/// Launches `config` from `owner`, which becomes the job owner.
///
/// Every member first learns the job, then each one is told to start
/// processing its share of the keys. A member that cannot be reached fails
/// the launch; members that were already told are not rolled back.
pub async fn launch_job(
    config: JobConfig,
    owner: SocketAddr,
    tracker: &JobTracker,
    transport: &dyn Transport,
    directory: &dyn PartitionDirectory,
) -> Result<JobHandle> {
    config.validate()?;
    if directory.partition_count() == 0 {
        return Err(MapReduceError::InvalidConfig(
            "the cluster has no partitions".into(),
        ));
    }

    let reducers = ReducerTable::snapshot(directory)?;
    let handle = tracker.register(&config)?;
    let job = config.key();
    let members = directory.members();
    info!(
        %job,
        %owner,
        workload = %config.workload,
        members = members.len(),
        partitions = directory.partition_count(),
        "launching job"
    );

    let launched = async {
        broadcast_job(&config, owner, &reducers, &members, transport).await?;
        // workers may finish the job before start_processing returns
        tracker.set_state(&job, JobState::Running);
        start_processing(&config, &members, transport, directory).await
    };
    if let Err(err) = launched.await {
        warn!(%job, error = %err, "job launch failed");
        tracker.fail(&job);
        return Err(err);
    }
    Ok(handle)
}

/// Tells every member about the job so it creates its local job state.
/// `reducers` fixes where each reduce key goes for the whole run.
pub async fn broadcast_job(
    config: &JobConfig,
    owner: SocketAddr,
    reducers: &ReducerTable,
    members: &[SocketAddr],
    transport: &dyn Transport,
) -> Result<()> {
    for &member in members {
        let request = Request::StartJob {
            config: config.clone(),
            owner,
            reducers: reducers.clone(),
        };
        expect_ack(transport.request(member, request).await?, "StartJob")?;
        debug!(job = %config.key(), %member, "member knows the job");
    }
    Ok(())
}

/// Starts the map-combine loop on every member, handing each only the keys
/// it owns when the job is restricted to a key set.
pub async fn start_processing(
    config: &JobConfig,
    members: &[SocketAddr],
    transport: &dyn Transport,
    directory: &dyn PartitionDirectory,
) -> Result<()> {
    let mut assigned: Option<HashMap<SocketAddr, Vec<Bytes>>> = config
        .keys
        .as_ref()
        .map(|keys| map_keys_to_members(directory, keys));

    for &member in members {
        // a member owning none of the keys maps nothing but still marks its partitions
        let keys = assigned
            .as_mut()
            .map(|assigned| assigned.remove(&member).unwrap_or_default());
        let request = Request::StartProcessing {
            job: config.key(),
            workload: config.workload.clone(),
            keys,
            predicate: config.predicate.clone(),
        };
        expect_ack(transport.request(member, request).await?, "StartProcessing")?;
    }
    Ok(())
}

/// Gathers and merges every member's share of the result.
pub async fn collect_job_output(
    job: &JobKey,
    members: &[SocketAddr],
    transport: &dyn Transport,
) -> Result<JobOutput> {
    let mut output: Option<JobOutput> = None;
    for &member in members {
        let request = Request::GetResult { job: job.clone() };
        let partial = match transport.request(member, request).await? {
            Response::Output(partial) => partial,
            other => {
                return Err(MapReduceError::UnexpectedResponse {
                    request: "GetResult".into(),
                    response: other.kind().into(),
                })
            }
        };
        debug!(%job, %member, entries = partial.len(), "collected partial result");
        match output.as_mut() {
            Some(output) => output.merge(partial),
            None => output = Some(partial),
        }
    }
    output.ok_or_else(|| MapReduceError::UnknownJob(job.clone()))
}

/// Tells every member to drop the job's state. Unreachable members are logged.
pub async fn destroy_job(job: &JobKey, members: &[SocketAddr], transport: &dyn Transport) {
    for &member in members {
        let notification = Notification::DestroyJob { job: job.clone() };
        if let Err(err) = transport.notify(member, notification).await {
            warn!(%job, %member, error = %err, "could not destroy job state");
        }
    }
}

/// Resolves a job whose partitions all reached a terminal state.
pub async fn finish_job(
    completion: JobCompletion,
    tracker: &JobTracker,
    transport: &dyn Transport,
    directory: &dyn PartitionDirectory,
) {
    let JobCompletion { job, cancelled } = completion;
    let members = directory.members();

    let result = if cancelled {
        Err(MapReduceError::Cancelled(job.clone()))
    } else {
        collect_job_output(&job, &members, transport).await
    };
    destroy_job(&job, &members, transport).await;

    match &result {
        Ok(output) => info!(%job, entries = output.len(), "job completed"),
        Err(err) => warn!(%job, error = %err, "job did not complete"),
    }
    tracker.complete(&job, result);
}

/// Asks the job owner to cancel the job. Returns whether anything changed.
pub async fn cancel_job(job: &JobKey, owner: SocketAddr, transport: &dyn Transport) -> Result<bool> {
    let request = Request::CancelJob { job: job.clone() };
    match transport.request(owner, request).await? {
        Response::Cancelled(changed) => Ok(changed),
        other => Err(MapReduceError::UnexpectedResponse {
            request: "CancelJob".into(),
            response: other.kind().into(),
        }),
    }
}

fn expect_ack(response: Response, request: &str) -> Result<()> {
    match response {
        Response::Ack => Ok(()),
        other => Err(MapReduceError::UnexpectedResponse {
            request: request.into(),
            response: other.kind().into(),
        }),
    }
}
