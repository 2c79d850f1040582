//! The per-member, per-job map-combine loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use common::cluster::{map_result_to_member, PartitionDirectory, Transport};
use common::job::{Chunk, JobKey, PartitionId, PartitionState};
use common::message::{ClaimOutcome, Notification, ReducingOutcome, Request, Response};
use common::partition_for_key;
use common::source::{KeyValueSource, SourceCapabilities, SourceContext};
use common::{MapReduceError, Result};
use mrl_coordinator::JobSupervisor;

use crate::context::MapCombineContext;
use crate::map::{map_entry, KeyFilter};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    NoMorePartitions,

    /// The job owner no longer knows the job.
    NoSupervisor,

    /// A claim request could not be delivered to the job owner.
    OwnerUnreachable,

    /// More consecutive claim contentions than the configured limit.
    RetryLimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Partitions handed to the reduce stage (or stored locally), in claim order.
    pub processed: Vec<PartitionId>,

    /// Partitions abandoned after a source or workload error.
    pub failed: Vec<PartitionId>,

    /// Partitions the owner refused to move on after mapping.
    pub rejected: Vec<PartitionId>,

    pub contention_retries: u64,
    pub exit: ExitReason,
}

enum PartitionOutcome {
    HandedOff(PartitionState),
    Rejected,
    NoSupervisor,
}

/// Output of mapping one partition.
struct MappedPartition {
    records: u64,

    /// Mapped output kept until the owner accepts the partition (jobs
    /// without a reducer only).
    local: Chunk,

    /// What is left in the context once the source is exhausted.
    remainder: Chunk,
}

pub struct MapCombineTask {
    supervisor: Arc<JobSupervisor>,
    source: Box<dyn KeyValueSource>,
    capabilities: SourceCapabilities,
    filter: KeyFilter,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PartitionDirectory>,
    contention_retry_limit: Option<u64>,
}

impl MapCombineTask {
    /// `supervisor` is this member's state for the job.
    pub fn new(
        supervisor: Arc<JobSupervisor>,
        source: Box<dyn KeyValueSource>,
        filter: KeyFilter,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PartitionDirectory>,
    ) -> Self {
        let capabilities = source.capabilities();
        Self {
            supervisor,
            source,
            capabilities,
            filter,
            transport,
            directory,
            contention_retry_limit: None,
        }
    }

    /// Ends the loop after `limit` consecutive claim contentions.
    pub fn with_contention_retry_limit(mut self, limit: Option<u64>) -> Self {
        self.contention_retry_limit = limit;
        self
    }

    fn job(&self) -> &JobKey {
        self.supervisor.job()
    }

    fn member(&self) -> SocketAddr {
        self.supervisor.member()
    }

    /// Claims and processes partitions until none are left or the owner
    /// forgot the job.
    pub async fn run(mut self) -> WorkerSummary {
        let mut summary = WorkerSummary {
            processed: vec![],
            failed: vec![],
            rejected: vec![],
            contention_retries: 0,
            exit: ExitReason::NoMorePartitions,
        };
        let mut consecutive_contentions = 0u64;
        info!(job = %self.job(), member = %self.member(), "map-combine task started");

        summary.exit = loop {
            let outcome = match self.claim().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(job = %self.job(), error = %err, "cannot claim partitions");
                    break ExitReason::OwnerUnreachable;
                }
            };

            let partition_id = match outcome {
                ClaimOutcome::Assigned(partition_id) => partition_id,
                ClaimOutcome::Contention => {
                    summary.contention_retries += 1;
                    consecutive_contentions += 1;
                    if self
                        .contention_retry_limit
                        .is_some_and(|limit| consecutive_contentions > limit)
                    {
                        error!(job = %self.job(), consecutive_contentions, "claim retry limit exceeded");
                        break ExitReason::RetryLimitExceeded;
                    }
                    continue;
                }
                ClaimOutcome::NoSupervisor => break ExitReason::NoSupervisor,
                ClaimOutcome::NoMorePartitions => break ExitReason::NoMorePartitions,
            };
            consecutive_contentions = 0;

            match self.process_partition(partition_id).await {
                Ok(PartitionOutcome::HandedOff(state)) => {
                    debug!(job = %self.job(), partition_id, ?state, "partition handed off");
                    summary.processed.push(partition_id);
                }
                Ok(PartitionOutcome::Rejected) => {
                    warn!(job = %self.job(), partition_id, "owner rejected the partition state, skipping");
                    summary.rejected.push(partition_id);
                }
                Ok(PartitionOutcome::NoSupervisor) => break ExitReason::NoSupervisor,
                Err(err) => {
                    warn!(job = %self.job(), partition_id, error = %err, "partition abandoned");
                    summary.failed.push(partition_id);
                }
            }
        };

        info!(
            job = %self.job(),
            member = %self.member(),
            exit = ?summary.exit,
            processed = summary.processed.len(),
            failed = summary.failed.len(),
            contention_retries = summary.contention_retries,
            "map-combine task finished"
        );
        summary
    }

    async fn claim(&self) -> Result<ClaimOutcome> {
        let request = Request::RequestPartitionMapping {
            job: self.job().clone(),
            member: self.member(),
        };
        match self
            .transport
            .request(self.supervisor.job_owner(), request)
            .await?
        {
            Response::Claim(outcome) => Ok(outcome),
            other => Err(MapReduceError::UnexpectedResponse {
                request: "RequestPartitionMapping".into(),
                response: other.kind().into(),
            }),
        }
    }

    async fn process_partition(&mut self, partition_id: PartitionId) -> Result<PartitionOutcome> {
        if self.capabilities.partition_aware {
            self.source.set_partition_id(partition_id);
        }
        let mapped = self.map_partition(partition_id).await;
        if let Err(err) = self.source.close() {
            warn!(job = %self.job(), partition_id, error = %err, "failed to close source");
        }
        let MappedPartition {
            records,
            mut local,
            remainder,
        } = mapped?;

        let with_reducer = self.supervisor.workload().has_reducer();
        let last_chunks = if with_reducer && !remainder.is_empty() {
            map_result_to_member(self.supervisor.reducers(), remainder)?
        } else {
            merge_chunk(&mut local, remainder);
            HashMap::new()
        };

        let request = Request::RequestPartitionReducing {
            job: self.job().clone(),
            member: self.member(),
            partition_id,
            records,
            reducers: last_chunks.keys().copied().collect(),
        };
        let outcome = match self
            .transport
            .request(self.supervisor.job_owner(), request)
            .await?
        {
            Response::Reducing(outcome) => outcome,
            other => {
                return Err(MapReduceError::UnexpectedResponse {
                    request: "RequestPartitionReducing".into(),
                    response: other.kind().into(),
                })
            }
        };

        match outcome {
            ReducingOutcome::Successful(state) => {
                if with_reducer {
                    for (target, chunk) in last_chunks {
                        let notification = Notification::LastChunk {
                            job: self.job().clone(),
                            sender: self.member(),
                            partition_id,
                            chunk,
                        };
                        self.deliver(target, partition_id, notification).await;
                    }
                } else {
                    self.supervisor.store_mapped(local);
                }
                Ok(PartitionOutcome::HandedOff(state))
            }
            ReducingOutcome::CheckStateFailed => Ok(PartitionOutcome::Rejected),
            ReducingOutcome::NoSupervisor => Ok(PartitionOutcome::NoSupervisor),
        }
    }

    /// Streams the partition through the filter and map function. The
    /// caller closes the source whatever the outcome.
    async fn map_partition(&mut self, partition_id: PartitionId) -> Result<MappedPartition> {
        let config = self.supervisor.config();
        let workload = self.supervisor.workload();
        let aux = config.aux_bytes();
        let partition_count = self.directory.partition_count();
        let mut context = MapCombineContext::new(config.chunk_size, workload.combine_fn, aux.clone());
        let mut local = Chunk::new();
        let mut records = 0u64;

        let source_context = SourceContext {
            job: self.job().clone(),
            member: self.member(),
        };
        self.source.reset()?;
        self.source.open(&source_context)?;

        while let Some(entry) = self.source.next_entry() {
            let kv = entry?;
            // a source that cannot be scoped yields every partition's entries
            if !self.capabilities.partition_aware
                && partition_for_key(&kv.key, partition_count) != partition_id
            {
                continue;
            }
            if !self.filter.accepts(&kv.key) {
                continue;
            }
            records += 1;

            for chunk in map_entry(workload.map_fn, kv, aux.clone(), &mut context)? {
                if workload.has_reducer() {
                    self.send_intermediate(partition_id, chunk).await?;
                } else {
                    merge_chunk(&mut local, chunk);
                }
            }
        }

        let remainder = if context.is_empty() {
            Chunk::new()
        } else {
            context.take_chunk()?
        };
        debug!(job = %self.job(), partition_id, records, "partition mapped");
        Ok(MappedPartition {
            records,
            local,
            remainder,
        })
    }

    async fn send_intermediate(&self, partition_id: PartitionId, chunk: Chunk) -> Result<()> {
        for (target, chunk) in map_result_to_member(self.supervisor.reducers(), chunk)? {
            let notification = Notification::IntermediateChunk {
                job: self.job().clone(),
                sender: self.member(),
                partition_id,
                chunk,
            };
            self.deliver(target, partition_id, notification).await;
        }
        Ok(())
    }

    /// Sends a chunk. An unreachable destination is logged and the chunk dropped.
    async fn deliver(&self, target: SocketAddr, partition_id: PartitionId, notification: Notification) {
        if let Err(err) = self.transport.notify(target, notification).await {
            warn!(
                job = %self.job(),
                partition_id,
                member = %target,
                error = %err,
                "chunk not delivered"
            );
        }
    }
}

fn merge_chunk(into: &mut Chunk, chunk: Chunk) {
    for (key, values) in chunk {
        into.entry(key).or_default().extend(values);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use common::cluster::ReducerTable;
    use common::job::{JobConfig, JobOutput};
    use common::utils::u64_from_bytes;
    use common::{KeyValue, MapOutput, Workload};
    use mrl_coordinator::JobCompletion;

    fn member(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Directory {
        members: Vec<SocketAddr>,
        partitions: u32,
    }

    impl PartitionDirectory for Directory {
        fn partition_count(&self) -> u32 {
            self.partitions
        }

        fn partition_owner(&self, partition_id: PartitionId) -> Option<SocketAddr> {
            Some(self.members[partition_id as usize % self.members.len()])
        }

        fn members(&self) -> Vec<SocketAddr> {
            self.members.clone()
        }
    }

    /// Entries grouped by partition; partition aware unless told otherwise.
    struct VecSource {
        partitions: Vec<Vec<KeyValue>>,
        partition_aware: bool,
        current: Option<PartitionId>,
        position: usize,
        fail_on: Option<PartitionId>,
        closed: Arc<Mutex<Vec<Option<PartitionId>>>>,
    }

    impl VecSource {
        fn new(partitions: Vec<Vec<KeyValue>>) -> Self {
            Self {
                partitions,
                partition_aware: true,
                current: None,
                position: 0,
                fail_on: None,
                closed: Arc::default(),
            }
        }

        fn entries(&self) -> Vec<KeyValue> {
            match self.current {
                Some(partition_id) if self.partition_aware => self.partitions[partition_id as usize].clone(),
                _ => self.partitions.concat(),
            }
        }
    }

    impl KeyValueSource for VecSource {
        fn open(&mut self, _context: &SourceContext) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.position = 0;
            Ok(())
        }

        fn next_entry(&mut self) -> Option<Result<KeyValue>> {
            if self.fail_on.is_some() && self.fail_on == self.current {
                return Some(Err(MapReduceError::source("disk on fire")));
            }
            let entry = self.entries().get(self.position).cloned()?;
            self.position += 1;
            Some(Ok(entry))
        }

        fn close(&mut self) -> Result<()> {
            self.closed.lock().push(self.current);
            Ok(())
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                partition_aware: self.partition_aware,
            }
        }

        fn set_partition_id(&mut self, partition_id: PartitionId) {
            self.current = Some(partition_id);
        }
    }

    /// Plays the job owner and every reducer with real supervisors.
    struct Cluster {
        directory: Arc<Directory>,
        supervisors: HashMap<SocketAddr, Arc<JobSupervisor>>,
        chunks: Mutex<Vec<(SocketAddr, Notification)>>,
        unreachable: HashSet<SocketAddr>,
        contentions: Mutex<u64>,

        /// The owner answers as if its job state was gone.
        forgotten: bool,
    }

    impl Cluster {
        fn supervisor(&self, target: SocketAddr) -> Result<&Arc<JobSupervisor>> {
            if self.unreachable.contains(&target) {
                return Err(MapReduceError::unreachable(target, "disconnected"));
            }
            self.supervisors
                .get(&target)
                .ok_or_else(|| MapReduceError::unreachable(target, "no such member"))
        }
    }

    #[async_trait]
    impl Transport for Cluster {
        async fn request(&self, target: SocketAddr, request: Request) -> Result<Response> {
            let supervisor = self.supervisor(target)?;
            match request {
                Request::RequestPartitionMapping { .. } if self.forgotten => {
                    Ok(Response::Claim(ClaimOutcome::NoSupervisor))
                }
                Request::RequestPartitionReducing { .. } if self.forgotten => {
                    Ok(Response::Reducing(ReducingOutcome::NoSupervisor))
                }
                Request::RequestPartitionMapping { member, .. } => {
                    let mut contentions = self.contentions.lock();
                    if *contentions > 0 {
                        *contentions -= 1;
                        return Ok(Response::Claim(ClaimOutcome::Contention));
                    }
                    drop(contentions);
                    Ok(Response::Claim(
                        supervisor.claim_partition(member, self.directory.as_ref())?,
                    ))
                }
                Request::RequestPartitionReducing {
                    member,
                    partition_id,
                    records,
                    reducers,
                    ..
                } => Ok(Response::Reducing(supervisor.request_reducing(
                    member,
                    partition_id,
                    records,
                    reducers,
                )?)),
                other => panic!("unexpected request {}", other.kind()),
            }
        }

        async fn notify(&self, target: SocketAddr, notification: Notification) -> Result<()> {
            let supervisor = self.supervisor(target)?;
            match &notification {
                Notification::IntermediateChunk { chunk, .. } => supervisor.on_chunk(chunk.clone()),
                Notification::LastChunk {
                    job, partition_id, chunk, ..
                } => {
                    supervisor.on_chunk(chunk.clone());
                    let owner = &self.supervisors[&member(1)];
                    assert_eq!(owner.job(), job);
                    owner.reducer_finished(*partition_id, target)?;
                }
                other => panic!("unexpected notification for {}", other.job()),
            }
            self.chunks.lock().push((target, notification));
            Ok(())
        }
    }

    fn emit_value(kv: KeyValue, _aux: Bytes) -> MapOutput {
        Ok(Box::new(std::iter::once(Ok::<_, anyhow::Error>(KeyValue::new(
            kv.value,
            Bytes::from_static(b"1"),
        )))))
    }

    fn broken(_kv: KeyValue, _aux: Bytes) -> MapOutput {
        Err(anyhow::anyhow!("cannot map"))
    }

    fn sum(_key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> anyhow::Result<Bytes> {
        let mut total = 0;
        for value in values {
            total += u64_from_bytes(&value)?;
        }
        Ok(Bytes::from(total.to_string()))
    }

    const WITH_REDUCER: Workload = Workload {
        map_fn: emit_value,
        combine_fn: None,
        reduce_fn: Some(sum),
    };

    const MAP_ONLY: Workload = Workload {
        map_fn: emit_value,
        combine_fn: None,
        reduce_fn: None,
    };

    struct Fixture {
        cluster: Arc<Cluster>,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
    }

    impl Fixture {
        /// `members` members sharing `partitions` partitions round robin;
        /// member 1 owns the job.
        fn new(members: u16, partitions: u32, chunk_size: usize, workload: Workload) -> Self {
            let addrs: Vec<_> = (1..=members).map(member).collect();
            let config = JobConfig::new("test", "test", "input").with_chunk_size(chunk_size);
            let (tx, completions) = mpsc::unbounded_channel();
            let directory = Arc::new(Directory {
                members: addrs.clone(),
                partitions,
            });
            let reducers = ReducerTable::snapshot(directory.as_ref()).unwrap();
            let supervisors = addrs
                .iter()
                .map(|&addr| {
                    let completions = (addr == member(1)).then(|| tx.clone());
                    let supervisor = JobSupervisor::new(
                        config.clone(),
                        workload,
                        member(1),
                        addr,
                        reducers.clone(),
                        completions,
                    );
                    (addr, supervisor)
                })
                .collect();
            let cluster = Cluster {
                directory,
                supervisors,
                chunks: Mutex::default(),
                unreachable: HashSet::new(),
                contentions: Mutex::new(0),
                forgotten: false,
            };
            Self {
                cluster: Arc::new(cluster),
                completions,
            }
        }

        fn cluster_mut(&mut self) -> &mut Cluster {
            Arc::get_mut(&mut self.cluster).unwrap()
        }

        fn task(&self, at: SocketAddr, source: VecSource) -> MapCombineTask {
            MapCombineTask::new(
                self.cluster.supervisors[&at].clone(),
                Box::new(source),
                KeyFilter::default(),
                self.cluster.clone(),
                self.cluster.directory.clone(),
            )
        }

        fn owner(&self) -> &Arc<JobSupervisor> {
            &self.cluster.supervisors[&member(1)]
        }
    }

    /// Three entries per partition whose values are the mapped keys.
    fn three_per_partition(partitions: u32) -> Vec<Vec<KeyValue>> {
        (0..partitions)
            .map(|p| {
                (0..3)
                    .map(|i| KeyValue::new(format!("in-{p}-{i}"), Bytes::from_static(b"word")))
                    .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn each_partition_sends_one_intermediate_and_one_last_chunk() {
        let mut fixture = Fixture::new(1, 4, 2, WITH_REDUCER);
        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(summary.exit, ExitReason::NoMorePartitions);
        assert_eq!(summary.processed, vec![0, 1, 2, 3]);

        let chunks = fixture.cluster.chunks.lock();
        for partition in 0..4 {
            let sent: Vec<_> = chunks
                .iter()
                .filter_map(|(_, n)| match n {
                    Notification::IntermediateChunk { partition_id, chunk, .. } if *partition_id == partition => {
                        Some(("intermediate", chunk.values().map(Vec::len).sum::<usize>()))
                    }
                    Notification::LastChunk { partition_id, chunk, .. } if *partition_id == partition => {
                        Some(("last", chunk.values().map(Vec::len).sum::<usize>()))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(sent, vec![("intermediate", 2), ("last", 1)]);
        }
        drop(chunks);

        assert!(fixture
            .owner()
            .process_info()
            .partition_states()
            .iter()
            .all(|s| s.state == PartitionState::Processed));
        assert_eq!(fixture.owner().process_info().processed_records(), 12);
        assert!(!fixture.completions.try_recv().unwrap().cancelled);
        assert_eq!(
            fixture.owner().local_output().unwrap(),
            JobOutput::Reduced(BTreeMap::from([(
                Bytes::from_static(b"word"),
                Bytes::from_static(b"12")
            )]))
        );
    }

    #[tokio::test]
    async fn map_only_jobs_send_no_chunks_and_keep_output_local() {
        let mut fixture = Fixture::new(1, 4, 2, MAP_ONLY);
        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(summary.processed.len(), 4);
        assert!(fixture.cluster.chunks.lock().is_empty());
        assert!(!fixture.completions.try_recv().unwrap().cancelled);
        let JobOutput::Mapped(mapped) = fixture.owner().local_output().unwrap() else {
            panic!("expected mapped output");
        };
        assert_eq!(mapped[&Bytes::from_static(b"word")].len(), 12);
    }

    #[tokio::test]
    async fn partitions_without_output_are_processed_directly() {
        let mut fixture = Fixture::new(1, 2, 2, WITH_REDUCER);
        let summary = fixture
            .task(member(1), VecSource::new(vec![vec![], vec![]]))
            .run()
            .await;

        assert_eq!(summary.processed, vec![0, 1]);
        assert!(fixture.cluster.chunks.lock().is_empty());
        assert!(fixture.completions.try_recv().is_ok());
    }

    #[tokio::test]
    async fn workers_only_claim_partitions_their_member_owns() {
        let fixture = Fixture::new(2, 4, 2, WITH_REDUCER);
        let first = fixture
            .task(member(1), VecSource::new(three_per_partition(4)))
            .run()
            .await;
        let second = fixture
            .task(member(2), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(first.processed, vec![0, 2]);
        assert_eq!(second.processed, vec![1, 3]);
    }

    #[tokio::test]
    async fn source_errors_abandon_the_partition_and_the_loop_goes_on() {
        let fixture = Fixture::new(1, 3, 2, WITH_REDUCER);
        let mut source = VecSource::new(three_per_partition(3));
        source.fail_on = Some(1);
        let closed = source.closed.clone();

        let summary = fixture.task(member(1), source).run().await;

        assert_eq!(summary.processed, vec![0, 2]);
        assert_eq!(summary.failed, vec![1]);
        assert_eq!(summary.exit, ExitReason::NoMorePartitions);
        // closed after every partition, the failing one included
        assert_eq!(*closed.lock(), vec![Some(0), Some(1), Some(2)]);
        assert_eq!(
            fixture.owner().process_info().partition_states()[1].state,
            PartitionState::Mapping
        );
    }

    #[tokio::test]
    async fn map_function_errors_are_isolated_per_partition() {
        let workload = Workload {
            map_fn: broken,
            ..WITH_REDUCER
        };
        let fixture = Fixture::new(1, 2, 2, workload);
        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(2)))
            .run()
            .await;

        assert_eq!(summary.failed, vec![0, 1]);
        assert_eq!(summary.exit, ExitReason::NoMorePartitions);
    }

    #[tokio::test]
    async fn contention_is_retried_immediately() {
        let fixture = Fixture::new(1, 2, 2, WITH_REDUCER);
        *fixture.cluster.contentions.lock() = 3;

        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(2)))
            .with_contention_retry_limit(Some(5))
            .run()
            .await;

        assert_eq!(summary.contention_retries, 3);
        assert_eq!(summary.processed, vec![0, 1]);
        assert_eq!(summary.exit, ExitReason::NoMorePartitions);
    }

    #[tokio::test]
    async fn contention_retry_limit_ends_the_loop() {
        let fixture = Fixture::new(1, 2, 2, WITH_REDUCER);
        *fixture.cluster.contentions.lock() = 100;

        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(2)))
            .with_contention_retry_limit(Some(5))
            .run()
            .await;

        assert_eq!(summary.contention_retries, 6);
        assert_eq!(summary.exit, ExitReason::RetryLimitExceeded);
        assert!(summary.processed.is_empty());
    }

    #[tokio::test]
    async fn missing_owner_state_ends_the_loop_cleanly() {
        let mut fixture = Fixture::new(2, 4, 2, WITH_REDUCER);
        fixture.cluster_mut().forgotten = true;

        let summary = fixture
            .task(member(2), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(summary.exit, ExitReason::NoSupervisor);
        assert!(summary.processed.is_empty());
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn cancelled_job_leaves_nothing_to_claim() {
        let fixture = Fixture::new(1, 4, 2, WITH_REDUCER);
        fixture.owner().cancel().unwrap();

        let summary = fixture
            .task(member(1), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(summary.exit, ExitReason::NoMorePartitions);
        assert!(summary.processed.is_empty());
    }

    #[tokio::test]
    async fn unreachable_owner_ends_the_loop() {
        let mut fixture = Fixture::new(2, 4, 2, WITH_REDUCER);
        fixture.cluster_mut().unreachable.insert(member(1));

        let summary = fixture
            .task(member(2), VecSource::new(three_per_partition(4)))
            .run()
            .await;

        assert_eq!(summary.exit, ExitReason::OwnerUnreachable);
    }

    #[tokio::test]
    async fn unreachable_reducer_drops_its_chunks_but_not_the_partition() {
        let mut fixture = Fixture::new(2, 2, 2, WITH_REDUCER);
        fixture.cluster_mut().unreachable.insert(member(2));
        // every value maps to a key owned by member 2
        let key = (0..)
            .map(|i| format!("w{i}"))
            .find(|k| fixture.cluster.directory.key_owner(k.as_bytes()) == Some(member(2)))
            .unwrap();
        let entries = vec![
            (0..3)
                .map(|i| KeyValue::new(format!("in-{i}"), key.clone()))
                .collect(),
            vec![],
        ];

        let summary = fixture.task(member(1), VecSource::new(entries)).run().await;

        assert_eq!(summary.processed, vec![0]);
        assert!(fixture.cluster.chunks.lock().is_empty());
        // no acknowledgment arrives, so the partition waits in REDUCING
        assert_eq!(
            fixture.owner().process_info().partition_states()[0].state,
            PartitionState::Reducing
        );
    }

    #[tokio::test]
    async fn unscoped_sources_are_filtered_by_partition() {
        let fixture = Fixture::new(1, 2, 10, MAP_ONLY);
        let mut source = VecSource::new(three_per_partition(2));
        source.partition_aware = false;

        let summary = fixture.task(member(1), source).run().await;

        assert_eq!(summary.processed, vec![0, 1]);
        // every entry mapped exactly once across both partitions
        assert_eq!(fixture.owner().process_info().processed_records(), 6);
    }

    #[tokio::test]
    async fn key_bounds_restrict_what_is_mapped() {
        let fixture = Fixture::new(1, 1, 10, MAP_ONLY);
        let source = VecSource::new(three_per_partition(1));
        let task = MapCombineTask::new(
            fixture.owner().clone(),
            Box::new(source),
            KeyFilter::new(Some(vec![Bytes::from_static(b"in-0-1")]), None),
            fixture.cluster.clone(),
            fixture.cluster.directory.clone(),
        );

        let summary = task.run().await;

        assert_eq!(summary.processed, vec![0]);
        assert_eq!(fixture.owner().process_info().processed_records(), 1);
    }
}
