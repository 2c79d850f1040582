use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::cluster::{PartitionDirectory, ReducerTable};
use common::job::{Chunk, JobConfig, JobKey, JobOutput, JobPartitionState, PartitionId, PartitionState};
use common::message::{ClaimOutcome, ReducingOutcome};
use common::{Result, Workload};

use crate::process_info::{JobProcessInformation, PartitionStates, ProcessingObserver};

/// Sent by the owner's supervisor once every partition is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub job: JobKey,

    /// At least one partition ended `CANCELLED`.
    pub cancelled: bool,
}

/// A member's state for one job.
///
/// Every member holds one per job: it receives reduce chunks and keeps
/// locally collected output. On the job owner it also holds the
/// authoritative partition table and arbitrates claims.
pub struct JobSupervisor {
    config: JobConfig,
    job: JobKey,
    workload: Workload,

    /// The member that launched the job.
    owner: SocketAddr,

    /// The member this supervisor lives on.
    member: SocketAddr,

    process_info: JobProcessInformation,

    /// Where this job's reduce keys go, whatever migrates meanwhile.
    reducers: ReducerTable,

    /// Reducers that still have to acknowledge the last chunk of a partition.
    pending_reducers: DashMap<PartitionId, HashSet<SocketAddr>>,

    /// Values received for reduce keys owned by this member.
    reducer_values: DashMap<Bytes, Vec<Bytes>>,

    /// Mapped output kept on this member when the job has no reducer.
    mapped_values: DashMap<Bytes, Vec<Bytes>>,

    completed: AtomicBool,
    completions: Option<mpsc::UnboundedSender<JobCompletion>>,
}

impl JobSupervisor {
    /// `completions` is only given on the owner.
    pub fn new(
        config: JobConfig,
        workload: Workload,
        owner: SocketAddr,
        member: SocketAddr,
        reducers: ReducerTable,
        completions: Option<mpsc::UnboundedSender<JobCompletion>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<JobSupervisor>| {
            let observer: Weak<dyn ProcessingObserver> = this.clone();
            JobSupervisor {
                job: config.key(),
                config,
                workload,
                owner,
                member,
                process_info: JobProcessInformation::new(reducers.partition_count() as usize, observer),
                reducers,
                pending_reducers: DashMap::new(),
                reducer_values: DashMap::new(),
                mapped_values: DashMap::new(),
                completed: AtomicBool::new(false),
                completions,
            }
        })
    }

    pub fn job(&self) -> &JobKey {
        &self.job
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn workload(&self) -> Workload {
        self.workload
    }

    pub fn job_owner(&self) -> SocketAddr {
        self.owner
    }

    pub fn member(&self) -> SocketAddr {
        self.member
    }

    pub fn is_owner(&self) -> bool {
        self.owner == self.member
    }

    pub fn process_info(&self) -> &JobProcessInformation {
        &self.process_info
    }

    pub fn reducers(&self) -> &ReducerTable {
        &self.reducers
    }

    /////////////////////////////////////////////////////////////////////////
    // Owner side
    /////////////////////////////////////////////////////////////////////////

    /// Claims the next waiting partition currently owned by `member`.
    pub fn claim_partition(
        &self,
        member: SocketAddr,
        directory: &dyn PartitionDirectory,
    ) -> Result<ClaimOutcome> {
        match self.select_partition(member, directory) {
            Some((partition_id, expected)) => self.try_claim(member, partition_id, expected),
            None => Ok(ClaimOutcome::NoMorePartitions),
        }
    }

    /// The first waiting partition owned by `member`, with the entry a claim
    /// has to compare against.
    pub fn select_partition(
        &self,
        member: SocketAddr,
        directory: &dyn PartitionDirectory,
    ) -> Option<(PartitionId, JobPartitionState)> {
        let states = self.process_info.partition_states();
        directory
            .member_partitions(member)
            .into_iter()
            .find_map(|partition_id| {
                let entry = states.get(partition_id as usize)?;
                (entry.state == PartitionState::Waiting).then_some((partition_id, *entry))
            })
    }

    /// Marks `partition_id` as mapped by `member`, if it still holds `expected`.
    pub fn try_claim(
        &self,
        member: SocketAddr,
        partition_id: PartitionId,
        expected: JobPartitionState,
    ) -> Result<ClaimOutcome> {
        let claimed = JobPartitionState::new(member, PartitionState::Mapping);
        if self
            .process_info
            .update_partition_state(partition_id, expected, claimed)?
        {
            debug!(job = %self.job, partition_id, %member, "partition claimed");
            Ok(ClaimOutcome::Assigned(partition_id))
        } else {
            debug!(job = %self.job, partition_id, %member, "lost claim race");
            Ok(ClaimOutcome::Contention)
        }
    }

    /// Moves a partition `member` finished mapping towards the reduce stage.
    ///
    /// With a reducer and at least one reduce destination the partition
    /// becomes `REDUCING` until every destination acknowledges its last
    /// chunk; otherwise it is `PROCESSED` right away.
    pub fn request_reducing(
        &self,
        member: SocketAddr,
        partition_id: PartitionId,
        records: u64,
        reducers: Vec<SocketAddr>,
    ) -> Result<ReducingOutcome> {
        let expected = JobPartitionState::new(member, PartitionState::Mapping);
        let next = if self.workload.has_reducer() && !reducers.is_empty() {
            PartitionState::Reducing
        } else {
            PartitionState::Processed
        };

        // registered before the transition so no acknowledgment can miss it
        if next == PartitionState::Reducing {
            self.pending_reducers
                .insert(partition_id, reducers.into_iter().collect());
        }

        if !self.process_info.update_partition_state(
            partition_id,
            expected,
            expected.with_state(next),
        )? {
            if next == PartitionState::Reducing {
                self.pending_reducers.remove(&partition_id);
            }
            return Ok(ReducingOutcome::CheckStateFailed);
        }

        self.process_info.add_processed_records(records);
        Ok(ReducingOutcome::Successful(next))
    }

    /// `reducer` merged the last chunk of `partition_id`. Returns whether
    /// this acknowledgment completed the partition.
    pub fn reducer_finished(&self, partition_id: PartitionId, reducer: SocketAddr) -> Result<bool> {
        let all_acknowledged = match self.pending_reducers.get_mut(&partition_id) {
            Some(mut pending) => {
                pending.remove(&reducer);
                pending.is_empty()
            }
            None => {
                warn!(job = %self.job, partition_id, %reducer, "unexpected reducer acknowledgment");
                return Ok(false);
            }
        };
        if !all_acknowledged
            || self
                .pending_reducers
                .remove_if(&partition_id, |_, pending| pending.is_empty())
                .is_none()
        {
            return Ok(false);
        }

        let states = self.process_info.partition_states();
        let Some(current) = states.get(partition_id as usize).copied() else {
            return Ok(false);
        };
        if current.state != PartitionState::Reducing {
            debug!(job = %self.job, partition_id, state = ?current.state, "partition left REDUCING before acknowledgment");
            return Ok(false);
        }
        self.process_info.update_partition_state(
            partition_id,
            current,
            current.with_state(PartitionState::Processed),
        )
    }

    /// Cancels every partition that is not terminal yet. Returns whether
    /// anything changed.
    pub fn cancel(&self) -> Result<bool> {
        loop {
            let current = self.process_info.partition_states();
            if current.iter().all(|s| s.state.is_terminal()) {
                return Ok(false);
            }
            let cancelled: PartitionStates = current
                .iter()
                .map(|s| {
                    if s.state.is_terminal() {
                        *s
                    } else {
                        s.with_state(PartitionState::Cancelled)
                    }
                })
                .collect::<Vec<_>>()
                .into();
            if self
                .process_info
                .update_partition_states(&current, cancelled)?
            {
                info!(job = %self.job, "job cancelled");
                return Ok(true);
            }
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Every member
    /////////////////////////////////////////////////////////////////////////

    /// Merges a chunk addressed to this member's reduce keys.
    pub fn on_chunk(&self, chunk: Chunk) {
        for (key, values) in chunk {
            self.reducer_values.entry(key).or_default().extend(values);
        }
    }

    /// Keeps mapped output on this member (jobs without a reducer).
    pub fn store_mapped(&self, chunk: Chunk) {
        for (key, values) in chunk {
            self.mapped_values.entry(key).or_default().extend(values);
        }
    }

    /// This member's share of the job result.
    pub fn local_output(&self) -> Result<JobOutput> {
        match self.workload.reduce_fn {
            Some(reduce_fn) => {
                let aux = self.config.aux_bytes();
                let mut reduced = BTreeMap::new();
                for entry in self.reducer_values.iter() {
                    let value = reduce_fn(
                        entry.key().clone(),
                        Box::new(entry.value().iter().cloned()),
                        aux.clone(),
                    )?;
                    reduced.insert(entry.key().clone(), value);
                }
                Ok(JobOutput::Reduced(reduced))
            }
            None => Ok(JobOutput::Mapped(
                self.mapped_values
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect(),
            )),
        }
    }
}

impl ProcessingObserver for JobSupervisor {
    fn check_fully_processed(&self, info: &JobProcessInformation) {
        let states = info.partition_states();
        if !states.iter().all(|s| s.state.is_terminal()) {
            return;
        }
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = states.iter().any(|s| s.state == PartitionState::Cancelled);
        info!(
            job = %self.job,
            cancelled,
            processed_records = info.processed_records(),
            "all partitions reached a terminal state"
        );
        if let Some(completions) = &self.completions {
            let completion = JobCompletion {
                job: self.job.clone(),
                cancelled,
            };
            if completions.send(completion).is_err() {
                warn!(job = %self.job, "completion listener is gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{KeyValue, MapOutput};

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

    fn member(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn identity(kv: KeyValue, _aux: Bytes) -> MapOutput {
        Ok(Box::new(std::iter::once(Ok::<_, anyhow::Error>(kv))))
    }

    fn count(_key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(values.count().to_string()))
    }

    fn workload(with_reducer: bool) -> Workload {
        Workload {
            map_fn: identity,
            combine_fn: None,
            reduce_fn: with_reducer.then_some(count as common::ReduceFn),
        }
    }

    fn owner_supervisor(
        partitions: usize,
        with_reducer: bool,
    ) -> (Arc<JobSupervisor>, mpsc::UnboundedReceiver<JobCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = JobSupervisor::new(
            JobConfig::new("test", "test", "input"),
            workload(with_reducer),
            member(1),
            member(1),
            ReducerTable::new(vec![member(1); partitions]),
            Some(tx),
        );
        (supervisor, rx)
    }

    #[test]
    fn claims_cover_each_owned_partition_once() {
        let (supervisor, _rx) = owner_supervisor(4, true);
        let directory = Directory {
            members: vec![member(1), member(2)],
            partitions: 4,
        };

        let mut first = vec![];
        while let ClaimOutcome::Assigned(p) = supervisor.claim_partition(member(1), &directory).unwrap() {
            first.push(p);
        }
        let mut second = vec![];
        while let ClaimOutcome::Assigned(p) = supervisor.claim_partition(member(2), &directory).unwrap() {
            second.push(p);
        }

        assert_eq!(first, vec![0, 2]);
        assert_eq!(second, vec![1, 3]);
        assert_eq!(
            supervisor.claim_partition(member(1), &directory).unwrap(),
            ClaimOutcome::NoMorePartitions
        );
    }

    #[test]
    fn racing_claims_yield_one_assignment_and_one_contention() {
        let (supervisor, _rx) = owner_supervisor(4, true);
        let directory = Directory {
            members: vec![member(1)],
            partitions: 4,
        };

        let (a_partition, a_expected) = supervisor.select_partition(member(1), &directory).unwrap();
        let (b_partition, b_expected) = supervisor.select_partition(member(1), &directory).unwrap();
        assert_eq!(a_partition, b_partition);

        assert_eq!(
            supervisor.try_claim(member(1), a_partition, a_expected).unwrap(),
            ClaimOutcome::Assigned(a_partition)
        );
        assert_eq!(
            supervisor.try_claim(member(1), b_partition, b_expected).unwrap(),
            ClaimOutcome::Contention
        );

        // the loser retries right away and gets another partition
        match supervisor.claim_partition(member(1), &directory).unwrap() {
            ClaimOutcome::Assigned(p) => assert_ne!(p, a_partition),
            other => panic!("expected an assignment, got {other:?}"),
        }
    }

    #[test]
    fn reducing_waits_for_every_reducer() {
        let (supervisor, mut rx) = owner_supervisor(1, true);
        let directory = Directory {
            members: vec![member(1)],
            partitions: 1,
        };
        assert_eq!(
            supervisor.claim_partition(member(1), &directory).unwrap(),
            ClaimOutcome::Assigned(0)
        );

        let outcome = supervisor
            .request_reducing(member(1), 0, 3, vec![member(1), member(2)])
            .unwrap();
        assert_eq!(outcome, ReducingOutcome::Successful(PartitionState::Reducing));
        assert_eq!(supervisor.process_info().processed_records(), 3);

        assert!(!supervisor.reducer_finished(0, member(2)).unwrap());
        assert!(rx.try_recv().is_err());
        assert!(supervisor.reducer_finished(0, member(1)).unwrap());

        assert_eq!(
            supervisor.process_info().partition_states()[0].state,
            PartitionState::Processed
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            JobCompletion {
                job: supervisor.job().clone(),
                cancelled: false
            }
        );
    }

    #[test]
    fn partitions_without_reduce_destinations_are_processed_directly() {
        let (supervisor, mut rx) = owner_supervisor(1, false);
        let directory = Directory {
            members: vec![member(1)],
            partitions: 1,
        };
        supervisor.claim_partition(member(1), &directory).unwrap();

        let outcome = supervisor.request_reducing(member(1), 0, 0, vec![]).unwrap();
        assert_eq!(outcome, ReducingOutcome::Successful(PartitionState::Processed));
        assert!(!rx.try_recv().unwrap().cancelled);
    }

    #[test]
    fn reducing_request_from_a_non_claimant_fails_the_state_check() {
        let (supervisor, _rx) = owner_supervisor(1, true);
        let directory = Directory {
            members: vec![member(1)],
            partitions: 1,
        };
        supervisor.claim_partition(member(1), &directory).unwrap();

        let outcome = supervisor
            .request_reducing(member(2), 0, 10, vec![member(1)])
            .unwrap();
        assert_eq!(outcome, ReducingOutcome::CheckStateFailed);
        assert_eq!(supervisor.process_info().processed_records(), 0);
        assert!(!supervisor.reducer_finished(0, member(1)).unwrap());
    }

    #[test]
    fn cancel_marks_open_partitions_and_completes_once() {
        let (supervisor, mut rx) = owner_supervisor(3, false);
        let directory = Directory {
            members: vec![member(1)],
            partitions: 3,
        };
        supervisor.claim_partition(member(1), &directory).unwrap();
        supervisor.request_reducing(member(1), 0, 1, vec![]).unwrap();

        assert!(supervisor.cancel().unwrap());
        assert!(!supervisor.cancel().unwrap());

        let states = supervisor.process_info().partition_states();
        assert_eq!(states[0].state, PartitionState::Processed);
        assert_eq!(states[1].state, PartitionState::Cancelled);
        assert_eq!(states[2].state, PartitionState::Cancelled);

        assert!(rx.try_recv().unwrap().cancelled);
        assert!(rx.try_recv().is_err());

        // a worker finishing late sees the cancellation
        assert_eq!(
            supervisor.request_reducing(member(1), 1, 1, vec![]).unwrap(),
            ReducingOutcome::CheckStateFailed
        );
    }

    #[test]
    fn local_output_reduces_received_chunks() {
        let (supervisor, _rx) = owner_supervisor(1, true);
        supervisor.on_chunk(Chunk::from([(
            Bytes::from_static(b"a"),
            vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")],
        )]));
        supervisor.on_chunk(Chunk::from([(Bytes::from_static(b"a"), vec![Bytes::from_static(b"z")])]));

        let JobOutput::Reduced(reduced) = supervisor.local_output().unwrap() else {
            panic!("expected reduced output");
        };
        assert_eq!(reduced[&Bytes::from_static(b"a")], Bytes::from_static(b"3"));
    }

    #[test]
    fn local_output_without_reducer_returns_mapped_values() {
        let (supervisor, _rx) = owner_supervisor(1, false);
        supervisor.store_mapped(Chunk::from([(Bytes::from_static(b"k"), vec![Bytes::from_static(b"v")])]));

        let JobOutput::Mapped(mapped) = supervisor.local_output().unwrap() else {
            panic!("expected mapped output");
        };
        assert_eq!(mapped[&Bytes::from_static(b"k")], vec![Bytes::from_static(b"v")]);
    }
}
