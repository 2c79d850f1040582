use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use common::job::{JobConfig, JobOutput};
use common::{MapReduceError, Result};

use crate::config::NodeConfig;
use crate::directory::ClusterDirectory;
use crate::grid::DataGrid;
use crate::service::{MapReduceService, WorkloadResolver};
use crate::transport::LocalTransport;

/// First port handed out to members of a local cluster.
pub const BASE_PORT: u16 = 5701;

/// A cluster whose members all live in this process.
pub struct LocalCluster {
    directory: Arc<ClusterDirectory>,
    transport: Arc<LocalTransport>,
    grid: Arc<DataGrid>,
    members: Vec<Arc<MapReduceService>>,
}

impl LocalCluster {
    /// Starts `member_count` members running the built-in workloads.
    pub fn start(member_count: usize, config: NodeConfig) -> Result<Self> {
        Self::start_with(member_count, config, workload::try_named)
    }

    pub fn start_with(
        member_count: usize,
        config: NodeConfig,
        resolve_workload: WorkloadResolver,
    ) -> Result<Self> {
        let addresses = (0..member_count)
            .map(|i| {
                u16::try_from(i)
                    .ok()
                    .and_then(|i| BASE_PORT.checked_add(i))
                    .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
                    .ok_or_else(|| MapReduceError::InvalidConfig(format!("too many members: {member_count}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let directory = Arc::new(ClusterDirectory::new(addresses.clone(), config.partition_count)?);
        let transport = Arc::new(LocalTransport::new());
        let grid = Arc::new(DataGrid::new(config.partition_count));

        let members = addresses
            .into_iter()
            .map(|address| {
                let service = MapReduceService::start(
                    address,
                    config,
                    directory.clone(),
                    transport.clone(),
                    grid.clone(),
                    resolve_workload,
                );
                transport.register(&service);
                service
            })
            .collect();

        info!(
            members = member_count,
            partitions = config.partition_count,
            "local cluster started"
        );
        Ok(Self {
            directory,
            transport,
            grid,
            members,
        })
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn grid(&self) -> &Arc<DataGrid> {
        &self.grid
    }

    pub fn members(&self) -> &[Arc<MapReduceService>] {
        &self.members
    }

    /// The member at `index`, in start order.
    pub fn member(&self, index: usize) -> Option<&Arc<MapReduceService>> {
        self.members.get(index)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|member| member.member()).collect()
    }

    /// Launches `config` from the first member and waits for its result.
    pub async fn run(&self, config: JobConfig) -> Result<JobOutput> {
        let owner = self
            .members
            .first()
            .ok_or_else(|| MapReduceError::InvalidConfig("the cluster has no members".into()))?;
        owner.launch(config).await?.wait().await
    }
}
