//! Message delivery between members of a cluster running in one process.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use common::cluster::Transport;
use common::job::{JobKey, PartitionId};
use common::message::{Notification, Request, Response};
use common::{MapReduceError, Result};

use crate::service::MapReduceService;

/// A chunk that reached its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredChunk {
    pub job: JobKey,
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub partition_id: PartitionId,
    pub last: bool,
    /// Number of values in the chunk.
    pub values: usize,
}

/// Calls the target member's service directly. Members can be disconnected
/// to simulate an unreachable node.
#[derive(Default)]
pub struct LocalTransport {
    members: RwLock<HashMap<SocketAddr, Weak<MapReduceService>>>,
    disconnected: RwLock<HashSet<SocketAddr>>,
    chunk_log: Mutex<Vec<DeliveredChunk>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: &Arc<MapReduceService>) {
        self.members
            .write()
            .insert(service.member(), Arc::downgrade(service));
    }

    pub fn disconnect(&self, member: SocketAddr) {
        self.disconnected.write().insert(member);
    }

    pub fn reconnect(&self, member: SocketAddr) {
        self.disconnected.write().remove(&member);
    }

    /// Every chunk delivered so far, in delivery order.
    pub fn delivered_chunks(&self) -> Vec<DeliveredChunk> {
        self.chunk_log.lock().clone()
    }

    fn service(&self, target: SocketAddr) -> Result<Arc<MapReduceService>> {
        if self.disconnected.read().contains(&target) {
            return Err(MapReduceError::unreachable(target, "disconnected"));
        }
        self.members
            .read()
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| MapReduceError::unreachable(target, "not a cluster member"))
    }

    fn record(&self, target: SocketAddr, notification: &Notification) {
        let (job, from, partition_id, chunk, last) = match notification {
            Notification::IntermediateChunk {
                job,
                sender,
                partition_id,
                chunk,
            } => (job, sender, partition_id, chunk, false),
            Notification::LastChunk {
                job,
                sender,
                partition_id,
                chunk,
            } => (job, sender, partition_id, chunk, true),
            _ => return,
        };
        self.chunk_log.lock().push(DeliveredChunk {
            job: job.clone(),
            from: *from,
            to: target,
            partition_id: *partition_id,
            last,
            values: chunk.values().map(Vec::len).sum(),
        });
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, target: SocketAddr, request: Request) -> Result<Response> {
        let service = self.service(target)?;
        trace!(%target, request = request.kind(), "request");
        service.handle_request(request).await
    }

    async fn notify(&self, target: SocketAddr, notification: Notification) -> Result<()> {
        let service = self.service(target)?;
        self.record(target, &notification);
        service.handle_notification(notification).await
    }
}
