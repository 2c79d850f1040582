//! A map-combine-reduce cluster member, and a cluster of them running in one
//! process.

pub mod cluster;
pub mod config;
pub mod directory;
pub mod grid;
pub mod service;
pub mod transport;

pub use cluster::LocalCluster;
pub use config::NodeConfig;
pub use directory::ClusterDirectory;
pub use grid::{DataGrid, MapSource, PartitionedMap};
pub use service::MapReduceService;
pub use transport::{DeliveredChunk, LocalTransport};
