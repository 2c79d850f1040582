//! In-memory partitioned maps that jobs read from.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use common::job::{PartitionId, SourceDescriptor};
use common::partition_for_key;
use common::source::{KeyValueSource, SourceCapabilities, SourceContext, SourceProvider};
use common::{KeyValue, MapReduceError, Result};

/// A map whose entries are spread over a fixed number of partitions by key.
#[derive(Debug)]
pub struct PartitionedMap {
    name: String,
    partitions: Vec<RwLock<BTreeMap<Bytes, Bytes>>>,
}

impl PartitionedMap {
    pub fn new(name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            name: name.into(),
            partitions: (0..partition_count).map(|_| RwLock::default()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition_of(&self, key: &[u8]) -> PartitionId {
        partition_for_key(key, self.partition_count())
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        let key = key.into();
        let partition = self.partitions.get(self.partition_of(&key) as usize)?;
        partition.write().insert(key, value.into())
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.partitions
            .get(self.partition_of(key) as usize)?
            .read()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of one partition's entries, in key order.
    pub fn entries(&self, partition_id: PartitionId) -> Vec<KeyValue> {
        self.partitions
            .get(partition_id as usize)
            .map(|partition| {
                partition
                    .read()
                    .iter()
                    .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The maps of a cluster, by name.
#[derive(Debug)]
pub struct DataGrid {
    partition_count: u32,
    maps: DashMap<String, Arc<PartitionedMap>>,
}

impl DataGrid {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            maps: DashMap::new(),
        }
    }

    /// The map called `name`, created empty on first use.
    pub fn map(&self, name: &str) -> Arc<PartitionedMap> {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PartitionedMap::new(name, self.partition_count)))
            .value()
            .clone()
    }
}

impl SourceProvider for DataGrid {
    fn create_source(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn KeyValueSource>> {
        match descriptor {
            SourceDescriptor::Map { name } => {
                let map = self
                    .maps
                    .get(name)
                    .map(|map| Arc::clone(map.value()))
                    .ok_or_else(|| MapReduceError::Source(format!("no map named `{name}`")))?;
                Ok(Box::new(MapSource::new(map)))
            }
        }
    }
}

/// Reads one partition of a [`PartitionedMap`] at a time.
///
/// `open` takes a copy of the selected partition; writes made afterwards
/// are not seen until the next `reset` and `open`.
pub struct MapSource {
    map: Arc<PartitionedMap>,
    partition_id: Option<PartitionId>,
    entries: Vec<KeyValue>,
    position: usize,
    open: bool,
}

impl MapSource {
    pub fn new(map: Arc<PartitionedMap>) -> Self {
        Self {
            map,
            partition_id: None,
            entries: vec![],
            position: 0,
            open: false,
        }
    }
}

impl KeyValueSource for MapSource {
    fn open(&mut self, _context: &SourceContext) -> Result<()> {
        self.entries = match self.partition_id {
            Some(partition_id) => self.map.entries(partition_id),
            None => (0..self.map.partition_count())
                .flat_map(|partition_id| self.map.entries(partition_id))
                .collect(),
        };
        self.position = 0;
        self.open = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.entries.clear();
        self.position = 0;
        Ok(())
    }

    fn next_entry(&mut self) -> Option<Result<KeyValue>> {
        if !self.open {
            return Some(Err(MapReduceError::Source(format!(
                "map `{}` read before open",
                self.map.name()
            ))));
        }
        let entry = self.entries.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(entry))
    }

    fn close(&mut self) -> Result<()> {
        self.entries.clear();
        self.open = false;
        Ok(())
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            partition_aware: true,
        }
    }

    fn set_partition_id(&mut self, partition_id: PartitionId) {
        self.partition_id = Some(partition_id);
    }
}
