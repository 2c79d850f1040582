use bytes::Bytes;

use common::job::Chunk;
use common::{CombineFn, KeyValue, Result};

/// Buffers one partition's mapped output until a chunk is cut.
///
/// The buffer never holds more than `chunk_size` values: a chunk is cut when
/// the buffer is full and another value arrives. Whatever is left when the
/// partition ends forms the last chunk.
pub struct MapCombineContext {
    chunk_size: usize,
    combine_fn: Option<CombineFn>,
    aux: Bytes,
    buffer: Chunk,
    collected: usize,
}

impl MapCombineContext {
    pub fn new(chunk_size: usize, combine_fn: Option<CombineFn>, aux: Bytes) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            combine_fn,
            aux,
            buffer: Chunk::new(),
            collected: 0,
        }
    }

    /// Buffers `kv`. Returns the full chunk that had to be cut to make room.
    pub fn emit(&mut self, kv: KeyValue) -> Result<Option<Chunk>> {
        let full = if self.collected >= self.chunk_size {
            Some(self.take_chunk()?)
        } else {
            None
        };
        self.buffer.entry(kv.key).or_default().push(kv.value);
        self.collected += 1;
        Ok(full)
    }

    /// Number of values currently buffered.
    pub fn collected(&self) -> usize {
        self.collected
    }

    pub fn is_empty(&self) -> bool {
        self.collected == 0
    }

    /// Empties the buffer, combining each key's values when a combiner is set.
    pub fn take_chunk(&mut self) -> Result<Chunk> {
        let chunk = std::mem::take(&mut self.buffer);
        self.collected = 0;
        let Some(combine_fn) = self.combine_fn else {
            return Ok(chunk);
        };

        chunk
            .into_iter()
            .map(|(key, values)| -> Result<(Bytes, Vec<Bytes>)> {
                let combined = combine_fn(key.clone(), Box::new(values.into_iter()), self.aux.clone())?;
                Ok((key, vec![combined]))
            })
            .collect()
    }
}
