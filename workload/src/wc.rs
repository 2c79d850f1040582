//! Counts words. Each input value is a line of text.

use anyhow::Result;
use bytes::Bytes;

use common::utils::{string_from_bytes, u64_from_bytes};
use common::{KeyValue, MapOutput};

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let line = string_from_bytes(kv.value)?;
    let words: Vec<_> = line
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| Ok(KeyValue::new(word.to_lowercase(), Bytes::from_static(b"1"))))
        .collect::<Vec<Result<KeyValue>>>();
    Ok(Box::new(words.into_iter()))
}

/// Sums counts, so it also serves as the combiner.
pub fn reduce(
    _key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let mut count = 0u64;
    for value in values {
        count += u64_from_bytes(&value)?;
    }
    Ok(Bytes::from(count.to_string()))
}
