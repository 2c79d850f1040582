use std::collections::HashSet;

use bytes::Bytes;

use common::job::{Chunk, KeyPredicate};
use common::{KeyValue, MapFn, Result};

use crate::context::MapCombineContext;

/// Decides which source entries a member maps.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    /// The keys assigned to this member, when the job is key-bounded.
    keys: Option<HashSet<Bytes>>,
    predicate: Option<KeyPredicate>,
}

impl KeyFilter {
    pub fn new(keys: Option<Vec<Bytes>>, predicate: Option<KeyPredicate>) -> Self {
        Self {
            keys: keys.map(|keys| keys.into_iter().collect()),
            predicate,
        }
    }

    pub fn accepts(&self, key: &[u8]) -> bool {
        if let Some(keys) = &self.keys {
            if !keys.contains(key) {
                return false;
            }
        }
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate.test(key))
    }
}

/// Runs the map function over one entry, buffering its output.
///
/// Returns the chunks that filled up along the way, in order.
pub fn map_entry(
    map_fn: MapFn,
    kv: KeyValue,
    aux: Bytes,
    context: &mut MapCombineContext,
) -> Result<Vec<Chunk>> {
    let mut full = vec![];
    for mapped in map_fn(kv, aux)? {
        if let Some(chunk) = context.emit(mapped?)? {
            full.push(chunk);
        }
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MapOutput;

    fn split_words(kv: KeyValue, _aux: Bytes) -> MapOutput {
        let line = String::from_utf8(kv.value.to_vec())?;
        let words: Vec<_> = line
            .split_whitespace()
            .map(|word| Ok::<_, anyhow::Error>(KeyValue::new(word.to_string(), Bytes::from_static(b"1"))))
            .collect();
        Ok(Box::new(words.into_iter()))
    }

    fn failing(_kv: KeyValue, _aux: Bytes) -> MapOutput {
        Ok(Box::new(std::iter::once(Err::<KeyValue, _>(anyhow::anyhow!("bad record")))))
    }

    #[test]
    fn filter_combines_key_bounds_and_predicate() {
        let unbounded = KeyFilter::default();
        assert!(unbounded.accepts(b"anything"));

        let filter = KeyFilter::new(
            Some(vec![Bytes::from_static(b"user:1"), Bytes::from_static(b"order:1")]),
            Some(KeyPredicate::Prefix(Bytes::from_static(b"user:"))),
        );
        assert!(filter.accepts(b"user:1"));
        assert!(!filter.accepts(b"user:2"));
        assert!(!filter.accepts(b"order:1"));
    }

    #[test]
    fn empty_key_set_accepts_nothing() {
        let filter = KeyFilter::new(Some(vec![]), None);
        assert!(!filter.accepts(b"a"));
    }

    #[test]
    fn map_entry_returns_chunks_that_filled_up() {
        let mut context = MapCombineContext::new(2, None, Bytes::new());
        let line = KeyValue::new("line-1", "a b c d e");

        let full = map_entry(split_words, line, Bytes::new(), &mut context).unwrap();

        assert_eq!(full.len(), 2);
        assert_eq!(context.collected(), 1);
    }

    #[test]
    fn record_errors_abort_the_entry() {
        let mut context = MapCombineContext::new(2, None, Bytes::new());
        let result = map_entry(failing, KeyValue::new("k", "v"), Bytes::new(), &mut context);
        assert!(matches!(result, Err(common::MapReduceError::Workload(_))));
    }
}
