//! Keeps the lines containing a pattern. The pattern is the auxiliary
//! argument; an empty pattern matches every line.
//!
//! There is no reducer: matching lines stay on the member that mapped them
//! until the job result is collected.

use bytes::Bytes;

use common::utils::string_from_bytes;
use common::{KeyValue, MapOutput};

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let pattern = string_from_bytes(aux)?;
    let line = string_from_bytes(kv.value())?;
    let matched = line
        .contains(pattern.as_str())
        .then(|| Ok::<_, anyhow::Error>(KeyValue::new(kv.key, line)));
    Ok(Box::new(matched.into_iter()))
}
