use anyhow::Context;
use bytes::Bytes;

/// Interprets `bytes` as UTF-8.
pub fn string_from_bytes(bytes: Bytes) -> anyhow::Result<String> {
    String::from_utf8(bytes.to_vec()).context("value is not valid UTF-8")
}

/// Parses `bytes` as a decimal unsigned integer.
pub fn u64_from_bytes(bytes: &Bytes) -> anyhow::Result<u64> {
    let s = std::str::from_utf8(bytes).context("value is not valid UTF-8")?;
    s.trim()
        .parse()
        .with_context(|| format!("`{s}` is not a number"))
}
