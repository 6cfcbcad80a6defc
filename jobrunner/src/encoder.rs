use serde::{de::DeserializeOwned, Serialize};

pub fn encode(input: impl Serialize) -> anyhow::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(&input)?)
}

pub fn decode<T: DeserializeOwned>(input: &[u8]) -> anyhow::Result<T> {
    Ok(rmp_serde::from_slice(input)?)
}

/// An empty slice is "nothing" rather than an error.
pub fn decode_optional<T: DeserializeOwned>(input: &[u8]) -> anyhow::Result<Option<T>> {
    if input.is_empty() {
        return Ok(None);
    }
    decode(input).map(Some)
}
