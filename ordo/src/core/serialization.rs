use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Compute a stable hash of serialized bytes for parameter comparison.
///
/// SeaHash is stable across compiler versions, processes and machines, which
/// is what replay validation needs: the same step input must fingerprint to
/// the same value after a restart. It is not cryptographically secure.
pub fn hash_params(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

/// Serializes a value to bytes using JSON.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(CoreError::Serialization)
}

/// Deserializes bytes to a value using JSON.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the bytes cannot be deserialized.
pub fn deserialize_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(CoreError::Deserialization)
}

/// Serializes a value and returns the bytes together with their fingerprint.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<(Vec<u8>, u64)> {
    let bytes = serialize_value(value)?;
    let hash = hash_params(&bytes);
    Ok((bytes, hash))
}
