//! Snapshot serializers for byte-oriented storage backends.
//!
//! [`MemoryCheckpointer`](crate::MemoryCheckpointer) stores `serde_json::Value`
//! directly, but file, database, and object-store backends persist bytes.
//! [`SnapshotSerializer`] is the seam between the two: [`JsonSerializer`] for
//! human-inspectable payloads, [`BincodeSerializer`] when size matters.

use crate::error::Result;
use serde_json::Value;

/// Converts execution snapshots to and from bytes.
pub trait SnapshotSerializer: Send + Sync {
    /// Serialize a snapshot to bytes.
    fn to_bytes(&self, state: &Value) -> Result<Vec<u8>>;

    /// Deserialize a snapshot from bytes.
    fn from_bytes(&self, bytes: &[u8]) -> Result<Value>;

    /// Short format tag, stored alongside payloads so backends can pick the
    /// right deserializer on load.
    fn format(&self) -> &'static str;
}

/// Plain-JSON serializer. Payloads stay greppable and diffable.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl SnapshotSerializer for JsonSerializer {
    fn to_bytes(&self, state: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn format(&self) -> &'static str {
        "json"
    }
}

/// Compact binary serializer backed by `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl SnapshotSerializer for BincodeSerializer {
    fn to_bytes(&self, state: &Value) -> Result<Vec<u8>> {
        Ok(bincode::serialize(state)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn format(&self) -> &'static str {
        "bincode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "schema_version": 1,
            "paths": [{"id": "path_0", "status": "active"}],
            "context_state": {"Counter": {"value": 3}},
        })
    }

    #[test]
    fn test_json_round_trip() {
        let s = JsonSerializer;
        let bytes = s.to_bytes(&sample()).unwrap();
        assert_eq!(s.from_bytes(&bytes).unwrap(), sample());
        assert_eq!(s.format(), "json");
    }

    #[test]
    fn test_bincode_round_trip() {
        let s = BincodeSerializer;
        let bytes = s.to_bytes(&sample()).unwrap();
        assert_eq!(s.from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_json_rejects_garbage() {
        let s = JsonSerializer;
        assert!(s.from_bytes(b"not json").is_err());
    }
}
