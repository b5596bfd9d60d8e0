//! Binary encode/decode for message payloads, and the small integer/string
//! helpers used for header values.
//!
//! Payloads are JSON under the hood: a natural fit for nested maps,
//! keyword-like tags, UUIDs, and instants, and it round-trips exactly
//! (`decode(encode(x)) == x`) for every type in [`crate::model`].

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Serialize,
{
    serde_json::to_vec(value).map_err(|e| CodecError::Encode {
        type_tag: std::any::type_name::<T>(),
        reason: e.to_string(),
    })
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
        byte_count: bytes.len(),
        reason: e.to_string(),
    })
}

/// `int32_be ↔ 4 bytes`, for header values like `arcnet-schema-version`.
pub fn int32_be_encode(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn int32_be_decode(bytes: &[u8]) -> Result<i32, CodecError> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| CodecError::Decode {
        byte_count: bytes.len(),
        reason: "expected exactly 4 bytes for a big-endian int32 header value".to_string(),
    })?;
    Ok(i32::from_be_bytes(arr))
}

/// `string ↔ UTF-8 bytes`, for header values like `arcnet-entity-type`.
pub fn string_encode(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

pub fn string_decode(bytes: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| CodecError::Decode {
            byte_count: bytes.len(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnergySource, NodeDocument, Reservation};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn sample_node() -> NodeDocument {
        NodeDocument {
            id: Uuid::new_v4(),
            name: "node-a".to_string(),
            geozone: "caiso-west".to_string(),
            geohash: "9q8yyk".to_string(),
            energy_source: EnergySource::Solar,
            battery_level: 0.9,
            gpu_utilization: 0.1,
            gpu_memory_free_gb: 40.0,
            gpu_count: 8,
            gpu_memory_total_gb: 80.0,
            models_loaded: BTreeSet::from(["llama-70b".to_string()]),
            last_seen: Utc::now(),
            reservation: Some(Reservation {
                request_id: Uuid::new_v4(),
                expires_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn round_trips_a_node_document() {
        let node = sample_node();
        let bytes = encode(&node).unwrap();
        let decoded: NodeDocument = decode(&bytes).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn decode_failure_reports_byte_count() {
        let err = decode::<NodeDocument>(b"not json").unwrap_err();
        match err {
            CodecError::Decode { byte_count, .. } => assert_eq!(byte_count, 8),
            other => panic!("expected Decode error, got {other:?}"),
        }
    }

    #[test]
    fn int32_be_round_trips() {
        for v in [0, 1, -1, i32::MIN, i32::MAX] {
            let encoded = int32_be_encode(v);
            assert_eq!(int32_be_decode(&encoded).unwrap(), v);
        }
        assert_eq!(encoded_len(), 4);
    }

    fn encoded_len() -> usize {
        int32_be_encode(7).len()
    }

    #[test]
    fn string_round_trips() {
        let s = "DispatchCommand";
        assert_eq!(string_decode(&string_encode(s)).unwrap(), s);
    }

    proptest::proptest! {
        #[test]
        fn int32_be_round_trips_any_value(v in proptest::prelude::any::<i32>()) {
            let encoded = int32_be_encode(v);
            proptest::prop_assert_eq!(int32_be_decode(&encoded).unwrap(), v);
        }

        #[test]
        fn string_round_trips_any_utf8(s in ".*") {
            proptest::prop_assert_eq!(string_decode(&string_encode(&s)).unwrap(), s);
        }
    }
}
