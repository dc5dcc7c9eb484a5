//! Payment header codec.
//!
//! A payment header is a JSON object serialized to UTF-8 and wrapped in standard,
//! padded base64. [`decode`] is the exact inverse of [`encode`] and never yields a
//! partial record.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::util::Base64Bytes;

/// Decoded header record: field name to raw JSON value.
pub type HeaderRecord = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payment header is not standard base64")]
    Malformed,
    #[error("payment header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payment header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payment header must decode to a JSON object")]
    NotAnObject,
}

/// Serializes `record` to JSON, then base64. Deterministic for a given value.
pub fn encode<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(record)?;
    Ok(Base64Bytes::encode(json).to_string())
}

pub fn decode(header: &str) -> Result<HeaderRecord, DecodeError> {
    let encoded = Base64Bytes::from(header);
    if !encoded.is_well_formed() {
        return Err(DecodeError::Malformed);
    }
    let json = encoded.decode()?;
    match serde_json::from_slice::<Value>(&json)? {
        Value::Object(record) => Ok(record),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Non-failing pre-check over the base64 shape only.
pub fn is_well_formed(header: &str) -> bool {
    Base64Bytes::from(header).is_well_formed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_op::tests::sample_record;
    use crate::user_op::validate_structure;
    use alloy_primitives::U256;
    use serde_json::json;

    #[test]
    fn round_trips_a_record() {
        let record = json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "7",
            "callData": "0xa9059cbb",
        });
        let header = encode(&record).unwrap();
        assert!(is_well_formed(&header));
        let decoded = decode(&header).unwrap();
        assert_eq!(Value::Object(decoded), record);
    }

    #[test]
    fn round_trips_a_user_operation() {
        let op = validate_structure(&sample_record()).unwrap();
        let header = encode(&op).unwrap();
        assert!(is_well_formed(&header));
        let decoded = validate_structure(&decode(&header).unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn round_trips_decimal_quantities() {
        let record = sample_record();
        let header = encode(&record).unwrap();
        let decoded = decode(&header).unwrap();
        assert_eq!(decoded, record);
        let op = validate_structure(&decoded).unwrap();
        assert_eq!(op, validate_structure(&record).unwrap());
        assert_eq!(op.call_gas_limit, U256::from(100_000u64));
        assert_eq!(op.max_fee_per_gas, U256::from(1_000_000_000u64));
    }

    #[test]
    fn rejects_surrounding_whitespace() {
        let header = encode(&json!({"a": 1})).unwrap();
        for padded in [format!(" {header}"), format!("{header}\n"), format!("\t{header} ")] {
            assert!(!is_well_formed(&padded));
            assert!(matches!(decode(&padded), Err(DecodeError::Malformed)));
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let record = json!({"a": "1", "b": [1, 2, 3]});
        assert_eq!(encode(&record).unwrap(), encode(&record).unwrap());
    }

    #[test]
    fn rejects_invalid_alphabet() {
        assert!(matches!(decode("eyJh*joxfQ=="), Err(DecodeError::Malformed)));
        assert!(!is_well_formed("eyJh*joxfQ=="));
    }

    #[test]
    fn rejects_length_not_multiple_of_four() {
        assert!(matches!(decode("eyJhIjoxfQ="), Err(DecodeError::Malformed)));
        assert!(!is_well_formed("eyJhIjoxfQ="));
    }

    #[test]
    fn rejects_non_json_payload() {
        let header = Base64Bytes::encode("not json").to_string();
        assert!(matches!(decode(&header), Err(DecodeError::Json(_))));
    }

    #[test]
    fn rejects_non_object_json() {
        let header = encode(&json!([1, 2, 3])).unwrap();
        assert!(matches!(decode(&header), Err(DecodeError::NotAnObject)));
    }
}
