//! Payload codec: JSON wrapped in standard base64.
//!
//! Values stored through Tether are often structured. Encoding them as
//! base64 over JSON keeps the stored text printable, with no embedded
//! control characters.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, TetherError};

/// Encode a value into transport-safe text
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).map_err(|e| TetherError::Encoding(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

/// Decode text produced by [`encode`] into the requested shape
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = STANDARD
        .decode(text.trim())
        .map_err(|e| TetherError::Decoding(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| TetherError::Decoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Registration {
        node_id: String,
        port: u16,
        tags: Vec<String>,
    }

    #[test]
    fn test_round_trip_maps() {
        let feeds = vec![
            json!({"k11": "v11"}),
            json!({"k21": 1}),
            json!({"k31": {"k311": "v311", "k312": 1}}),
        ];

        for feed in feeds {
            let encoded = encode(&feed).unwrap();
            let decoded: Value = decode(&encoded).unwrap();
            assert_eq!(decoded, feed);
        }
    }

    #[test]
    fn test_round_trip_struct() {
        let reg = Registration {
            node_id: "node-1".to_string(),
            port: 8080,
            tags: vec!["primary".to_string(), "eu-west".to_string()],
        };

        let decoded: Registration = decode(&encode(&reg).unwrap()).unwrap();
        assert_eq!(decoded, reg);
    }

    #[test]
    fn test_encoding_is_printable() {
        let value = json!({"text": "line one\nline\ttwo\u{0}", "emoji": "🔒"});
        let encoded = encode(&value).unwrap();
        assert!(encoded.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn test_malformed_base64() {
        let result: Result<Value> = decode("not base64!!");
        assert!(matches!(result, Err(TetherError::Decoding(_))));
    }

    #[test]
    fn test_shape_mismatch() {
        let encoded = encode(&json!({"k21": "not a number"})).unwrap();
        let result: Result<BTreeMap<String, u32>> = decode(&encoded);
        assert!(matches!(result, Err(TetherError::Decoding(_))));
    }

    #[test]
    fn test_unserializable_value() {
        // JSON object keys must be strings
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], "bytes key");
        assert!(matches!(encode(&map), Err(TetherError::Encoding(_))));
    }
}
