// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serializers
//!
//! The serializer turns message values into bytes on the way out and bytes
//! back into values on the way in. Subscriptions pass the name of their payload
//! type as a hint so codecs that dispatch on type can do so; the value is then
//! converted into the subscription's Rust type.

use crate::errors::AmqpError;
use serde_json::Value;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Pluggable payload codec.
pub trait Serializer: Send + Sync {
    /// Content type stamped on messages this serializer encodes.
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, AmqpError>;

    /// Decodes `data`, failing with [`AmqpError::DeserializationError`] when
    /// the bytes do not describe a value.
    fn deserialize(&self, type_hint: &str, data: &[u8]) -> Result<Value, AmqpError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    fn deserialize(&self, type_hint: &str, data: &[u8]) -> Result<Value, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::DeserializationError {
            type_hint: type_hint.to_owned(),
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_keeps_structure() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&json!({"message": "hello world"})).unwrap();

        assert_eq!(bytes, br#"{"message":"hello world"}"#);
        assert_eq!(
            serializer.deserialize("Greeting", &bytes).unwrap(),
            json!({"message": "hello world"})
        );
    }

    #[test]
    fn malformed_bytes_fail_with_deserialization_error() {
        let err = JsonSerializer.deserialize("Greeting", b"{not json").unwrap_err();

        assert!(matches!(
            err,
            AmqpError::DeserializationError { ref type_hint, .. } if type_hint == "Greeting"
        ));
    }
}
