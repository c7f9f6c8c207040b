//! Pluggable body serialization for Fast frames.
//!
//! The codec and dispatch layers only ever see a [`Serializer`] trait object
//! operating on [`serde_json::Value`] trees, so the format is swappable
//! without touching call sites. Typed conversion happens at the edges
//! through [`to_body`] and [`from_body`].

use crate::error::SerializerError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Converts values to and from frame bodies.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializerError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializerError>;
}

/// Default serializer: UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializerError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializerError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializerError> {
        // An empty body stands for "no value"
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Deserialize(e.to_string()))
    }
}

/// Serialize a typed value into a frame body.
pub fn to_body<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<Bytes, SerializerError> {
    let value = to_value(value)?;
    serializer.serialize(&value)
}

/// Deserialize a frame body into a typed value.
pub fn from_body<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T, SerializerError> {
    let value = serializer.deserialize(bytes)?;
    from_value(value)
}

pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, SerializerError> {
    serde_json::to_value(value).map_err(|e| SerializerError::Serialize(e.to_string()))
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, SerializerError> {
    serde_json::from_value(value).map_err(|e| SerializerError::Deserialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_typed_body() {
        let body = to_body(&JsonSerializer, &Point { x: 1, y: -2 }).unwrap();
        assert_eq!(&body[..], br#"{"x":1,"y":-2}"#);

        let point: Point = from_body(&JsonSerializer, &body).unwrap();
        assert_eq!(point, Point { x: 1, y: -2 });
    }

    #[test]
    fn test_params_array() {
        let body = JsonSerializer.serialize(&json!([1, 2, 3])).unwrap();
        assert_eq!(&body[..], b"[1,2,3]");
    }

    #[test]
    fn test_empty_body_is_null() {
        assert_eq!(JsonSerializer.deserialize(b"").unwrap(), Value::Null);
        let unit: () = from_body(&JsonSerializer, b"").unwrap();
        assert_eq!(unit, ());
    }

    #[test]
    fn test_deserialize_failure() {
        let err = JsonSerializer.deserialize(b"{not json").unwrap_err();
        assert!(matches!(err, SerializerError::Deserialize(_)));

        let err = from_body::<i32>(&JsonSerializer, b"\"six\"").unwrap_err();
        assert!(matches!(err, SerializerError::Deserialize(_)));
    }
}
