//! Payload codecs. A connector encodes outgoing values and decodes incoming
//! payloads with exactly one codec, JSON unless told otherwise.

use serde_json::Value;

use crate::error::CodecError;

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Serialize)
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::Empty);
        }
        serde_json::from_slice(payload).map_err(CodecError::Deserialize)
    }
}

/// Treats payloads as raw UTF-8 text. Only string values can be encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn name(&self) -> &'static str {
        "string"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(CodecError::Unsupported {
                codec: self.name(),
                kind: value_kind(other),
            }),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        let text = std::str::from_utf8(payload)?;
        Ok(Value::String(text.to_owned()))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
