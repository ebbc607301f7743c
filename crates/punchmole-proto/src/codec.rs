//! Codec for control frames and binary payloads
//!
//! Control frames are JSON text. Byte payloads (HTTP body chunks, WebSocket
//! frame contents) have to survive that JSON round trip, so each byte is
//! mapped onto the code point with the same value (Latin-1) instead of being
//! base64-encoded. Decoding keeps the low byte of each UTF-16 code unit.

use crate::messages::ControlMessage;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Deref;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Frame has no `type` field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Map every byte onto the code point of the same value
pub fn encode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`encode_latin1`]
pub fn decode_latin1(text: &str) -> Vec<u8> {
    text.encode_utf16().map(|unit| (unit & 0xff) as u8).collect()
}

/// Opaque byte payload, Latin-1 encoded on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_latin1(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::from(decode_latin1(&text)))
    }
}

/// Control frame codec
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a control message as a JSON text frame
    pub fn encode<M: ControlMessage>(msg: &M) -> Result<String, CodecError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a JSON text frame
    pub fn decode<M: ControlMessage>(text: &str) -> Result<M, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(CodecError::MissingType)?;

        if !M::TYPES.iter().any(|known| *known == kind) {
            return Err(CodecError::UnknownType(kind.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Decode a frame that arrived as binary but carries JSON text
    pub fn decode_bytes<M: ControlMessage>(data: &[u8]) -> Result<M, CodecError> {
        let text = std::str::from_utf8(data).map_err(|_| CodecError::NotUtf8)?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AgentMessage, RelayMessage};
    use crate::StreamId;

    #[test]
    fn test_latin1_round_trip_all_byte_values() {
        let all: Vec<u8> = (0..=255u8).collect();
        let encoded = encode_latin1(&all);
        assert_eq!(encoded.chars().count(), 256);
        assert_eq!(decode_latin1(&encoded), all);
    }

    #[test]
    fn test_latin1_round_trip_through_json() {
        let bytes: Vec<u8> = (0..=255u8).rev().chain(0..=255u8).collect();
        let json = serde_json::to_string(&Payload::from(bytes.clone())).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(&*back, bytes.as_slice());
    }

    #[test]
    fn test_latin1_is_not_inflated_like_base64() {
        let bytes = vec![b'a'; 300];
        assert_eq!(encode_latin1(&bytes).len(), 300);
    }

    #[test]
    fn test_decode_keeps_low_byte_of_wide_code_units() {
        // U+0141 has low byte 0x41
        assert_eq!(decode_latin1("\u{0141}"), vec![0x41]);
    }

    #[test]
    fn test_decode_agent_message() {
        let msg: AgentMessage =
            ControlCodec::decode(r#"{"type":"register","apiKey":"k1","domain":"a.test"}"#)
                .unwrap();
        assert_eq!(
            msg,
            AgentMessage::Register {
                api_key: "k1".to_string(),
                domain: "a.test".to_string(),
            }
        );
    }

    #[test]
    fn test_encode_relay_message_shape() {
        let msg = RelayMessage::RequestDataEnd {
            id: StreamId::from("abc"),
        };
        let text = ControlCodec::encode(&msg).unwrap();
        assert_eq!(text, r#"{"type":"request-data-end","id":"abc"}"#);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(
            ControlCodec::decode::<AgentMessage>("not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            ControlCodec::decode::<AgentMessage>(r#"{"id":"x"}"#),
            Err(CodecError::MissingType)
        ));
        assert!(matches!(
            ControlCodec::decode::<AgentMessage>(r#"{"type":"hello"}"#),
            Err(CodecError::UnknownType(t)) if t == "hello"
        ));
        // relay-only message type sent in the wrong direction
        assert!(matches!(
            ControlCodec::decode::<AgentMessage>(r#"{"type":"request-end","id":"x"}"#),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(
            ControlCodec::decode_bytes::<AgentMessage>(&[0xff, 0xfe]),
            Err(CodecError::NotUtf8)
        ));
    }

    #[test]
    fn test_known_type_with_missing_field_is_json_error() {
        assert!(matches!(
            ControlCodec::decode::<AgentMessage>(r#"{"type":"data-end"}"#),
            Err(CodecError::Json(_))
        ));
    }
}
