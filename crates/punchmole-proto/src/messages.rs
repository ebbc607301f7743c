//! Control protocol message types
//!
//! One closed enum per direction. On the wire every message is a JSON object
//! tagged by a kebab-case `type` field with camelCase payload fields.

use crate::codec::Payload;
use crate::headers::Headers;
use crate::ids::StreamId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A message type that can travel over the control connection
pub trait ControlMessage: Serialize + DeserializeOwned {
    /// Every `type` tag this direction accepts
    const TYPES: &'static [&'static str];

    /// The `type` tag of this message
    fn kind(&self) -> &'static str;

    /// Stream this message is addressed to, `None` for connection-scoped messages
    fn stream_id(&self) -> Option<&StreamId>;
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Messages sent by the agent to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// Claim a domain
    Register { api_key: String, domain: String },

    /// Begin the response of an exchange
    ResponseStart {
        id: StreamId,
        status_code: u16,
        #[serde(default)]
        status_message: Option<String>,
        #[serde(default)]
        headers: Headers,
    },

    /// Response body chunk
    Data { id: StreamId, data: Payload },

    /// Response body complete
    DataEnd { id: StreamId },

    /// Outbound WebSocket to the internal service is open
    WebsocketConnection {
        id: StreamId,
        #[serde(default)]
        headers: Headers,
        #[serde(default)]
        url: String,
    },

    /// Frame received from the internal service
    WebsocketMessage {
        id: StreamId,
        raw_data: Payload,
        #[serde(default, skip_serializing_if = "is_false")]
        binary: bool,
    },

    /// Outbound WebSocket closed
    WebsocketConnectionClosed { id: StreamId },
}

impl ControlMessage for AgentMessage {
    const TYPES: &'static [&'static str] = &[
        "register",
        "response-start",
        "data",
        "data-end",
        "websocket-connection",
        "websocket-message",
        "websocket-connection-closed",
    ];

    fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Register { .. } => "register",
            AgentMessage::ResponseStart { .. } => "response-start",
            AgentMessage::Data { .. } => "data",
            AgentMessage::DataEnd { .. } => "data-end",
            AgentMessage::WebsocketConnection { .. } => "websocket-connection",
            AgentMessage::WebsocketMessage { .. } => "websocket-message",
            AgentMessage::WebsocketConnectionClosed { .. } => "websocket-connection-closed",
        }
    }

    fn stream_id(&self) -> Option<&StreamId> {
        match self {
            AgentMessage::Register { .. } => None,
            AgentMessage::ResponseStart { id, .. }
            | AgentMessage::Data { id, .. }
            | AgentMessage::DataEnd { id }
            | AgentMessage::WebsocketConnection { id, .. }
            | AgentMessage::WebsocketMessage { id, .. }
            | AgentMessage::WebsocketConnectionClosed { id } => Some(id),
        }
    }
}

/// Messages sent by the relay to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Registration accepted
    Registered { domain: String },

    /// Registration rejected or fatal connection error
    Error { message: String },

    /// New exchange
    RequestStart {
        id: StreamId,
        method: String,
        url: String,
        #[serde(default)]
        headers: Headers,
    },

    /// Request body chunk
    RequestData { id: StreamId, data: Payload },

    /// Request body complete
    RequestDataEnd { id: StreamId },

    /// Public client went away; abort the exchange
    RequestEnd { id: StreamId },

    /// New public WebSocket to relay
    WebsocketConnection {
        id: StreamId,
        #[serde(default)]
        headers: Headers,
        url: String,
    },

    /// Frame received from the public client
    WebsocketMessage {
        id: StreamId,
        raw_data: Payload,
        #[serde(default, skip_serializing_if = "is_false")]
        binary: bool,
    },

    /// Public WebSocket closed
    WebsocketConnectionClosed { id: StreamId },

    /// Public WebSocket reported an error (informational)
    WebsocketError { id: StreamId, error: String },
}

impl ControlMessage for RelayMessage {
    const TYPES: &'static [&'static str] = &[
        "registered",
        "error",
        "request-start",
        "request-data",
        "request-data-end",
        "request-end",
        "websocket-connection",
        "websocket-message",
        "websocket-connection-closed",
        "websocket-error",
    ];

    fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Registered { .. } => "registered",
            RelayMessage::Error { .. } => "error",
            RelayMessage::RequestStart { .. } => "request-start",
            RelayMessage::RequestData { .. } => "request-data",
            RelayMessage::RequestDataEnd { .. } => "request-data-end",
            RelayMessage::RequestEnd { .. } => "request-end",
            RelayMessage::WebsocketConnection { .. } => "websocket-connection",
            RelayMessage::WebsocketMessage { .. } => "websocket-message",
            RelayMessage::WebsocketConnectionClosed { .. } => "websocket-connection-closed",
            RelayMessage::WebsocketError { .. } => "websocket-error",
        }
    }

    fn stream_id(&self) -> Option<&StreamId> {
        match self {
            RelayMessage::Registered { .. } | RelayMessage::Error { .. } => None,
            RelayMessage::RequestStart { id, .. }
            | RelayMessage::RequestData { id, .. }
            | RelayMessage::RequestDataEnd { id }
            | RelayMessage::RequestEnd { id }
            | RelayMessage::WebsocketConnection { id, .. }
            | RelayMessage::WebsocketMessage { id, .. }
            | RelayMessage::WebsocketConnectionClosed { id }
            | RelayMessage::WebsocketError { id, .. } => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ControlCodec;
    use serde_json::json;

    fn to_value<M: ControlMessage>(msg: &M) -> serde_json::Value {
        serde_json::from_str(&ControlCodec::encode(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_response_start_wire_shape() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/html");
        let msg = AgentMessage::ResponseStart {
            id: StreamId::from("1f"),
            status_code: 200,
            status_message: Some("OK".to_string()),
            headers,
        };
        assert_eq!(
            to_value(&msg),
            json!({
                "type": "response-start",
                "id": "1f",
                "statusCode": 200,
                "statusMessage": "OK",
                "headers": {"content-type": "text/html"}
            })
        );
    }

    #[test]
    fn test_request_start_wire_shape() {
        let msg = RelayMessage::RequestStart {
            id: StreamId::from("2a"),
            method: "GET".to_string(),
            url: "/x?y=1".to_string(),
            headers: [("host", "a.test")].into_iter().collect(),
        };
        assert_eq!(
            to_value(&msg),
            json!({
                "type": "request-start",
                "id": "2a",
                "method": "GET",
                "url": "/x?y=1",
                "headers": {"host": "a.test"}
            })
        );
    }

    #[test]
    fn test_websocket_message_binary_flag_is_optional() {
        let text = RelayMessage::WebsocketMessage {
            id: StreamId::from("3"),
            raw_data: Payload::from("hi"),
            binary: false,
        };
        assert_eq!(
            to_value(&text),
            json!({"type": "websocket-message", "id": "3", "rawData": "hi"})
        );

        let decoded: RelayMessage =
            ControlCodec::decode(r#"{"type":"websocket-message","id":"3","rawData":"hi"}"#)
                .unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_response_start_tolerates_missing_optional_fields() {
        let msg: AgentMessage =
            ControlCodec::decode(r#"{"type":"response-start","id":"9","statusCode":204}"#)
                .unwrap();
        match msg {
            AgentMessage::ResponseStart {
                status_code,
                status_message,
                headers,
                ..
            } => {
                assert_eq!(status_code, 204);
                assert!(status_message.is_none());
                assert!(headers.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_types_table_matches_kind() {
        let agent = [
            AgentMessage::Register {
                api_key: String::new(),
                domain: String::new(),
            },
            AgentMessage::DataEnd {
                id: StreamId::from("a"),
            },
            AgentMessage::WebsocketConnectionClosed {
                id: StreamId::from("a"),
            },
        ];
        for msg in &agent {
            assert!(AgentMessage::TYPES.contains(&msg.kind()));
            assert_eq!(to_value(msg)["type"], msg.kind());
        }

        let relay = [
            RelayMessage::Error {
                message: "invalid api key".to_string(),
            },
            RelayMessage::RequestEnd {
                id: StreamId::from("b"),
            },
            RelayMessage::WebsocketError {
                id: StreamId::from("b"),
                error: "reset".to_string(),
            },
        ];
        for msg in &relay {
            assert!(RelayMessage::TYPES.contains(&msg.kind()));
            assert_eq!(to_value(msg)["type"], msg.kind());
        }
    }

    #[test]
    fn test_stream_id_is_none_for_connection_scoped_messages() {
        let registered = RelayMessage::Registered {
            domain: "a.test".to_string(),
        };
        assert!(registered.stream_id().is_none());

        let end = RelayMessage::RequestEnd {
            id: StreamId::from("z"),
        };
        assert_eq!(end.stream_id().map(StreamId::as_str), Some("z"));
    }
}
