pub mod id;

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque JSON-RPC id: string, integer, or absent.
pub use id::MessageId;

/// A decoded JSON-RPC frame, classified into one of the three message kinds.
#[derive(Debug, Clone)]
pub enum FramedMessage {
    Request {
        method: String,
        params: Option<Value>,
        id: MessageId,
    },
    Response {
        result: Option<Value>,
        error: Option<RpcError>,
        id: MessageId,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classify a raw JSON object read from the wire.
///
/// A `method` field present ⇒ Request (has `id`) or Notification (no `id`);
/// otherwise it is a Response.
pub fn decode(raw: &[u8]) -> Result<FramedMessage> {
    let value: Value = serde_json::from_slice(raw)?;
    decode_value(value)
}

pub fn decode_value(mut value: Value) -> Result<FramedMessage> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| GatewayError::ProtocolFailure("frame is not a JSON object".into()))?;

    if let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_owned) {
        let params = obj.remove("params");
        return Ok(match obj.remove("id") {
            Some(raw_id) => FramedMessage::Request {
                method,
                params,
                id: id::coerce_inbound(raw_id),
            },
            None => FramedMessage::Notification { method, params },
        });
    }

    let id = match obj.remove("id") {
        Some(raw_id) => id::coerce_inbound(raw_id),
        None => MessageId::Null,
    };
    let result = obj.remove("result");
    let error = match obj.remove("error") {
        Some(err_value) => Some(serde_json::from_value(err_value)?),
        None => None,
    };
    Ok(FramedMessage::Response { result, error, id })
}

/// Encode a frame back into a wire-ready JSON object, emitting only the
/// fields present for the message kind and coercing the id per
/// [`id::coerce_outbound_value`].
pub fn encode(message: &FramedMessage) -> Result<Vec<u8>> {
    let mut obj = serde_json::Map::new();
    obj.insert("jsonrpc".into(), Value::String("2.0".into()));
    match message {
        FramedMessage::Request { method, params, id } => {
            obj.insert("method".into(), Value::String(method.clone()));
            if let Some(params) = params {
                obj.insert("params".into(), params.clone());
            }
            obj.insert("id".into(), id.to_value());
        }
        FramedMessage::Notification { method, params } => {
            obj.insert("method".into(), Value::String(method.clone()));
            if let Some(params) = params {
                obj.insert("params".into(), params.clone());
            }
        }
        FramedMessage::Response { result, error, id } => {
            if let Some(result) = result {
                obj.insert("result".into(), result.clone());
            }
            if let Some(error) = error {
                obj.insert("error".into(), serde_json::to_value(error)?);
            }
            obj.insert("id".into(), id.to_value());
        }
    }
    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_string_int_and_null_ids() {
        for id in [MessageId::String("abc".into()), MessageId::Integer(42), MessageId::Null] {
            let msg = FramedMessage::Request {
                method: "ping".into(),
                params: None,
                id: id.clone(),
            };
            let encoded = encode(&msg).unwrap();
            let decoded = decode(&encoded).unwrap();
            match decoded {
                FramedMessage::Request { id: decoded_id, .. } => assert_eq!(decoded_id, id),
                other => panic!("unexpected decode: {other:?}"),
            }
        }
    }

    #[test]
    fn numeric_round_trips_as_integer_not_float() {
        let msg = FramedMessage::Request {
            method: "ping".into(),
            params: None,
            id: MessageId::Integer(42),
        };
        let encoded = encode(&msg).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["id"], serde_json::json!(42));
        assert!(value["id"].is_i64());
    }

    #[test]
    fn classifies_notification_without_id() {
        let raw = br#"{"jsonrpc":"2.0","method":"log","params":{"level":"info"}}"#;
        let decoded = decode(raw).unwrap();
        assert!(matches!(decoded, FramedMessage::Notification { .. }));
    }

    #[test]
    fn classifies_response_without_method() {
        let raw = br#"{"jsonrpc":"2.0","result":{"ok":true},"id":7}"#;
        let decoded = decode(raw).unwrap();
        match decoded {
            FramedMessage::Response { id, .. } => assert_eq!(id, MessageId::Integer(7)),
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
