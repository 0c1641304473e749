//! Id coercion between the wire's primitive JSON-RPC id and the opaque
//! representation an upstream SDK message type wraps it in.
//!
//! Some JSON-RPC SDKs give no direct accessor to their `id` field short of
//! a full serde round trip. This module performs that round trip
//! explicitly: inbound values are normalized before being installed into
//! an SDK message; outbound SDK ids are inspected as `serde_json::Value`
//! first, falling back to a printed `{value:<payload>}`-shaped
//! representation only when the value does not already look like a JSON
//! primitive.

use serde_json::Value;

/// A coerced, wire-compatible JSON-RPC id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    String(String),
    Integer(i64),
    Null,
}

impl MessageId {
    pub fn to_value(&self) -> Value {
        match self {
            MessageId::String(s) => Value::String(s.clone()),
            MessageId::Integer(n) => Value::from(*n),
            MessageId::Null => Value::Null,
        }
    }
}

/// Inbound coercion: unmarshal `id` into a generic value; numeric values
/// with no fractional part become integers.
pub fn coerce_inbound(raw: Value) -> MessageId {
    match raw {
        Value::Null => MessageId::Null,
        Value::String(s) => MessageId::String(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MessageId::Integer(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    MessageId::Integer(f as i64)
                } else {
                    MessageId::String(n.to_string())
                }
            } else {
                MessageId::String(n.to_string())
            }
        }
        other => MessageId::String(other.to_string()),
    }
}

/// Outbound coercion from an arbitrary serializable SDK id container.
///
/// Fast path: serialize `sdk_id` and, if the result is already a JSON
/// primitive, use it directly. Slow path (documented as fragile — it
/// exists only to tolerate SDK versions that don't expose the id field
/// directly): if serialization instead yields a single-field object (the
/// shape a boxed/opaque id container serializes to), take that field's
/// value; if serialization fails outright, fall back to parsing the
/// type's `Debug` representation, printed as `{value:<payload>}`, trying
/// an integer parse first and the raw payload string second.
pub fn coerce_outbound<T: serde::Serialize + std::fmt::Debug>(sdk_id: &T) -> MessageId {
    if let Ok(value) = serde_json::to_value(sdk_id) {
        if let Some(primitive) = primitive_from_value(&value) {
            return primitive;
        }
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(inner) = map.values().next() {
                    if let Some(primitive) = primitive_from_value(inner) {
                        return primitive;
                    }
                }
            }
        }
    }
    parse_debug_repr(&format!("{sdk_id:?}"))
}

fn primitive_from_value(value: &Value) -> Option<MessageId> {
    match value {
        Value::Null => Some(MessageId::Null),
        Value::String(s) => Some(MessageId::String(s.clone())),
        Value::Number(n) => Some(coerce_inbound(Value::Number(n.clone()))),
        _ => None,
    }
}

/// Parse a `Debug`-printed representation such as `Id(Number(42))` or
/// `RequestId { value: "abc" }`, pulling out the innermost quoted string or
/// bare number. Used only when reflection into a serializable field fails.
fn parse_debug_repr(repr: &str) -> MessageId {
    let payload = repr
        .rsplit_once(':')
        .map(|(_, value)| value)
        .unwrap_or(repr)
        .trim()
        .trim_start_matches(['(', '{'])
        .trim_end_matches([')', '}'])
        .trim_matches('"')
        .trim();

    if let Ok(i) = payload.parse::<i64>() {
        return MessageId::Integer(i);
    }
    if payload.eq_ignore_ascii_case("null") || payload.is_empty() {
        return MessageId::Null;
    }
    MessageId::String(payload.to_string())
}
