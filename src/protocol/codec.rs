//! Stateless conversion between wire text and typed JSON-RPC messages.
//!
//! [`parse_message`] validates inbound envelopes before anything is routed:
//! a message that carries an `id` is a request, one without is a
//! notification. `id: null` is rejected outright so that rule never has to
//! guess.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId,
};
use serde_json::{Map, Value};

/// Parse and validate an inbound request or notification.
pub fn parse_message(text: &str) -> ProtocolResult<Message> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::ParseError)?;

    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidRequest(
            "message must be a JSON object".into(),
        ));
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => {
            return Err(ProtocolError::InvalidRequest(
                "jsonrpc must be \"2.0\"".into(),
            ));
        }
        None => return Err(ProtocolError::InvalidRequest("missing jsonrpc".into())),
    }

    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => {
            return Err(ProtocolError::InvalidRequest(
                "method must be a string".into(),
            ));
        }
        None => return Err(ProtocolError::InvalidRequest("missing method".into())),
    };

    let params = match object.remove("params") {
        None => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(_) => {
            return Err(ProtocolError::InvalidRequest(
                "params must be an object or an array".into(),
            ));
        }
    };

    match object.remove("id") {
        None => Ok(Message::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method,
            params,
        })),
        Some(id) => {
            let id = id_from_value(&id).ok_or_else(|| {
                ProtocolError::InvalidRequest("id must be a string or an integer".into())
            })?;
            Ok(Message::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                method,
                params,
            }))
        }
    }
}

/// Parse a response received by a client.
pub fn parse_response(text: &str) -> ProtocolResult<JsonRpcResponse> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::ParseError)?;
    let response: JsonRpcResponse = serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidRequest(e.to_string().into()))?;

    if response.jsonrpc != JSONRPC_VERSION {
        return Err(ProtocolError::InvalidRequest(
            "jsonrpc must be \"2.0\"".into(),
        ));
    }
    if response.result.is_some() == response.error.is_some() {
        return Err(ProtocolError::InvalidRequest(
            "response must carry exactly one of result or error".into(),
        ));
    }
    Ok(response)
}

/// Best-effort recovery of the id from a message that failed validation.
pub fn recover_id(text: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id").and_then(id_from_value)
}

fn id_from_value(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

pub fn create_request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.into(),
        id: id.into(),
        method: method.to_string(),
        params,
    }
}

pub fn create_response(id: RequestId, result: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(id, result)
}

/// Build an error response. A missing id is replaced by [`RequestId::SENTINEL`].
pub fn create_error_response(
    id: Option<RequestId>,
    code: i32,
    message: impl Into<String>,
    data: Option<Value>,
) -> JsonRpcResponse {
    let mut error = JsonRpcError::new(code, message);
    error.data = data;
    JsonRpcResponse::error(id.unwrap_or(RequestId::SENTINEL), error)
}

/// Error response for a [`ProtocolError`].
pub fn error_response(id: Option<RequestId>, error: &ProtocolError) -> JsonRpcResponse {
    create_error_response(id, error.code(), error.to_string(), None)
}

pub fn create_notification(method: &str, params: Option<Value>) -> JsonRpcNotification {
    JsonRpcNotification {
        jsonrpc: JSONRPC_VERSION.into(),
        method: method.to_string(),
        params,
    }
}

/// Serialize any message to its wire form.
pub fn serialize(message: &Message) -> String {
    match message {
        Message::Request(r) => to_wire(r),
        Message::Response(r) => to_wire(r),
        Message::Notification(n) => to_wire(n),
    }
}

pub fn serialize_response(response: &JsonRpcResponse) -> String {
    to_wire(response)
}

fn to_wire<T: serde::Serialize>(value: &T) -> String {
    // Every protocol type serializes to a JSON object with string keys.
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {}", e);
        serialize_response(&create_error_response(
            None,
            crate::error::codes::INTERNAL_ERROR,
            "Failed to serialize message",
            None,
        ))
    })
}

/// Take a key out of an object-shaped params value.
pub(crate) fn take_param(params: &mut Option<Value>, key: &str) -> Option<Value> {
    match params {
        Some(Value::Object(map)) => map.remove(key),
        _ => None,
    }
}

/// Params as an object, treating an absent value as empty.
pub(crate) fn params_object(params: Option<Value>) -> ProtocolResult<Map<String, Value>> {
    match params {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ProtocolError::InvalidParams(
            "params must be an object".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        match msg {
            Message::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "tools/list");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn test_parse_string_id() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":"abc","method":"x","params":[1]}"#)
            .unwrap();
        let Message::Request(r) = msg else {
            panic!("expected request");
        };
        assert_eq!(r.id, RequestId::String("abc".into()));
        assert_eq!(r.params, Some(json!([1])));
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(parse_message("{not json"), Err(ProtocolError::ParseError));
        assert_eq!(parse_message(""), Err(ProtocolError::ParseError));
    }

    #[test]
    fn test_invalid_requests() {
        let cases = [
            r#"[]"#,
            r#"42"#,
            r#"{"id":1,"method":"x"}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#,
            r#"{"jsonrpc":2.0,"id":1,"method":"x"}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":7}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":"x","params":"s"}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":"x","params":null}"#,
            r#"{"jsonrpc":"2.0","id":null,"method":"x"}"#,
            r#"{"jsonrpc":"2.0","id":{"a":1},"method":"x"}"#,
            r#"{"jsonrpc":"2.0","id":1.5,"method":"x"}"#,
        ];
        for case in cases {
            let err = parse_message(case).unwrap_err();
            assert_eq!(err.code(), -32600, "case {case}");
        }
    }

    #[test]
    fn test_error_response_sentinel_id() {
        let response = create_error_response(None, -32700, "Parse error", None);
        assert_eq!(response.id, RequestId::Number(0));
        let text = serialize_response(&response);
        assert!(text.contains("\"id\":0"));
    }

    #[test]
    fn test_error_response_with_data() {
        let response = create_error_response(Some(7.into()), -32602, "bad", Some(json!({"k": 1})));
        let error = response.error.unwrap();
        assert_eq!(error.data, Some(json!({"k": 1})));
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(
            recover_id(r#"{"jsonrpc":"1.0","id":"r-1","method":"x"}"#),
            Some(RequestId::String("r-1".into()))
        );
        assert_eq!(recover_id("{broken"), None);
        assert_eq!(recover_id(r#"{"id":null}"#), None);
    }

    #[test]
    fn test_parse_response() {
        let response = parse_response(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(response.id, RequestId::Number(3));
        assert!(parse_response(r#"{"jsonrpc":"2.0","id":3}"#).is_err());
        assert!(
            parse_response(r#"{"jsonrpc":"2.0","id":3,"result":1,"error":{"code":1,"message":"m"}}"#)
                .is_err()
        );
    }

    fn arb_id() -> impl Strategy<Value = RequestId> {
        prop_oneof![
            any::<i64>().prop_map(RequestId::Number),
            "[a-zA-Z0-9_-]{0,12}".prop_map(RequestId::String),
        ]
    }

    fn arb_params() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            ("[a-z]{1,8}", any::<i32>()).prop_map(|(k, v)| Some(json!({ k: v }))),
            prop::collection::vec(any::<bool>(), 0..4).prop_map(|v| Some(json!(v))),
        ]
    }

    proptest! {
        #[test]
        fn prop_request_round_trip(id in arb_id(), method in "[a-z/]{1,16}", params in arb_params()) {
            let message = Message::Request(create_request(id, &method, params));
            let wire = serialize(&message);
            let parsed = parse_message(&wire).unwrap();
            prop_assert_eq!(serialize(&parsed), wire);
            prop_assert_eq!(parsed, message);
        }

        #[test]
        fn prop_notification_round_trip(method in "[a-z/]{1,16}", params in arb_params()) {
            let message = Message::Notification(create_notification(&method, params));
            let wire = serialize(&message);
            let parsed = parse_message(&wire).unwrap();
            prop_assert_eq!(serialize(&parsed), wire);
        }

        #[test]
        fn prop_malformed_input_never_panics(text in ".{0,64}") {
            if let Err(e) = parse_message(&text) {
                prop_assert!(e.code() == -32700 || e.code() == -32600);
            }
        }
    }
}
