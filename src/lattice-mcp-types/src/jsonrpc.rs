//! JSON-RPC 2.0 envelopes.
//!
//! Inbound traffic is parsed through [`JsonRpcMessage`], which validates the
//! envelope shape before a message is handed to the rest of the client.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Request ID.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: String,
    /// ID of the request this answers.
    pub id: RequestId,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: impl Into<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Convert to Result.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Method not found error (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// Invalid params error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    /// Internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC error codes.
pub struct ErrorCode;

impl ErrorCode {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Any JSON-RPC message that can cross a transport.
///
/// Deserialization validates the envelope: `jsonrpc` must be `"2.0"`, a
/// message with `method` is a request (with `id`) or notification (without),
/// and a message without `method` must carry an `id` plus exactly one of
/// `result`/`error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Whether this is a request that expects an answer.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Parse a JSON payload holding either one message or an array of them.
    ///
    /// Each element is validated independently so one malformed entry does
    /// not hide the rest of a batch.
    pub fn parse_batch(value: Value) -> Vec<Result<Self, MessageValidationError>> {
        match value {
            Value::Array(items) => items.into_iter().map(Self::try_from).collect(),
            other => vec![Self::try_from(other)],
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        Self::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

/// Reason a JSON value was rejected as a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageValidationError {
    /// What was wrong with the envelope.
    pub reason: String,
    /// Compact rendering of the offending payload.
    pub payload: String,
}

impl MessageValidationError {
    fn new(reason: impl Into<String>, payload: &Value) -> Self {
        let mut rendered = payload.to_string();
        if rendered.len() > 200 {
            let mut cut = 200;
            while !rendered.is_char_boundary(cut) {
                cut -= 1;
            }
            rendered.truncate(cut);
            rendered.push_str("...");
        }
        Self {
            reason: reason.into(),
            payload: rendered,
        }
    }
}

impl std::fmt::Display for MessageValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid JSON-RPC message ({}): {}", self.reason, self.payload)
    }
}

impl std::error::Error for MessageValidationError {}

fn parse_id(value: &Value, original: &Value) -> Result<RequestId, MessageValidationError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| MessageValidationError::new("non-integer id", original)),
        Value::String(s) => Ok(RequestId::String(s.clone())),
        _ => Err(MessageValidationError::new(
            "id must be a string or integer",
            original,
        )),
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = MessageValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(ref obj) = value else {
            return Err(MessageValidationError::new("not an object", &value));
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => return Err(MessageValidationError::new("jsonrpc must be \"2.0\"", &value)),
        }

        let params = obj.get("params").cloned();
        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(parse_id(raw, &value)?),
        };

        if let Some(method) = obj.get("method") {
            let Some(method) = method.as_str() else {
                return Err(MessageValidationError::new("method must be a string", &value));
            };
            return Ok(match id {
                Some(id) => Self::Request(JsonRpcRequest {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    method: method.to_string(),
                    params,
                }),
                None => Self::Notification(JsonRpcNotification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method: method.to_string(),
                    params,
                }),
            });
        }

        let Some(id) = id else {
            return Err(MessageValidationError::new(
                "neither method nor id present",
                &value,
            ));
        };

        response_from_object(obj, id, &value).map(Self::Response)
    }
}

fn response_from_object(
    obj: &Map<String, Value>,
    id: RequestId,
    original: &Value,
) -> Result<JsonRpcResponse, MessageValidationError> {
    match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => Ok(JsonRpcResponse::success(id, result.clone())),
        (None, Some(error)) => {
            let error: JsonRpcError = serde_json::from_value(error.clone()).map_err(|e| {
                MessageValidationError::new(format!("bad error object: {e}"), original)
            })?;
            Ok(JsonRpcResponse::error(id, error))
        }
        (Some(_), Some(_)) => Err(MessageValidationError::new(
            "response carries both result and error",
            original,
        )),
        (None, None) => Err(MessageValidationError::new(
            "response carries neither result nor error",
            original,
        )),
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classifies_request_notification_response() {
        let request: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}))
                .expect("valid request");
        assert!(request.is_request());
        assert_eq!(request.method(), Some("tools/list"));

        let notification: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .expect("valid notification");
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let response: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "abc", "result": {}}))
                .expect("valid response");
        match response {
            JsonRpcMessage::Response(r) => assert_eq!(r.id, RequestId::from("abc")),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_round_trips_into_result() {
        let message = JsonRpcMessage::try_from(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "Method not found: nope"}
        }))
        .expect("valid error response");

        let JsonRpcMessage::Response(response) = message else {
            panic!("expected response");
        };
        let err = response.into_result().expect_err("should be an error");
        assert_eq!(err.code, ErrorCode::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        assert!(JsonRpcMessage::try_from(json!([1, 2])).is_err());
        assert!(JsonRpcMessage::try_from(json!({"jsonrpc": "1.0", "id": 1, "result": 1})).is_err());
        assert!(JsonRpcMessage::try_from(json!({"jsonrpc": "2.0"})).is_err());
        let both = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": 1,
            "error": {"code": 1, "message": "x"}
        });
        assert!(JsonRpcMessage::try_from(both).is_err());
        let fractional_id = json!({"jsonrpc": "2.0", "id": 1.5, "result": 1});
        assert!(JsonRpcMessage::try_from(fractional_id).is_err());
    }

    #[test]
    fn test_parse_batch_keeps_valid_entries() {
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "result": {"ok": true}},
            {"bogus": true},
            {"jsonrpc": "2.0", "method": "notifications/progress"}
        ]);

        let parsed = JsonRpcMessage::parse_batch(batch);
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_ok());
        assert!(parsed[1].is_err());
        assert!(parsed[2].is_ok());
    }

    #[test]
    fn test_serializes_without_wrapper() {
        let message = JsonRpcMessage::from(JsonRpcRequest::new(1, "ping"));
        let json = serde_json::to_value(&message).expect("serialization should succeed");
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
    }
}
