//! JSON-RPC 2.0 protocol types
//!
//! Frames are newline-delimited JSON objects. Besides plain responses the
//! server sends stream items, `{"jsonrpc":"2.0","id":N,"item":...}`, ahead
//! of the final response for streamed methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, ReplicationError};

/// JSON-RPC 2.0 Request
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }

    /// Check if this is a valid JSON-RPC 2.0 request
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == "2.0"
    }

    /// Check if this is a notification (no id)
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Success Response
#[derive(Serialize, Debug)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Value,
}

impl JsonRpcResponse {
    /// Create a new success response
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
        }
    }
}

/// One element of a streamed result
#[derive(Serialize, Debug)]
pub struct JsonRpcStreamItem {
    pub jsonrpc: String,
    pub id: Value,
    pub item: Value,
}

impl JsonRpcStreamItem {
    pub fn new(id: Value, item: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            item,
        }
    }
}

/// JSON-RPC 2.0 Error Response
#[derive(Serialize, Debug)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub id: Value,
    pub error: ErrorObject,
}

impl JsonRpcError {
    /// Create a new error response
    pub fn new(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            error: ErrorObject {
                code,
                message,
                data,
            },
        }
    }

    /// Create a parse error response
    pub fn parse_error(id: Value, details: String) -> Self {
        Self::new(
            id,
            codes::PARSE_ERROR,
            "Parse error".to_string(),
            Some(serde_json::json!({"details": details})),
        )
    }

    /// Create an invalid request error response
    pub fn invalid_request(id: Value, details: String) -> Self {
        Self::new(
            id,
            codes::INVALID_REQUEST,
            "Invalid Request".to_string(),
            Some(serde_json::json!({"details": details})),
        )
    }

    /// Create a method not found error response
    pub fn method_not_found(id: Value, method: String) -> Self {
        Self::new(
            id,
            codes::METHOD_NOT_FOUND,
            "Method not found".to_string(),
            Some(serde_json::json!({"method": method})),
        )
    }

    /// Create an invalid params error response
    pub fn invalid_params(id: Value, details: String) -> Self {
        Self::new(
            id,
            codes::INVALID_PARAMS,
            "Invalid params".to_string(),
            Some(serde_json::json!({"details": details})),
        )
    }

    /// Create an error response for a failed invocation
    pub fn from_error(id: Value, err: &ReplicationError) -> Self {
        let data = match err {
            ReplicationError::NotFound(key) => serde_json::json!({"key": key}),
            ReplicationError::AccessDenied { method } => serde_json::json!({"method": method}),
            ReplicationError::Unauthenticated(auth) => {
                serde_json::json!({"details": auth.to_string()})
            }
            other => serde_json::json!({"details": other.to_string()}),
        };
        Self::new(id, err.code(), err.to_string(), Some(data))
    }
}

/// JSON-RPC 2.0 Error Object
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create a new error object
    pub fn new(code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            code,
            message,
            data,
        }
    }

    pub fn into_error(self) -> ReplicationError {
        ReplicationError::from_remote(self.code, self.message, self.data.as_ref())
    }
}

/// Any frame a client can receive
#[derive(Debug)]
pub enum ServerFrame {
    Item { id: Value, item: Value },
    Result { id: Value, result: Value },
    Error { id: Value, error: ErrorObject },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Value,
    #[serde(default, deserialize_with = "present")]
    item: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

/// A present `null` is still a value (stored values may be null)
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ServerFrame {
    /// Decode one line received from a server
    pub fn parse(line: &str) -> Result<Self, ReplicationError> {
        let raw: RawFrame = serde_json::from_str(line)?;
        match (raw.error, raw.item, raw.result) {
            (Some(error), _, _) => Ok(ServerFrame::Error { id: raw.id, error }),
            (None, Some(item), _) => Ok(ServerFrame::Item { id: raw.id, item }),
            (None, None, Some(result)) => Ok(ServerFrame::Result { id: raw.id, result }),
            (None, None, None) => Err(ReplicationError::Protocol(format!(
                "frame has no result, item or error: {}",
                line
            ))),
        }
    }

    pub fn id(&self) -> &Value {
        match self {
            ServerFrame::Item { id, .. }
            | ServerFrame::Result { id, .. }
            | ServerFrame::Error { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = JsonRpcRequest::new(7, "fetch", Some(json!({"key": "a"})));
        let line = serde_json::to_string(&req).unwrap();
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","id":7,"method":"fetch","params":{"key":"a"}}"#
        );
    }

    #[test]
    fn test_parse_frames() {
        let item = ServerFrame::parse(r#"{"jsonrpc":"2.0","id":1,"item":{"key":"a"}}"#).unwrap();
        assert!(matches!(item, ServerFrame::Item { .. }));

        let done = ServerFrame::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"done":true}}"#).unwrap();
        assert!(matches!(done, ServerFrame::Result { .. }));
        assert_eq!(done.id(), &json!(1));

        let null = ServerFrame::parse(r#"{"jsonrpc":"2.0","id":5,"result":null}"#).unwrap();
        assert!(matches!(null, ServerFrame::Result { result: Value::Null, .. }));

        let err = ServerFrame::parse(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32004,"message":"x","data":{"key":"k"}}}"#,
        )
        .unwrap();
        match err {
            ServerFrame::Error { error, .. } => {
                assert!(matches!(error.into_error(), ReplicationError::NotFound(k) if k == "k"))
            }
            other => panic!("unexpected frame {:?}", other),
        }

        assert!(ServerFrame::parse(r#"{"jsonrpc":"2.0","id":3}"#).is_err());
    }

    #[test]
    fn test_error_response_carries_code_and_data() {
        let err = ReplicationError::AccessDenied {
            method: "version".to_string(),
        };
        let resp = JsonRpcError::from_error(json!(4), &err);
        assert_eq!(resp.error.code, codes::ACCESS_DENIED);
        assert_eq!(resp.error.data, Some(json!({"method": "version"})));
    }
}
