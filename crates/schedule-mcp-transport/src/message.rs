use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;

pub const JSONRPC_VERSION: &str = "2.0";

/// A uniquely identifying ID for a request in JSON-RPC.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(value) => write!(f, "{value}"),
            RequestId::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// A JSON-RPC error object, also used as the payload of error frames.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    /// The error type that occurred (standard JSON-RPC error codes).
    pub code: i64,
    /// A short description of the error.
    pub message: String,
    /// Additional information about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(-32600, "Invalid request")
    }

    pub fn method_not_found() -> Self {
        Self::new(-32601, "Method not found")
    }

    pub fn invalid_params() -> Self {
        Self::new(-32602, "Invalid params")
    }

    pub fn internal_error() -> Self {
        Self::new(-32603, "Internal error")
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }
}

/// A request that expects a response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonrpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonrpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message that expects no response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonrpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonrpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful response to a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonrpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl JsonrpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// An error frame replying to a request that could not be handled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonrpcError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: RpcError,
}

impl JsonrpcError {
    pub fn new(error: RpcError, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Any frame that may travel over the wire, in either direction.
///
/// Variant order matters for untagged deserialization: requests carry both
/// `id` and `method`, notifications only `method`, error frames `id` and
/// `error`, responses `id` and `result`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(JsonrpcRequest),
    Notification(JsonrpcNotification),
    Error(JsonrpcError),
    Response(JsonrpcResponse),
}

impl RpcMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, RpcMessage::Request(_))
    }

    /// The id a response to this frame must carry, when the frame is a
    /// request; `None` for notifications.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            RpcMessage::Request(request) => Some(&request.id),
            RpcMessage::Notification(_) => None,
            RpcMessage::Error(error) => Some(&error.id),
            RpcMessage::Response(response) => Some(&response.id),
        }
    }
}
