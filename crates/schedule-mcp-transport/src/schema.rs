//! The subset of the MCP schema this server speaks: handshake, tools and
//! sampling payloads, serialized exactly as they travel over the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method names used across the protocol surface.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
}

/// Name and version of an MCP implementation, exchanged at handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerCapabilitiesTools {
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerCapabilitiesSampling {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ServerCapabilitiesTools>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<ServerCapabilitiesSampling>,
}

/// Capabilities a client may support. Only the fields this server inspects
/// are modelled; everything else is carried opaquely.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A tool the client can invoke via `tools/call`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// A single content block; this server only ever produces text blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text_content(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: Some(true),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: ContentBlock,
}

/// Parameters of a server-initiated `sampling/createMessage` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequestParams {
    pub messages: Vec<SamplingMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_context: Option<String>,
    pub max_tokens: i64,
}

/// The client's reply to a sampling request.
///
/// `content` stays an opaque value: a well-behaved client sends a text
/// block, but the consumer must be able to fall back to a stringified form
/// for anything else.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    pub model: String,
    pub role: Role,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl CreateMessageResult {
    /// The text of the content block, or the stringified content when the
    /// block is not a text block.
    pub fn content_text(&self) -> String {
        match self.content.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => self.content.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_message_params_serialize_camel_case() {
        let params = CreateMessageRequestParams {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: ContentBlock::text("ping"),
            }],
            include_context: Some("allServers".to_string()),
            max_tokens: 2000,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            json!({
                "messages": [
                    {"role": "user", "content": {"type": "text", "text": "ping"}}
                ],
                "includeContext": "allServers",
                "maxTokens": 2000
            })
        );
    }

    #[test]
    fn create_message_result_extracts_text() {
        let result: CreateMessageResult = serde_json::from_value(json!({
            "model": "m",
            "role": "assistant",
            "content": {"type": "text", "text": "pong"}
        }))
        .unwrap();
        assert_eq!(result.content_text(), "pong");
        assert_eq!(result.role, Role::Assistant);
    }

    #[test]
    fn create_message_result_falls_back_to_stringified_content() {
        let result: CreateMessageResult = serde_json::from_value(json!({
            "model": "m",
            "role": "assistant",
            "content": {"type": "image", "data": "…"}
        }))
        .unwrap();
        assert!(result.content_text().contains("image"));
    }

    #[test]
    fn initialize_result_wire_shape() {
        let result = InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools::default()),
                sampling: Some(ServerCapabilitiesSampling::default()),
            },
            server_info: Implementation {
                name: "schedule-task-mcp".to_string(),
                version: "0.1.0".to_string(),
            },
            instructions: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["capabilities"], json!({"tools": {}, "sampling": {}}));
        assert_eq!(value["protocolVersion"], json!("2025-06-18"));
    }
}
