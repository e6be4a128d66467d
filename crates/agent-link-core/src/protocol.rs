//! Wire protocol for client-agent communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Exchange identifier, unique while the exchange is pending.
pub type RequestId = String;

/// Named arguments for instructions and tool calls.
pub type Arguments = Map<String, Value>;

/// Generate a fresh locally-unique request identifier.
#[must_use]
pub fn new_request_id() -> RequestId {
    format!("req_{}", Uuid::new_v4().simple())
}

/// Input carried by an outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Input {
    /// Plain text prompt.
    Text(String),
    /// Image payload (base64 encoded).
    Image {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Named command with parameters.
    Instruction {
        command: String,
        #[serde(default)]
        parameters: Arguments,
    },
    /// File upload (base64 encoded).
    File {
        filename: String,
        content_type: String,
        data: String,
    },
    /// Several inputs sent as one request.
    Multi(Vec<Input>),
    /// Stop whatever the agent is currently producing.
    Interrupt {},
    /// Produce the last answer again.
    Regenerate {},
    /// Ask the agent for its command catalogue.
    #[serde(rename = "GetCommands")]
    ListCommands {},
    /// Human decision on a pending tool confirmation.
    #[serde(rename = "ToolConfirmationResponse")]
    ToolConfirmationAnswer {
        name: String,
        #[serde(default)]
        arguments: Arguments,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Input {
    /// Create a text input.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create an image input from raw bytes.
    #[must_use]
    pub fn image(data: &[u8], mime_type: Option<String>) -> Self {
        Self::Image {
            data: BASE64.encode(data),
            mime_type,
        }
    }

    /// Create an instruction input.
    #[must_use]
    pub fn instruction(command: impl Into<String>, parameters: Arguments) -> Self {
        Self::Instruction {
            command: command.into(),
            parameters,
        }
    }

    /// Create a file input from raw bytes.
    #[must_use]
    pub fn file(filename: impl Into<String>, content_type: impl Into<String>, data: &[u8]) -> Self {
        Self::File {
            filename: filename.into(),
            content_type: content_type.into(),
            data: BASE64.encode(data),
        }
    }

    /// Decode the binary payload of an image or file input.
    #[must_use]
    pub fn decode_data(&self) -> Option<Vec<u8>> {
        match self {
            Self::Image { data, .. } | Self::File { data, .. } => BASE64.decode(data).ok(),
            _ => None,
        }
    }
}

/// Per-request options understood by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_try: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_before_tool_execution: Option<bool>,
    /// System prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Envelope sent from client to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub input: Input,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RequestConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tools: Option<bool>,
}

impl RequestEnvelope {
    /// Create a bare envelope with no request options.
    #[must_use]
    pub fn new(request_id: impl Into<RequestId>, input: Input) -> Self {
        Self {
            request_id: request_id.into(),
            input,
            config: None,
            stream: None,
            use_tools: None,
        }
    }
}

/// Token accounting reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Payload of an inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseContent {
    /// Complete textual answer.
    Text(String),
    /// One or more incremental fragments of a streamed answer.
    Stream(Vec<String>),
    /// Terminal marker of a streamed answer.
    StreamComplete {
        #[serde(default)]
        token_usage: Option<TokenUsage>,
        #[serde(default)]
        interrupted: bool,
    },
    /// Agent asks the client to run a tool.
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: Arguments,
    },
    /// Result of a tool execution.
    ToolResult {
        name: String,
        #[serde(default)]
        result: Value,
    },
    /// Agent asks a human to approve a tool before running it.
    ToolConfirmationRequest {
        name: String,
        #[serde(default)]
        arguments: Arguments,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Several payloads delivered together.
    Multi(Vec<ResponseContent>),
}

impl ResponseContent {
    /// Short name of the variant, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Stream(_) => "stream",
            Self::StreamComplete { .. } => "stream_complete",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolConfirmationRequest { .. } => "tool_confirmation_request",
            Self::Multi(_) => "multi",
        }
    }

    /// Extract the human-readable text of this payload.
    ///
    /// Composite payloads join their textual members with newlines.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Stream(chunks) => Some(chunks.concat()),
            Self::Multi(items) => {
                let texts: Vec<String> = items
                    .iter()
                    .filter(|item| matches!(item, Self::Text(_) | Self::Stream(_)))
                    .filter_map(Self::text)
                    .collect();
                Some(texts.join("\n"))
            }
            _ => None,
        }
    }
}

/// Envelope sent from agent to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub response: ResponseContent,
    /// Application-level error reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl ResponseEnvelope {
    /// Create an envelope without error or usage metadata.
    #[must_use]
    pub fn new(request_id: impl Into<RequestId>, response: ResponseContent) -> Self {
        Self {
            request_id: request_id.into(),
            response,
            error: None,
            token_usage: None,
        }
    }

    /// Build the envelope answering a tool call with its result.
    #[must_use]
    pub fn tool_result(
        request_id: impl Into<RequestId>,
        name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::new(
            request_id,
            ResponseContent::ToolResult {
                name: name.into(),
                result,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_image_payload_is_base64() {
        let input = Input::image(b"\x89PNG", Some("image/png".to_string()));
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json, json!({"Image": {"data": "iVBORw==", "mime_type": "image/png"}}));
        assert_eq!(input.decode_data().unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_unit_inputs_serialize_as_objects() {
        assert_eq!(
            serde_json::to_value(Input::Interrupt {}).unwrap(),
            json!({"Interrupt": {}})
        );
        assert_eq!(
            serde_json::to_value(Input::ListCommands {}).unwrap(),
            json!({"GetCommands": {}})
        );
    }

    #[test]
    fn test_confirmation_answer_wire_name() {
        let input = Input::ToolConfirmationAnswer {
            name: "execute_command".to_string(),
            arguments: Arguments::new(),
            approved: false,
            reason: Some("not now".to_string()),
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["ToolConfirmationResponse"]["approved"], json!(false));
        assert_eq!(json["ToolConfirmationResponse"]["reason"], json!("not now"));
    }

    #[test]
    fn test_request_omits_unset_options() {
        let envelope = RequestEnvelope::new("req_1", Input::text("hi"));
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"request_id":"req_1","input":{"Text":"hi"}}"#);
    }

    #[test]
    fn test_response_accepts_null_metadata() {
        let raw = r#"{"request_id":"welcome-001","response":{"Text":"hello"},"error":null,"token_usage":null}"#;
        let envelope: ResponseEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.request_id, "welcome-001");
        assert_eq!(envelope.response, ResponseContent::Text("hello".to_string()));
        assert!(envelope.error.is_none());
    }

    #[test]
    fn test_multi_text_joins_with_newlines() {
        let content = ResponseContent::Multi(vec![
            ResponseContent::Text("first".to_string()),
            ResponseContent::ToolResult {
                name: "ls".to_string(),
                result: json!([]),
            },
            ResponseContent::Stream(vec!["sec".to_string(), "ond".to_string()]),
        ]);
        assert_eq!(content.text().as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
