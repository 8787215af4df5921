//! Chat-completion seam.
//!
//! Everything above this module talks to an [`LlmClient`]; providers live in
//! submodules. Message and content-block shapes follow the Messages API so
//! the Anthropic client can serialize them without translation.

pub mod anthropic;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::LlmError;

pub use anthropic::AnthropicClient;
pub use scripted::ScriptedLlm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Block types we neither produce nor interpret (thinking, citations, ...).
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            stop_reason: Some("end_turn".into()),
        }
    }

    /// Text of the first text block, which is where tagged stage output lives.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(ContentBlock::as_text)
    }

    /// The completion as an assistant turn to send back. Unsupported blocks
    /// are dropped since they cannot be serialized in their original shape.
    pub fn into_message(self) -> Message {
        Message {
            role: Role::Assistant,
            content: self
                .content
                .into_iter()
                .filter(|b| *b != ContentBlock::Unsupported)
                .collect(),
        }
    }
}

/// Opaque chat-completion capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serializes_in_messages_api_shape() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".into(),
            name: "confirm_state".into(),
            input: serde_json::json!({}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "confirm_state");

        let result = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "toolu_1");
    }

    #[test]
    fn unknown_block_types_deserialize_as_unsupported() {
        let block: ContentBlock =
            serde_json::from_str(r#"{"type": "thinking", "thinking": "hmm"}"#).unwrap();
        assert_eq!(block, ContentBlock::Unsupported);
    }

    #[test]
    fn into_message_drops_unsupported_blocks() {
        let completion: Completion = serde_json::from_str(
            r#"{"content": [
                {"type": "thinking", "thinking": "hmm", "signature": "abc"},
                {"type": "tool_use", "id": "toolu_1", "name": "complete_fsm", "input": {}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(completion.content.len(), 2);

        let message = completion.into_message();
        assert_eq!(message.content.len(), 1);
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("unsupported"));
        assert!(json.contains("\"type\":\"tool_use\""));
    }

    #[test]
    fn message_text_joins_text_blocks_only() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("first"),
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "start_fsm".into(),
                    input: serde_json::json!({"app_description": "x"}),
                },
                ContentBlock::text("second"),
            ],
        };
        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn completion_first_text_skips_non_text_blocks() {
        let completion = Completion {
            content: vec![ContentBlock::Unsupported, ContentBlock::text("<typespec/>")],
            stop_reason: None,
        };
        assert_eq!(completion.first_text(), Some("<typespec/>"));
    }
}
