//! Wire types of the agent API.

use serde::{Deserialize, Serialize};

use crate::diff::FileDiffStat;
use crate::pipeline::{InteractionMode, MachineCheckpoint};
use crate::validate::FileMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    StageResult,
    RuntimeError,
    RefinementRequest,
    ReviewResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "agent")]
    Assistant,
}

/// One turn of the conversation history sent by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Opaque state handed back to the platform and returned on the next request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_state: Option<MachineCheckpoint>,
}

/// Per-request overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default, alias = "max_iterations")]
    pub max_iterations: Option<usize>,
    #[serde(default, alias = "interaction_mode")]
    pub interaction_mode: Option<InteractionMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub all_messages: Vec<ConversationMessage>,
    pub application_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub agent_state: Option<AgentState>,
    #[serde(default)]
    pub all_files: Option<Vec<FileEntry>>,
    #[serde(default)]
    pub settings: Option<AgentSettings>,
}

impl AgentRequest {
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.application_id, self.trace_id)
    }

    /// `allFiles` as a file map; empty when absent.
    pub fn snapshot_files(&self) -> FileMap {
        self.all_files
            .iter()
            .flatten()
            .map(|f| (f.path.clone(), f.content.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub role: MessageRole,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_diff_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stat: Option<Vec<FileDiffStat>>,
    #[serde(rename = "app_name", default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(rename = "commit_message", default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

impl AgentMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            kind,
            content: content.into(),
            agent_state: None,
            unified_diff: None,
            complete_diff_hash: None,
            diff_stat: None,
            app_name: None,
            commit_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSseEvent {
    pub status: AgentStatus,
    pub trace_id: String,
    pub message: AgentMessage,
}

impl AgentSseEvent {
    /// The event as one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"idle","traceId":"","message":{{"role":"assistant","kind":"RuntimeError","content":"serialization failed: {e}"}}}}"#)
        });
        format!("data: {json}\n\n")
    }

    pub fn runtime_error(trace_id: &str, content: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Idle,
            trace_id: trace_id.to_string(),
            message: AgentMessage::new(MessageKind::RuntimeError, content),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_parses_camel_case_fields() {
        let request: AgentRequest = serde_json::from_value(json!({
            "allMessages": [{"role": "user", "content": "todo app"}],
            "applicationId": "app",
            "traceId": "trace",
            "allFiles": [{"path": "package.json", "content": "{}"}],
            "settings": {"maxIterations": 5, "interactionMode": "non_interactive"}
        }))
        .unwrap();
        assert_eq!(request.session_key(), "app:trace");
        assert_eq!(request.snapshot_files()["package.json"], "{}");
        let settings = request.settings.unwrap();
        assert_eq!(settings.max_iterations, Some(5));
        assert_eq!(settings.interaction_mode, Some(InteractionMode::NonInteractive));
        assert!(request.agent_state.is_none());
    }

    #[test]
    fn invalid_role_is_rejected() {
        let result = serde_json::from_value::<AgentRequest>(json!({
            "allMessages": [{"role": "robot", "content": "x"}],
            "applicationId": "a",
            "traceId": "t"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn message_uses_camel_case_except_app_name_and_commit_message() {
        let mut message = AgentMessage::new(MessageKind::ReviewResult, "done");
        message.unified_diff = Some("diff".into());
        message.complete_diff_hash = Some("abc".into());
        message.app_name = Some("todo-app".into());
        message.commit_message = Some("Add todos".into());
        message.agent_state = Some(AgentState::default());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "ReviewResult");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["unifiedDiff"], "diff");
        assert_eq!(json["completeDiffHash"], "abc");
        assert_eq!(json["app_name"], "todo-app");
        assert_eq!(json["commit_message"], "Add todos");
        assert_eq!(json["agentState"], json!({}));
    }

    #[test]
    fn sse_frame_is_a_data_line() {
        let event = AgentSseEvent::runtime_error("t1", "boom");
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        let parsed: AgentSseEvent = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(parsed.status, AgentStatus::Idle);
        assert_eq!(parsed.trace_id, "t1");
        assert_eq!(parsed.message.kind, MessageKind::RuntimeError);
    }
}
