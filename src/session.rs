//! One agent conversation driven through the FSM tools.
//!
//! A session restores the machine from the request's `agentState`, lets the
//! controlling model step through the tools, and streams an SSE event after
//! every step until the model stops, the machine finishes or fails, or the
//! iteration budget runs out.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::artifacts;
use crate::diff::{self, DiffSummary};
use crate::llm::{CompletionRequest, LlmClient, Message, Role};
use crate::pipeline::actors::ActorEnv;
use crate::pipeline::prompts;
use crate::pipeline::{Application, FsmState, InteractionMode, MachineCheckpoint};
use crate::server::models::{
    AgentMessage, AgentRequest, AgentSseEvent, AgentState, AgentStatus, ConversationMessage,
    MessageKind, MessageRole,
};
use crate::snapshot::SnapshotSaver;
use crate::tools::{FsmStatus, FsmToolProcessor};
use crate::validate::FileMap;

const NAMING_MAX_TOKENS: u32 = 256;

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionDeps {
    pub env: ActorEnv,
    /// The controlling agent's model.
    pub agent_llm: Arc<dyn LlmClient>,
    /// Names apps and writes commit messages; fallbacks are used when unset.
    pub naming_llm: Option<Arc<dyn LlmClient>>,
    pub template: Arc<FileMap>,
    pub snapshots: SnapshotSaver,
    pub mode: InteractionMode,
    pub max_iterations: usize,
}

/// Event content plus the optional extras some kinds carry.
#[derive(Default)]
struct EventExtras {
    fsm_state: Option<MachineCheckpoint>,
    diff: Option<DiffSummary>,
    app_name: Option<String>,
    commit_message: Option<String>,
}

pub struct AgentSession {
    application_id: String,
    trace_id: String,
    deps: SessionDeps,
    processor: FsmToolProcessor,
    template_diff_sent: bool,
    sse_counter: usize,
    last_kind: Option<MessageKind>,
}

impl AgentSession {
    pub fn new(application_id: &str, trace_id: &str, deps: SessionDeps) -> Self {
        let processor = FsmToolProcessor::new(deps.env.clone(), deps.mode);
        Self {
            application_id: application_id.to_string(),
            trace_id: trace_id.to_string(),
            deps,
            processor,
            template_diff_sent: false,
            sse_counter: 0,
            last_kind: None,
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Whether a machine was started or restored in this session.
    pub fn has_machine(&self) -> bool {
        self.processor.app().is_some()
    }

    /// Whether the last request ended the conversation, either with a
    /// runtime error or with the final review result.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.last_kind,
            Some(MessageKind::RuntimeError | MessageKind::ReviewResult)
        )
    }

    /// Handle one request, streaming events into `events`. Errors never
    /// escape: they become a final `RuntimeError` event.
    pub async fn process(&mut self, request: &AgentRequest, events: mpsc::Sender<AgentSseEvent>) {
        tracing::info!(application_id = %self.application_id, trace_id = %self.trace_id, "Processing request");
        self.last_kind = None;

        let mut messages = convert_messages(&request.all_messages);
        if let Err(e) = self.run(request, &mut messages, &events).await {
            tracing::error!(trace_id = %self.trace_id, error = %e, "Error processing request");
            self.send(
                &events,
                AgentStatus::Idle,
                MessageKind::RuntimeError,
                format!("Error processing request: {e}"),
                EventExtras::default(),
            )
            .await;
        }

        if let Some(app) = self.processor.app() {
            self.deps
                .snapshots
                .save_or_warn(&self.trace_id, "fsm_exit", &app.checkpoint());
        }
        if !messages.is_empty() {
            self.deps
                .snapshots
                .save_or_warn(&self.trace_id, "fsmtools_messages", &messages);
        }
    }

    async fn run(
        &mut self,
        request: &AgentRequest,
        messages: &mut Vec<Message>,
        events: &mpsc::Sender<AgentSseEvent>,
    ) -> Result<()> {
        let mode = request
            .settings
            .as_ref()
            .and_then(|s| s.interaction_mode)
            .unwrap_or(self.deps.mode);
        let max_iterations = request
            .settings
            .as_ref()
            .and_then(|s| s.max_iterations)
            .unwrap_or(self.deps.max_iterations);

        if let Some(state) = &request.agent_state {
            tracing::info!(trace_id = %self.trace_id, "Continuing from agent state");
            self.processor = FsmToolProcessor::new(self.deps.env.clone(), mode);
            if let Some(checkpoint) = &state.fsm_state {
                let mut app = Application::load(&self.deps.env, checkpoint.clone());
                if matches!(app.state(), FsmState::Processing(_)) {
                    app.resume().await;
                }
                self.processor = FsmToolProcessor::new(self.deps.env.clone(), mode).with_app(app);
            }
        }

        if let Some(app) = self.processor.app() {
            self.deps
                .snapshots
                .save_or_warn(&self.trace_id, "fsm_enter", &app.checkpoint());
        }

        for iteration in 0..max_iterations {
            let (new_messages, status) = self
                .processor
                .step(self.deps.agent_llm.as_ref(), messages)
                .await?;
            tracing::debug!(iteration, ?status, "Agent step finished");
            messages.extend(new_messages.iter().cloned());

            let to_user: Vec<&Message> = new_messages
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .collect();
            let content = serde_json::to_string(&to_user)?;
            let fsm_state = self.processor.app().map(Application::checkpoint);

            let mut app_name = None;
            if !self.template_diff_sent && request.agent_state.is_none() {
                if let Some(app) = self.processor.app() {
                    let description = app.context().user_requests.join("\n");
                    let name = self.generate_app_name(&description).await;
                    let initial = diff::diff_file_maps(
                        &FileMap::new(),
                        &artifacts::overlay(&FileMap::new(), &self.deps.template, &app.artifacts()),
                    );
                    self.template_diff_sent = true;
                    self.send(
                        events,
                        AgentStatus::Running,
                        MessageKind::ReviewResult,
                        "Initializing...".to_string(),
                        EventExtras {
                            fsm_state: fsm_state.clone(),
                            diff: Some(initial),
                            app_name: Some(name.clone()),
                            commit_message: Some("Initial commit".to_string()),
                        },
                    )
                    .await;
                    app_name = Some(name);
                }
            }

            match status {
                FsmStatus::Wip => {
                    self.send(
                        events,
                        AgentStatus::Running,
                        MessageKind::StageResult,
                        content,
                        EventExtras {
                            fsm_state,
                            app_name,
                            ..Default::default()
                        },
                    )
                    .await;
                }
                FsmStatus::RefinementRequest => {
                    self.send(
                        events,
                        AgentStatus::Idle,
                        MessageKind::RefinementRequest,
                        content,
                        EventExtras {
                            fsm_state,
                            app_name,
                            ..Default::default()
                        },
                    )
                    .await;
                    return Ok(());
                }
                FsmStatus::Failed => {
                    self.send(
                        events,
                        AgentStatus::Idle,
                        MessageKind::RuntimeError,
                        content,
                        EventExtras::default(),
                    )
                    .await;
                    return Ok(());
                }
                FsmStatus::Completed => {
                    self.send_completion(request, events, content, fsm_state, app_name).await;
                    return Ok(());
                }
            }
        }

        tracing::warn!(trace_id = %self.trace_id, max_iterations, "Iteration budget exhausted");
        let fsm_state = self.processor.app().map(Application::checkpoint);
        self.send(
            events,
            AgentStatus::Idle,
            MessageKind::RefinementRequest,
            format!("Stopped after {max_iterations} iterations; send another message to continue."),
            EventExtras {
                fsm_state,
                ..Default::default()
            },
        )
        .await;
        Ok(())
    }

    async fn send_completion(
        &mut self,
        request: &AgentRequest,
        events: &mpsc::Sender<AgentSseEvent>,
        content: String,
        fsm_state: Option<MachineCheckpoint>,
        app_name: Option<String>,
    ) {
        let Some(app) = self.processor.app() else {
            return;
        };
        let snapshot = request.snapshot_files();
        let after = artifacts::overlay(&snapshot, &self.deps.template, &app.artifacts());
        let final_diff = diff::diff_file_maps(&snapshot, &after);
        tracing::info!(
            state = %app.state(),
            diff_len = final_diff.unified_diff.len(),
            files = final_diff.stats.len(),
            "Sending completion event"
        );

        let description = app.context().user_requests.join("\n");
        let commit_message = self.generate_commit_message(&description, &final_diff).await;
        self.send(
            events,
            AgentStatus::Idle,
            MessageKind::ReviewResult,
            content,
            EventExtras {
                fsm_state,
                diff: Some(final_diff),
                app_name,
                commit_message: Some(commit_message),
            },
        )
        .await;
    }

    async fn send(
        &mut self,
        events: &mpsc::Sender<AgentSseEvent>,
        status: AgentStatus,
        kind: MessageKind,
        content: String,
        extras: EventExtras,
    ) {
        self.last_kind = Some(kind);
        let mut message = AgentMessage::new(kind, content);
        message.agent_state = extras.fsm_state.map(|checkpoint| AgentState {
            fsm_state: Some(checkpoint),
        });
        if let Some(diff) = extras.diff {
            message.complete_diff_hash = Some(diff.hash());
            message.diff_stat = Some(diff.stats);
            message.unified_diff = Some(diff.unified_diff);
        }
        message.app_name = extras.app_name;
        message.commit_message = extras.commit_message;

        let event = AgentSseEvent {
            status,
            trace_id: self.trace_id.clone(),
            message,
        };
        self.deps.snapshots.save_or_warn(
            &self.trace_id,
            &format!("sse_events/{}", self.sse_counter),
            &event,
        );
        self.sse_counter += 1;
        if events.send(event).await.is_err() {
            tracing::debug!(trace_id = %self.trace_id, "Event receiver dropped");
        }
    }

    async fn generate_app_name(&self, description: &str) -> String {
        let prompt = prompts::render(prompts::APP_NAME, &[("description", description)]);
        match self.ask_naming_llm(prompt).await {
            Some(answer) => {
                let name = slugify(&answer);
                if name.is_empty() { fallback_app_name(description) } else { name }
            }
            None => fallback_app_name(description),
        }
    }

    async fn generate_commit_message(&self, description: &str, diff: &DiffSummary) -> String {
        let prompt = prompts::render(
            prompts::COMMIT_MESSAGE,
            &[("description", description), ("diff_stat", diff.shortstat().as_str())],
        );
        self.ask_naming_llm(prompt)
            .await
            .and_then(|answer| answer.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string))
            .unwrap_or_else(|| "Generate application".to_string())
    }

    async fn ask_naming_llm(&self, prompt: String) -> Option<String> {
        let llm = self.deps.naming_llm.as_ref()?;
        let request = CompletionRequest::new(vec![Message::user(prompt)], NAMING_MAX_TOKENS);
        match llm.complete(request).await {
            Ok(completion) => completion.first_text().map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "Naming request failed, using fallback");
                None
            }
        }
    }
}

fn convert_messages(history: &[ConversationMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|m| match m.role {
            MessageRole::User => Message::user(m.content.clone()),
            MessageRole::Assistant => Message::assistant(m.content.clone()),
        })
        .collect()
}

/// Lowercase words joined by dashes, at most 50 characters.
fn slugify(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    let mut slug = String::new();
    for word in words {
        if slug.len() + word.len() + 1 > 50 {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word);
    }
    slug
}

fn fallback_app_name(description: &str) -> String {
    let words: Vec<&str> = description.split_whitespace().take(4).collect();
    let slug = slugify(&words.join(" "));
    if slug.is_empty() { "generated-app".to_string() } else { slug }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, ContentBlock, ScriptedLlm};
    use crate::pipeline::actors::SearchSettings;
    use crate::pipeline::Stage;
    use crate::server::models::AgentSettings;
    use crate::validate::NoopCompiler;
    use serde_json::json;

    const TYPESPEC: &str = "<typespec>\ninterface Greeter {\n  @llm_func(\"Greet the user\")\n  greet(options: Greeting): string;\n}\n</typespec>";

    fn tool_call(id: &str, name: &str, input: serde_json::Value) -> Completion {
        Completion {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: Some("tool_use".into()),
        }
    }

    fn deps(stage_llm: ScriptedLlm, agent_llm: ScriptedLlm) -> SessionDeps {
        SessionDeps {
            env: ActorEnv::new(
                Arc::new(stage_llm),
                Arc::new(NoopCompiler),
                SearchSettings {
                    max_depth: 1,
                    max_width: 1,
                    ..SearchSettings::default()
                },
            ),
            agent_llm: Arc::new(agent_llm),
            naming_llm: None,
            template: Arc::new(FileMap::new()),
            snapshots: SnapshotSaver::disabled(),
            mode: InteractionMode::Interactive,
            max_iterations: 5,
        }
    }

    fn request(agent_state: Option<AgentState>) -> AgentRequest {
        AgentRequest {
            all_messages: vec![ConversationMessage {
                role: MessageRole::User,
                content: "Build a greeter".into(),
            }],
            application_id: "app".into(),
            trace_id: "trace".into(),
            agent_state,
            all_files: None,
            settings: None,
        }
    }

    async fn collect(session: &mut AgentSession, request: &AgentRequest) -> Vec<AgentSseEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        session.process(request, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn slugify_and_fallback_names() {
        assert_eq!(slugify("Greeter App!"), "greeter-app");
        assert_eq!(slugify("  \n"), "");
        assert_eq!(fallback_app_name("A bot that tracks my diet"), "a-bot-that-tracks");
        assert_eq!(fallback_app_name(""), "generated-app");
    }

    #[tokio::test]
    async fn plain_answer_is_refinement_request() {
        let mut session = AgentSession::new(
            "app",
            "trace",
            deps(ScriptedLlm::default(), ScriptedLlm::from_texts(["What should it greet?"])),
        );
        let events = collect(&mut session, &request(None)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AgentStatus::Idle);
        assert_eq!(events[0].message.kind, MessageKind::RefinementRequest);
        assert!(events[0].message.content.contains("What should it greet?"));
        assert!(events[0].message.agent_state.is_none());
        assert!(!session.is_finished());
    }

    #[tokio::test]
    async fn first_fsm_step_sends_initial_review_then_stage_result() {
        let agent = ScriptedLlm::new([
            tool_call("t1", "start_fsm", json!({"app_description": "a greeter"})),
            Completion::from_text("Does the TypeSpec look right?"),
        ]);
        let mut session = AgentSession::new("app", "trace", deps(ScriptedLlm::from_texts([TYPESPEC]), agent));
        let events = collect(&mut session, &request(None)).await;

        let kinds: Vec<MessageKind> = events.iter().map(|e| e.message.kind).collect();
        assert_eq!(
            kinds,
            [MessageKind::ReviewResult, MessageKind::StageResult, MessageKind::RefinementRequest]
        );
        let initial = &events[0].message;
        assert_eq!(initial.content, "Initializing...");
        assert_eq!(initial.commit_message.as_deref(), Some("Initial commit"));
        assert_eq!(initial.app_name.as_deref(), Some("a-greeter"));
        assert!(initial.unified_diff.as_deref().unwrap().contains("+++ b/spec/main.tsp"));
        assert_eq!(events[0].status, AgentStatus::Running);

        let checkpoint = events[1].message.agent_state.as_ref().unwrap().fsm_state.as_ref().unwrap();
        assert_eq!(checkpoint.state, FsmState::Review(Stage::Typespec));
    }

    #[tokio::test]
    async fn restored_state_completes_with_final_diff() {
        let mut first = AgentSession::new(
            "app",
            "trace",
            deps(
                ScriptedLlm::from_texts([TYPESPEC]),
                ScriptedLlm::new([tool_call("t1", "start_fsm", json!({"app_description": "greeter"}))]),
            ),
        );
        let mut req = request(None);
        req.settings = Some(AgentSettings {
            max_iterations: Some(1),
            interaction_mode: None,
        });
        let events = collect(&mut first, &req).await;
        let state = events
            .iter()
            .rev()
            .find_map(|e| e.message.agent_state.clone())
            .unwrap();

        let mut second = AgentSession::new(
            "app",
            "trace",
            deps(
                ScriptedLlm::default(),
                ScriptedLlm::new([tool_call("t2", "complete_fsm", json!({}))]),
            ),
        );
        let events = collect(&mut second, &request(Some(state))).await;
        assert_eq!(events.len(), 1);
        let done = &events[0];
        assert_eq!(done.status, AgentStatus::Idle);
        assert_eq!(done.message.kind, MessageKind::ReviewResult);
        assert_eq!(done.message.commit_message.as_deref(), Some("Generate application"));
        assert_eq!(done.message.complete_diff_hash.as_ref().unwrap().len(), 64);
        assert_eq!(done.message.diff_stat.as_ref().unwrap()[0].path, "spec/main.tsp");
        assert!(second.is_finished());
        assert!(!first.is_finished());
    }

    #[tokio::test]
    async fn iteration_budget_ends_idle_with_state() {
        let agent = ScriptedLlm::new([tool_call("t1", "start_fsm", json!({"app_description": "x"}))]);
        let mut session = AgentSession::new("app", "trace", deps(ScriptedLlm::from_texts([TYPESPEC]), agent));
        let mut req = request(None);
        req.settings = Some(AgentSettings {
            max_iterations: Some(1),
            interaction_mode: None,
        });
        let events = collect(&mut session, &req).await;
        let last = events.last().unwrap();
        assert_eq!(last.status, AgentStatus::Idle);
        assert!(last.message.content.contains("Stopped after 1 iterations"));
        assert!(last.message.agent_state.is_some());
    }

    #[tokio::test]
    async fn llm_errors_become_runtime_error_event() {
        let mut session = AgentSession::new("app", "trace", deps(ScriptedLlm::default(), ScriptedLlm::default()));
        let events = collect(&mut session, &request(None)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message.kind, MessageKind::RuntimeError);
        assert!(events[0].message.content.starts_with("Error processing request:"));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn snapshots_are_written_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut deps = deps(ScriptedLlm::default(), ScriptedLlm::from_texts(["hi"]));
        deps.snapshots = SnapshotSaver::new(Some(dir.path().to_path_buf()));
        let mut session = AgentSession::new("app", "trace", deps);
        collect(&mut session, &request(None)).await;

        assert!(dir.path().join("trace/sse_events/0.json").exists());
        assert!(dir.path().join("trace/fsmtools_messages.json").exists());
        assert!(!dir.path().join("trace/fsm_exit.json").exists());
    }
}
