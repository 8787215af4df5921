//! FSM tools: the pipeline exposed to a controlling LLM agent.
//!
//! The agent sees four tools (`start_fsm`, `confirm_state`,
//! `provide_feedback`, `complete_fsm`). [`FsmToolProcessor::step`] runs one
//! model turn, dispatches every tool call against the wrapped
//! [`Application`], and reports where the conversation stands.

use serde::Deserialize;
use serde_json::json;

use crate::errors::ToolError;
use crate::llm::{CompletionRequest, ContentBlock, LlmClient, Message, Role, ToolDefinition};
use crate::pipeline::actors::ActorEnv;
use crate::pipeline::{Application, FsmState, InteractionMode};

/// Appended to every tool-result turn.
pub const CONTINUE_PROMPT: &str =
    "Please continue based on these results, addressing any failures or errors if they exist.";

const STEP_MAX_TOKENS: u32 = 16 * 1024;

/// Where the agent conversation stands after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmStatus {
    /// Tools were called; keep stepping.
    Wip,
    /// The model answered without tools, usually a question for the user.
    RefinementRequest,
    Completed,
    Failed,
}

/// Result of one tool call as fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Deserialize)]
struct StartArgs {
    app_description: String,
}

#[derive(Deserialize)]
struct FeedbackArgs {
    feedback: String,
    #[serde(default)]
    component_name: Option<String>,
}

pub struct FsmToolProcessor {
    env: ActorEnv,
    mode: InteractionMode,
    app: Option<Application>,
    max_tokens: u32,
}

impl FsmToolProcessor {
    pub fn new(env: ActorEnv, mode: InteractionMode) -> Self {
        Self {
            env,
            mode,
            app: None,
            max_tokens: STEP_MAX_TOKENS,
        }
    }

    /// Wrap an existing (restored) application.
    pub fn with_app(mut self, app: Application) -> Self {
        self.app = Some(app);
        self
    }

    pub fn app(&self) -> Option<&Application> {
        self.app.as_ref()
    }

    pub fn tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "start_fsm".to_string(),
                description: "Start a new interactive FSM session for application generation".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "app_description": {
                            "type": "string",
                            "description": "Description for the application to generate"
                        }
                    },
                    "required": ["app_description"]
                }),
            },
            ToolDefinition {
                name: "confirm_state".to_string(),
                description: "Accept the current FSM state output and advance to the next state".to_string(),
                input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
            },
            ToolDefinition {
                name: "provide_feedback".to_string(),
                description: "Submit feedback for the current FSM state and trigger revision".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "feedback": {
                            "type": "string",
                            "description": "Feedback to provide for the current output"
                        },
                        "component_name": {
                            "type": "string",
                            "description": "Optional component name for handler-specific feedback"
                        }
                    },
                    "required": ["feedback"]
                }),
            },
            ToolDefinition {
                name: "complete_fsm".to_string(),
                description: "Finalize and return all generated artifacts from the FSM".to_string(),
                input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
            },
        ]
    }

    pub fn system_prompt() -> String {
        format!(
            r#"You are a software engineering expert who can generate application code using a code generation framework. This framework uses a Finite State Machine (FSM) to guide the generation process.

Your task is to control the FSM through the following stages of code generation:
{plan}

To successfully complete this task, follow these steps:

1. Start a new FSM session using the start_fsm tool.
2. For each component generated by the FSM:
a. Carefully review the output.
b. Decide whether to confirm the output or provide feedback for improvement.
c. Use the appropriate tool (confirm_state or provide_feedback) based on your decision.
3. Repeat step 2 until all components have been generated and confirmed.
4. Use the complete_fsm tool to finalize the process and retrieve all artifacts.

During your review process, consider the following questions:
- Does the code correctly implement the application requirements?
- Are there any errors or inconsistencies?
- Could anything be improved or clarified?
- Does it match other requirements mentioned in the dialogue?

When providing feedback, be specific and actionable. If you're unsure about any aspect, ask for clarification before proceeding.

Do not consider the work complete until all components have been generated and the complete_fsm tool has been called."#,
            plan = Application::base_execution_plan()
        )
    }

    /// `{current_state, output, available_actions}` for the wrapped machine.
    pub fn fsm_as_result(&self) -> Option<serde_json::Value> {
        self.app.as_ref().map(|app| {
            json!({
                "current_state": app.state(),
                "output": app.state_output(),
                "available_actions": app.available_actions(),
            })
        })
    }

    fn result_outcome(&self) -> ToolOutcome {
        match self.fsm_as_result() {
            Some(result) => ToolOutcome::ok(
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string()),
            ),
            None => ToolOutcome::error("No active FSM session"),
        }
    }

    /// Route a tool call by name.
    pub async fn dispatch(&mut self, name: &str, input: &serde_json::Value) -> Result<ToolOutcome, ToolError> {
        match name {
            "start_fsm" => {
                let args: StartArgs = parse_args(name, input)?;
                Ok(self.start_fsm(&args.app_description).await)
            }
            "confirm_state" => Ok(self.confirm_state().await),
            "provide_feedback" => {
                let args: FeedbackArgs = parse_args(name, input)?;
                Ok(self.provide_feedback(&args.feedback, args.component_name).await)
            }
            "complete_fsm" => Ok(self.complete_fsm()),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub async fn start_fsm(&mut self, app_description: &str) -> ToolOutcome {
        if self.app.is_some() {
            tracing::warn!("Refusing to start a second FSM session");
            return ToolOutcome::error(
                "An active FSM session already exists. Please explain why do you even need to create a new one instead of using existing one",
            );
        }
        tracing::info!(description = app_description, "Starting FSM session");

        let mut app = Application::new(&self.env, self.mode);
        let started = app.start(app_description).await;
        self.app = Some(app);
        if let Err(e) = started {
            return ToolOutcome::error(format!("Failed to start FSM: {e}"));
        }
        if let Some(error) = self.maybe_error() {
            return ToolOutcome::error(format!("FSM initialization failed: {error}"));
        }
        self.result_outcome()
    }

    pub async fn confirm_state(&mut self) -> ToolOutcome {
        let Some(app) = self.app.as_mut() else {
            return ToolOutcome::error("No active FSM session");
        };
        let previous = app.state();
        if let Err(e) = app.confirm().await {
            return ToolOutcome::error(format!("Failed to confirm state: {e}"));
        }
        tracing::info!(from = %previous, to = %app.state(), "Confirmed state");
        if let Some(error) = self.maybe_error() {
            return ToolOutcome::error(format!("FSM confirmation failed: {error}"));
        }
        self.result_outcome()
    }

    pub async fn provide_feedback(&mut self, feedback: &str, component_name: Option<String>) -> ToolOutcome {
        let Some(app) = self.app.as_mut() else {
            return ToolOutcome::error("No active FSM session");
        };
        tracing::info!(state = %app.state(), component = ?component_name, "Providing feedback");
        if let Err(e) = app.provide_feedback(feedback, component_name).await {
            return ToolOutcome::error(format!("Failed to provide feedback: {e}"));
        }
        if let Some(error) = self.maybe_error() {
            return ToolOutcome::error(format!("FSM while processing feedback: {error}"));
        }
        self.result_outcome()
    }

    /// Report the current result. Only a missing session or a failed
    /// machine is an error; calling this before `complete` returns the
    /// current state so the agent can see what remains.
    pub fn complete_fsm(&self) -> ToolOutcome {
        let Some(app) = self.app.as_ref() else {
            return ToolOutcome::error("No active FSM session");
        };
        if let Some(error) = app.maybe_error() {
            return ToolOutcome::error(format!("FSM failed with error: {error}"));
        }
        tracing::info!(state = %app.state(), "Completing FSM session");
        self.result_outcome()
    }

    fn maybe_error(&self) -> Option<String> {
        self.app
            .as_ref()
            .and_then(|app| app.maybe_error().map(str::to_string))
    }

    /// Run one model turn with the FSM tools.
    ///
    /// Returns the messages to append to the conversation and the resulting
    /// status.
    pub async fn step(
        &mut self,
        llm: &dyn LlmClient,
        messages: &[Message],
    ) -> Result<(Vec<Message>, FsmStatus), ToolError> {
        let request = CompletionRequest::new(messages.to_vec(), self.max_tokens)
            .with_system(Self::system_prompt())
            .with_tools(Self::tool_definitions());
        let completion = llm.complete(request).await?;

        let mut results = Vec::new();
        let mut completed = false;
        for block in &completion.content {
            match block {
                ContentBlock::Text { text } => tracing::info!(text = %text, "Agent message"),
                ContentBlock::ToolUse { id, name, input } => {
                    tracing::info!(tool = %name, input = %input, "Agent tool call");
                    let outcome = match self.dispatch(name, input).await {
                        Ok(outcome) => outcome,
                        Err(e) => ToolOutcome::error(e.to_string()),
                    };
                    tracing::debug!(tool = %name, is_error = outcome.is_error, "Tool result");
                    if name == "complete_fsm" && !outcome.is_error {
                        completed = true;
                    }
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: outcome.content,
                        is_error: outcome.is_error,
                    });
                }
                _ => {}
            }
        }

        if results.is_empty() {
            let text: Vec<ContentBlock> = completion
                .content
                .into_iter()
                .filter(|b| matches!(b, ContentBlock::Text { .. }))
                .collect();
            let new_messages = if text.is_empty() {
                Vec::new()
            } else {
                vec![Message {
                    role: Role::Assistant,
                    content: text,
                }]
            };
            return Ok((new_messages, FsmStatus::RefinementRequest));
        }

        results.push(ContentBlock::text(CONTINUE_PROMPT));
        let new_messages = vec![
            completion.into_message(),
            Message {
                role: Role::User,
                content: results,
            },
        ];

        let status = if self.app.as_ref().is_some_and(|app| app.state() == FsmState::Failure) {
            FsmStatus::Failed
        } else if completed {
            FsmStatus::Completed
        } else {
            FsmStatus::Wip
        };
        Ok((new_messages, status))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, input: &serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(input.clone()).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}
