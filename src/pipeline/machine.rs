//! The stage pipeline: an FSM that runs stage actors and stops for review.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::actors::{default_actors, ActorEnv, StageActor};
use super::context::PipelineContext;
use super::parse;
use super::state::{target_after, transition, FsmEvent, FsmState, InteractionMode, Stage};
use crate::artifacts;
use crate::errors::PipelineError;
use crate::validate::FileMap;

/// Everything needed to restore an [`Application`] later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineCheckpoint {
    pub state: FsmState,
    #[serde(default)]
    pub mode: InteractionMode,
    pub context: PipelineContext,
}

/// One application being generated.
///
/// Events move the machine between states; whenever it lands in a
/// processing state the matching actor runs, and the machine keeps going
/// until it reaches a review state or a terminal state.
pub struct Application {
    state: FsmState,
    mode: InteractionMode,
    context: PipelineContext,
    actors: BTreeMap<Stage, Arc<dyn StageActor>>,
}

impl Application {
    pub fn new(env: &ActorEnv, mode: InteractionMode) -> Self {
        Self::with_actors(default_actors(env), mode)
    }

    pub fn with_actors(actors: BTreeMap<Stage, Arc<dyn StageActor>>, mode: InteractionMode) -> Self {
        Self {
            state: FsmState::Idle,
            mode,
            context: PipelineContext::default(),
            actors,
        }
    }

    /// Seed the context with a user-supplied TypeSpec document. A following
    /// [`confirm`](Self::confirm) continues from the schema stage.
    pub fn with_typespec(mut self, source: &str) -> Result<Self, PipelineError> {
        let typespec = parse::parse_typespec(&parse::wrap_typespec(source))?;
        tracing::info!(functions = typespec.llm_functions.len(), "Loaded TypeSpec");
        self.context.typespec = Some(typespec);
        Ok(self)
    }

    /// Restore a checkpoint with the default actors.
    pub fn load(env: &ActorEnv, checkpoint: MachineCheckpoint) -> Self {
        Self::from_checkpoint(checkpoint, default_actors(env))
    }

    pub fn from_checkpoint(
        checkpoint: MachineCheckpoint,
        actors: BTreeMap<Stage, Arc<dyn StageActor>>,
    ) -> Self {
        Self {
            state: checkpoint.state,
            mode: checkpoint.mode,
            context: checkpoint.context,
            actors,
        }
    }

    /// Stage list shown to a controlling agent.
    pub fn base_execution_plan() -> String {
        let mut plan: Vec<String> = Stage::ALL
            .iter()
            .enumerate()
            .map(|(i, stage)| format!("{}. {} - {}", i + 1, stage, stage.description()))
            .collect();
        plan.push(
            "Each stage stops in a review state; handler stages accept feedback per function."
                .to_string(),
        );
        plan.join("\n")
    }

    pub fn checkpoint(&self) -> MachineCheckpoint {
        MachineCheckpoint {
            state: self.state,
            mode: self.mode,
            context: self.context.clone(),
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn maybe_error(&self) -> Option<&str> {
        self.context.error.as_deref()
    }

    pub fn available_actions(&self) -> BTreeMap<String, String> {
        self.state.available_actions()
    }

    /// Store the request and generate until the first stop.
    pub async fn start(&mut self, description: &str) -> Result<FsmState, PipelineError> {
        if self.state != FsmState::Idle {
            return Err(self.invalid(&FsmEvent::Prompt));
        }
        self.context.user_requests.push(description.to_string());
        self.send(FsmEvent::Prompt).await
    }

    pub async fn confirm(&mut self) -> Result<FsmState, PipelineError> {
        if self.state == FsmState::Idle && self.context.typespec.is_none() {
            return Err(PipelineError::MissingInput {
                stage: Stage::Drizzle,
                missing: "a TypeSpec definition",
            });
        }
        self.send(FsmEvent::Confirm).await
    }

    /// Rerun the stage under review with `feedback` added to its context.
    pub async fn provide_feedback(
        &mut self,
        feedback: &str,
        component: Option<String>,
    ) -> Result<FsmState, PipelineError> {
        let Some(stage) = self.state.stage().filter(|_| self.state.is_review()) else {
            return Err(PipelineError::InvalidEvent {
                state: self.state,
                event: "revise".to_string(),
            });
        };
        let component = component
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if let Some(name) = component.as_ref().filter(|_| stage.is_per_component()) {
            let known = self.function_names();
            if !known.contains(name) {
                return Err(PipelineError::UnknownComponent {
                    stage,
                    component: name.clone(),
                    known: known.join(", "),
                });
            }
        }
        self.send(FsmEvent::Revise {
            stage,
            feedback: feedback.to_string(),
            component,
        })
        .await
    }

    fn function_names(&self) -> Vec<String> {
        self.context
            .typescript
            .iter()
            .flat_map(|ts| ts.functions.iter().map(|f| f.name.clone()))
            .collect()
    }

    /// Apply an event, then run stages until the machine is stable.
    ///
    /// A rejected event leaves the machine untouched.
    pub async fn send(&mut self, event: FsmEvent) -> Result<FsmState, PipelineError> {
        let next = transition(self.state, &event).ok_or_else(|| self.invalid(&event))?;
        tracing::debug!(from = %self.state, to = %next, event = %event, "Transition");

        if let FsmEvent::Revise {
            stage,
            feedback,
            component,
        } = event
        {
            self.context.record_feedback(stage, feedback, component);
        }
        self.state = next;
        self.run_until_stable().await;
        Ok(self.state)
    }

    /// Continue a machine restored in a processing state.
    pub async fn resume(&mut self) -> FsmState {
        self.run_until_stable().await;
        self.state
    }

    async fn run_until_stable(&mut self) {
        while let FsmState::Processing(stage) = self.state {
            let Some(actor) = self.actors.get(&stage).cloned() else {
                self.fail(stage, format!("No actor registered for stage {stage}"));
                return;
            };

            tracing::info!(stage = %stage, "Running stage");
            match actor.run(&self.context).await {
                Ok(output) => {
                    output.apply(&mut self.context);
                    self.context.clear_feedback(stage);
                    self.state = target_after(stage, self.mode);
                    tracing::info!(stage = %stage, next = %self.state, "Stage complete");
                }
                Err(e) => {
                    self.fail(stage, e.to_string());
                    return;
                }
            }
        }
    }

    fn fail(&mut self, stage: Stage, message: String) {
        tracing::error!(stage = %stage, error = %message, "Stage failed");
        self.context.error = Some(message);
        self.state = FsmState::Failure;
    }

    fn invalid(&self, event: &FsmEvent) -> PipelineError {
        PipelineError::InvalidEvent {
            state: self.state,
            event: event.to_string(),
        }
    }

    /// JSON view of what the current state produced.
    pub fn state_output(&self) -> serde_json::Value {
        match self.state {
            FsmState::Idle => json!({}),
            FsmState::Processing(_) => json!({ "status": "processing" }),
            FsmState::Review(stage) => self.artifacts_of(&[stage]),
            FsmState::Complete => self.artifacts_of(&Stage::ALL),
            FsmState::Failure => json!({ "error": self.maybe_error().unwrap_or("unknown error") }),
        }
    }

    fn artifacts_of(&self, stages: &[Stage]) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = stages
            .iter()
            .map(|stage| (stage.as_str().to_string(), self.context.stage_artifact(*stage)))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Finalized file map of everything generated so far.
    pub fn artifacts(&self) -> FileMap {
        artifacts::collect(&self.context)
    }
}
