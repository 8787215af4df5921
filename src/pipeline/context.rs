//! Mutable pipeline context: user requests, stage artifacts, and feedback.
//!
//! Everything here is plain serde data so a machine can be checkpointed
//! between agent requests and restored later.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::Stage;

/// Feedback key that applies to every component of a handler stage.
pub const GENERAL_FEEDBACK: &str = "general";

/// A function decorated with `@llm_func` in the TypeSpec interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmFunction {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypespecOutput {
    pub reasoning: String,
    pub typespec: String,
    pub llm_functions: Vec<LlmFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrizzleOutput {
    pub reasoning: String,
    pub drizzle_schema: String,
    pub tables: Vec<String>,
}

/// `export declare function name(options: Argument): ReturnType;`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub argument_type: String,
    pub return_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypescriptOutput {
    pub reasoning: String,
    pub typescript_schema: String,
    pub functions: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerTestOutput {
    pub name: String,
    pub imports: String,
    pub tests: Vec<String>,
    /// Complete test file as written to disk.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerStatus {
    Passed,
    /// Compiles, but its tests still fail after the search budget.
    TestsFailed { output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub name: String,
    pub source: String,
    #[serde(flatten)]
    pub status: HandlerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub user_requests: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typespec: Option<TypespecOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drizzle: Option<DrizzleOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typescript: Option<TypescriptOutput>,
    #[serde(default)]
    pub handler_tests: BTreeMap<String, HandlerTestOutput>,
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typespec_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drizzle_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typescript_feedback: Option<String>,
    #[serde(default)]
    pub handler_tests_feedback: BTreeMap<String, String>,
    #[serde(default)]
    pub handlers_feedback: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineContext {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            user_requests: vec![description.into()],
            ..Default::default()
        }
    }

    /// Store feedback for a stage. Handler stages key it by component,
    /// falling back to [`GENERAL_FEEDBACK`] when no component is given.
    pub fn record_feedback(&mut self, stage: Stage, feedback: String, component: Option<String>) {
        match stage {
            Stage::Typespec => self.typespec_feedback = Some(feedback),
            Stage::Drizzle => self.drizzle_feedback = Some(feedback),
            Stage::Typescript => self.typescript_feedback = Some(feedback),
            Stage::HandlerTests | Stage::Handlers => {
                let key = component
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| GENERAL_FEEDBACK.to_string());
                self.component_feedback_mut(stage).insert(key, feedback);
            }
        }
    }

    fn component_feedback_mut(&mut self, stage: Stage) -> &mut BTreeMap<String, String> {
        match stage {
            Stage::HandlerTests => &mut self.handler_tests_feedback,
            _ => &mut self.handlers_feedback,
        }
    }

    pub fn stage_feedback(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Typespec => self.typespec_feedback.as_deref(),
            Stage::Drizzle => self.drizzle_feedback.as_deref(),
            Stage::Typescript => self.typescript_feedback.as_deref(),
            Stage::HandlerTests | Stage::Handlers => None,
        }
    }

    pub fn component_feedback(&self, stage: Stage) -> &BTreeMap<String, String> {
        match stage {
            Stage::HandlerTests => &self.handler_tests_feedback,
            _ => &self.handlers_feedback,
        }
    }

    /// Feedback for one component: the general note followed by the
    /// component-specific one, when either exists.
    pub fn feedback_for_component(&self, stage: Stage, component: &str) -> Option<String> {
        let map = self.component_feedback(stage);
        let parts: Vec<&str> = [map.get(GENERAL_FEEDBACK), map.get(component)]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Drop feedback that has been applied by a successful stage run.
    pub fn clear_feedback(&mut self, stage: Stage) {
        match stage {
            Stage::Typespec => self.typespec_feedback = None,
            Stage::Drizzle => self.drizzle_feedback = None,
            Stage::Typescript => self.typescript_feedback = None,
            Stage::HandlerTests | Stage::Handlers => self.component_feedback_mut(stage).clear(),
        }
    }

    /// JSON view of the artifact a stage produced, or `null` if none yet.
    pub fn stage_artifact(&self, stage: Stage) -> serde_json::Value {
        let value = match stage {
            Stage::Typespec => serde_json::to_value(&self.typespec),
            Stage::Drizzle => serde_json::to_value(&self.drizzle),
            Stage::Typescript => serde_json::to_value(&self.typescript),
            Stage::HandlerTests => serde_json::to_value(&self.handler_tests),
            Stage::Handlers => serde_json::to_value(&self.handlers),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
