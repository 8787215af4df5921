//! States, events, and interaction modes of the generation pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A generation stage, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Typespec,
    Drizzle,
    Typescript,
    HandlerTests,
    Handlers,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Typespec,
        Stage::Drizzle,
        Stage::Typescript,
        Stage::HandlerTests,
        Stage::Handlers,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Typespec => Some(Stage::Drizzle),
            Stage::Drizzle => Some(Stage::Typescript),
            Stage::Typescript => Some(Stage::HandlerTests),
            Stage::HandlerTests => Some(Stage::Handlers),
            Stage::Handlers => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Typespec => "typespec",
            Stage::Drizzle => "drizzle",
            Stage::Typescript => "typescript",
            Stage::HandlerTests => "handler_tests",
            Stage::Handlers => "handlers",
        }
    }

    /// Handler stages take feedback per component (function name).
    pub fn is_per_component(self) -> bool {
        matches!(self, Stage::HandlerTests | Stage::Handlers)
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::Typespec => "TypeSpec models and the @llm_func interface",
            Stage::Drizzle => "Drizzle (PostgreSQL) database schema",
            Stage::Typescript => "TypeScript types and function declarations",
            Stage::HandlerTests => "unit tests for every handler",
            Stage::Handlers => "handler implementations",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

/// Where the machine is.
///
/// `Processing(stage)` means the stage actor is (or is about to be) running;
/// `Review(stage)` means it finished and waits for confirm or feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmState {
    Idle,
    Processing(Stage),
    Review(Stage),
    Complete,
    Failure,
}

impl FsmState {
    pub fn stage(self) -> Option<Stage> {
        match self {
            FsmState::Processing(stage) | FsmState::Review(stage) => Some(stage),
            _ => None,
        }
    }

    pub fn is_review(self) -> bool {
        matches!(self, FsmState::Review(_))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FsmState::Complete | FsmState::Failure)
    }

    /// Actions a controller may take in this state, name → description.
    /// Terminal states offer only inspection.
    pub fn available_actions(self) -> BTreeMap<String, String> {
        let mut actions = BTreeMap::new();
        match self {
            FsmState::Idle => {
                actions.insert(
                    "start".to_string(),
                    "Start generation from an application description".to_string(),
                );
            }
            FsmState::Review(stage) => {
                actions.insert(
                    "confirm".to_string(),
                    format!("Accept the {} and continue", stage.description()),
                );
                let revise = if stage.is_per_component() {
                    format!(
                        "Provide feedback on the {}; pass component_name to target one function",
                        stage.description()
                    )
                } else {
                    format!("Provide feedback on the {}", stage.description())
                };
                actions.insert("revise".to_string(), revise);
            }
            FsmState::Complete => {
                actions.insert(
                    "complete".to_string(),
                    "Finalize and collect all generated artifacts".to_string(),
                );
            }
            FsmState::Processing(_) => {
                actions.insert("wait".to_string(), "Wait for processing to complete".to_string());
            }
            FsmState::Failure => {
                actions.insert("get_error".to_string(), "Get error details".to_string());
            }
        }
        actions
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmState::Idle => f.write_str("idle"),
            FsmState::Processing(stage) => write!(f, "{stage}"),
            FsmState::Review(stage) => write!(f, "{stage}_review"),
            FsmState::Complete => f.write_str("complete"),
            FsmState::Failure => f.write_str("failure"),
        }
    }
}

impl FromStr for FsmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => return Ok(FsmState::Idle),
            "complete" => return Ok(FsmState::Complete),
            "failure" => return Ok(FsmState::Failure),
            _ => {}
        }
        if let Some(stage) = s.strip_suffix("_review") {
            return stage.parse().map(FsmState::Review);
        }
        s.parse()
            .map(FsmState::Processing)
            .map_err(|_| format!("unknown state `{s}`"))
    }
}

impl Serialize for FsmState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FsmState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Events accepted by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    Prompt,
    Confirm,
    Revise {
        stage: Stage,
        feedback: String,
        component: Option<String>,
    },
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmEvent::Prompt => f.write_str("prompt"),
            FsmEvent::Confirm => f.write_str("confirm"),
            FsmEvent::Revise { stage, .. } => write!(f, "revise_{stage}"),
        }
    }
}

/// Which stages stop for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// Every stage is reviewed.
    #[default]
    Interactive,
    /// No stage is reviewed.
    NonInteractive,
    /// Only the TypeSpec stage is reviewed.
    TypespecOnly,
}

impl InteractionMode {
    pub fn reviews(self, stage: Stage) -> bool {
        match self {
            InteractionMode::Interactive => true,
            InteractionMode::NonInteractive => false,
            InteractionMode::TypespecOnly => stage == Stage::Typespec,
        }
    }
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InteractionMode::Interactive => "interactive",
            InteractionMode::NonInteractive => "non_interactive",
            InteractionMode::TypespecOnly => "typespec_only",
        })
    }
}

impl FromStr for InteractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "interactive" => Ok(InteractionMode::Interactive),
            "non_interactive" => Ok(InteractionMode::NonInteractive),
            "typespec_only" => Ok(InteractionMode::TypespecOnly),
            other => Err(format!(
                "unknown interaction mode `{other}` (expected interactive, non_interactive, typespec_only)"
            )),
        }
    }
}

/// Where the machine goes once `stage` finishes successfully.
pub fn target_after(stage: Stage, mode: InteractionMode) -> FsmState {
    if mode.reviews(stage) {
        return FsmState::Review(stage);
    }
    match stage.next() {
        Some(next) => FsmState::Processing(next),
        None => FsmState::Complete,
    }
}

/// Transition table for events sent outside a running stage.
///
/// Returns the next state, or `None` when the event is not accepted.
pub fn transition(state: FsmState, event: &FsmEvent) -> Option<FsmState> {
    match (state, event) {
        (FsmState::Idle, FsmEvent::Prompt) => Some(FsmState::Processing(Stage::Typespec)),
        (FsmState::Idle, FsmEvent::Confirm) => Some(FsmState::Processing(Stage::Drizzle)),
        (FsmState::Review(stage), FsmEvent::Confirm) => Some(match stage.next() {
            Some(next) => FsmState::Processing(next),
            None => FsmState::Complete,
        }),
        (FsmState::Review(current), FsmEvent::Revise { stage, .. }) if current == *stage => {
            Some(FsmState::Processing(current))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_round_trip_through_strings() {
        for stage in Stage::ALL {
            for state in [FsmState::Processing(stage), FsmState::Review(stage)] {
                let s = state.to_string();
                assert_eq!(s.parse::<FsmState>().unwrap(), state);
            }
        }
        assert_eq!("handler_tests_review".parse::<FsmState>().unwrap(), FsmState::Review(Stage::HandlerTests));
        assert_eq!(FsmState::Complete.to_string(), "complete");
        assert!("wat".parse::<FsmState>().is_err());
    }

    #[test]
    fn fsm_state_serializes_as_snake_case_string() {
        let json = serde_json::to_string(&FsmState::Review(Stage::Drizzle)).unwrap();
        assert_eq!(json, "\"drizzle_review\"");
        let back: FsmState = serde_json::from_str("\"handlers\"").unwrap();
        assert_eq!(back, FsmState::Processing(Stage::Handlers));
    }

    #[test]
    fn target_after_respects_mode() {
        use InteractionMode::*;
        assert_eq!(target_after(Stage::Typespec, Interactive), FsmState::Review(Stage::Typespec));
        assert_eq!(target_after(Stage::Typespec, NonInteractive), FsmState::Processing(Stage::Drizzle));
        assert_eq!(target_after(Stage::Typespec, TypespecOnly), FsmState::Review(Stage::Typespec));
        assert_eq!(target_after(Stage::Drizzle, TypespecOnly), FsmState::Processing(Stage::Typescript));
        assert_eq!(target_after(Stage::Handlers, NonInteractive), FsmState::Complete);
        assert_eq!(target_after(Stage::Handlers, Interactive), FsmState::Review(Stage::Handlers));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [FsmState::Complete, FsmState::Failure] {
            assert!(transition(state, &FsmEvent::Prompt).is_none());
            assert!(transition(state, &FsmEvent::Confirm).is_none());
        }
    }

    #[test]
    fn review_accepts_only_its_own_revision() {
        let state = FsmState::Review(Stage::Drizzle);
        let own = FsmEvent::Revise {
            stage: Stage::Drizzle,
            feedback: "add index".into(),
            component: None,
        };
        let other = FsmEvent::Revise {
            stage: Stage::Typespec,
            feedback: "x".into(),
            component: None,
        };
        assert_eq!(transition(state, &own), Some(FsmState::Processing(Stage::Drizzle)));
        assert_eq!(transition(state, &other), None);
        assert_eq!(transition(state, &FsmEvent::Prompt), None);
        assert_eq!(
            transition(FsmState::Review(Stage::Handlers), &FsmEvent::Confirm),
            Some(FsmState::Complete)
        );
    }

    #[test]
    fn idle_confirm_jumps_to_schema_stage() {
        assert_eq!(
            transition(FsmState::Idle, &FsmEvent::Confirm),
            Some(FsmState::Processing(Stage::Drizzle))
        );
    }

    #[test]
    fn available_actions_by_state() {
        let review = FsmState::Review(Stage::Handlers).available_actions();
        assert!(review.contains_key("confirm"));
        assert!(review["revise"].contains("component_name"));
        assert_eq!(
            FsmState::Failure.available_actions().keys().collect::<Vec<_>>(),
            vec!["get_error"]
        );
        assert!(FsmState::Processing(Stage::Typespec).available_actions().contains_key("wait"));
    }

    #[test]
    fn interaction_mode_parses_dashes_and_underscores() {
        assert_eq!("non-interactive".parse::<InteractionMode>().unwrap(), InteractionMode::NonInteractive);
        assert_eq!("typespec_only".parse::<InteractionMode>().unwrap(), InteractionMode::TypespecOnly);
        assert!("sometimes".parse::<InteractionMode>().is_err());
    }
}
