//! Stage actors.
//!
//! Each actor turns the pipeline context into one stage artifact: it renders
//! a prompt, asks the LLM, parses the tagged response, validates the result,
//! and feeds validation errors back to the LLM until a candidate passes or
//! the search budget runs out (see [`solve`]).

mod drizzle;
mod handler_tests;
mod handlers;
mod typescript;
mod typespec;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use super::context::{
    DrizzleOutput, HandlerOutput, HandlerTestOutput, PipelineContext, TypescriptOutput,
    TypespecOutput,
};
use super::prompts;
use super::state::Stage;
use crate::errors::PipelineError;
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::validate::Compiler;

pub use drizzle::DrizzleActor;
pub use handler_tests::HandlerTestsActor;
pub use handlers::HandlersActor;
pub use typescript::TypescriptActor;
pub use typespec::TypespecActor;

/// Budget for the refinement search.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Rounds of generate → validate → fix.
    pub max_depth: usize,
    /// Candidates generated concurrently per round.
    pub max_width: usize,
    /// Concurrent per-function jobs in handler stages.
    pub max_concurrency: usize,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_width: 2,
            max_concurrency: 5,
            max_tokens: 8192,
            model: None,
        }
    }
}

/// What every actor needs: an LLM, a validator, and a budget.
#[derive(Clone)]
pub struct ActorEnv {
    pub llm: Arc<dyn LlmClient>,
    pub compiler: Arc<dyn Compiler>,
    pub search: SearchSettings,
}

impl ActorEnv {
    pub fn new(llm: Arc<dyn LlmClient>, compiler: Arc<dyn Compiler>, search: SearchSettings) -> Self {
        Self {
            llm,
            compiler,
            search,
        }
    }
}

/// Artifact produced by one stage run.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Typespec(TypespecOutput),
    Drizzle(DrizzleOutput),
    Typescript(TypescriptOutput),
    HandlerTests(BTreeMap<String, HandlerTestOutput>),
    Handlers(BTreeMap<String, HandlerOutput>),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Typespec(_) => Stage::Typespec,
            StageOutput::Drizzle(_) => Stage::Drizzle,
            StageOutput::Typescript(_) => Stage::Typescript,
            StageOutput::HandlerTests(_) => Stage::HandlerTests,
            StageOutput::Handlers(_) => Stage::Handlers,
        }
    }

    /// Store the artifact. Handler maps are merged so a component-scoped
    /// rerun keeps the components it did not touch.
    pub fn apply(self, ctx: &mut PipelineContext) {
        match self {
            StageOutput::Typespec(out) => ctx.typespec = Some(out),
            StageOutput::Drizzle(out) => ctx.drizzle = Some(out),
            StageOutput::Typescript(out) => ctx.typescript = Some(out),
            StageOutput::HandlerTests(out) => ctx.handler_tests.extend(out),
            StageOutput::Handlers(out) => ctx.handlers.extend(out),
        }
    }
}

#[async_trait]
pub trait StageActor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError>;
}

/// The five actors, keyed by stage.
pub fn default_actors(env: &ActorEnv) -> BTreeMap<Stage, Arc<dyn StageActor>> {
    let actors: [Arc<dyn StageActor>; 5] = [
        Arc::new(TypespecActor::new(env.clone())),
        Arc::new(DrizzleActor::new(env.clone())),
        Arc::new(TypescriptActor::new(env.clone())),
        Arc::new(HandlerTestsActor::new(env.clone())),
        Arc::new(HandlersActor::new(env.clone())),
    ];
    actors.into_iter().map(|a| (a.stage(), a)).collect()
}

/// Outcome of validating one candidate response.
pub(crate) enum Verdict<T> {
    Accept(T),
    /// Rejected; `feedback` is the next user turn. `fallback` is kept as the
    /// answer if the search runs out without an accepted candidate.
    Retry { feedback: String, fallback: Option<T> },
}

impl<T> Verdict<T> {
    pub(crate) fn retry(feedback: impl Into<String>) -> Self {
        Verdict::Retry {
            feedback: feedback.into(),
            fallback: None,
        }
    }
}

#[async_trait]
pub(crate) trait Evaluator: Send + Sync {
    type Output: Send;

    async fn evaluate(&self, response: &str) -> Result<Verdict<Self::Output>, PipelineError>;
}

/// Refinement search shared by all actors.
///
/// Each round asks for `max_width` candidates from the same conversation.
/// The first accepted candidate wins. Otherwise the conversation continues
/// from the first rejected candidate with its feedback appended, for at most
/// `max_depth` rounds.
pub(crate) async fn solve<E: Evaluator>(
    env: &ActorEnv,
    stage: Stage,
    label: &str,
    initial: Vec<Message>,
    evaluator: &E,
) -> Result<E::Output, PipelineError> {
    let width = env.search.max_width.max(1);
    let mut conversation = initial;
    let mut last_error = String::from("no candidates generated");
    let mut fallback: Option<E::Output> = None;

    for round in 0..env.search.max_depth {
        tracing::debug!(stage = %stage, label, round, width, "Generating candidates");

        let request = CompletionRequest::new(conversation.clone(), env.search.max_tokens)
            .with_model(env.search.model.clone());
        let candidates = join_all((0..width).map(|_| {
            let request = request.clone();
            async move {
                let completion = env.llm.complete(request).await?;
                let text = completion.first_text().unwrap_or_default().to_string();
                let verdict = evaluator.evaluate(&text).await?;
                Ok::<_, PipelineError>((text, verdict))
            }
        }))
        .await;

        let mut next_turn: Option<(String, String)> = None;
        let mut first_error: Option<PipelineError> = None;
        for candidate in candidates {
            let (text, verdict) = match candidate {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(stage = %stage, label, round, error = %e, "Candidate failed");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            match verdict {
                Verdict::Accept(output) => {
                    tracing::info!(stage = %stage, label, round, "Candidate accepted");
                    return Ok(output);
                }
                Verdict::Retry {
                    feedback,
                    fallback: candidate_fallback,
                } => {
                    if fallback.is_none() {
                        fallback = candidate_fallback;
                    }
                    if next_turn.is_none() {
                        last_error = feedback.clone();
                        next_turn = Some((text, feedback));
                    }
                }
            }
        }

        match (next_turn, first_error) {
            (Some((text, feedback)), _) => {
                tracing::debug!(stage = %stage, label, round, "Candidates rejected, refining");
                conversation.push(Message::assistant(text));
                conversation.push(Message::user(feedback));
            }
            // Every candidate errored out; nothing to refine from.
            (None, Some(e)) => return Err(e),
            (None, None) => {}
        }
    }

    if let Some(output) = fallback {
        tracing::warn!(stage = %stage, label, "Search budget exhausted, keeping best candidate");
        return Ok(output);
    }
    Err(PipelineError::SearchExhausted {
        stage,
        rounds: env.search.max_depth,
        last_error,
    })
}

/// First user turn: the stage prompt, plus the previous artifact and the
/// reviewer's feedback when this is a revision.
pub(crate) fn opening_message(prompt: String, previous: Option<&str>, feedback: Option<&str>) -> Vec<Message> {
    let content = match (previous, feedback) {
        (Some(previous), Some(feedback)) => format!(
            "{prompt}\n{}",
            prompts::render(prompts::REVISION, &[("previous", previous), ("feedback", feedback)])
        ),
        (None, Some(feedback)) => format!("{prompt}\n\nAdditional requirements:\n{feedback}"),
        _ => prompt,
    };
    vec![Message::user(content)]
}

/// Run one job per function with bounded concurrency; any job error fails
/// the whole stage.
pub(crate) async fn run_per_function<T, F, Fut>(
    names: Vec<String>,
    max_concurrency: usize,
    job: F,
) -> Result<BTreeMap<String, T>, PipelineError>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<T, PipelineError>>,
{
    use futures::stream::{self, StreamExt};

    let results: Vec<(String, Result<T, PipelineError>)> = stream::iter(names)
        .map(|name| {
            let fut = job(name.clone());
            async move { (name, fut.await) }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;

    let mut out = BTreeMap::new();
    for (name, result) in results {
        out.insert(name, result?);
    }
    Ok(out)
}

/// Components a handler stage must (re)generate: everything on a first run
/// or with general feedback, otherwise only the components named in feedback.
pub(crate) fn components_to_run(
    all: &[String],
    feedback: &BTreeMap<String, String>,
    existing: &BTreeMap<String, impl Sized>,
) -> Vec<String> {
    let targeted = !feedback.is_empty()
        && !feedback.contains_key(super::context::GENERAL_FEEDBACK)
        && all.iter().all(|name| existing.contains_key(name));
    if targeted {
        all.iter()
            .filter(|name| feedback.contains_key(*name))
            .cloned()
            .collect()
    } else {
        all.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::validate::NoopCompiler;

    struct AcceptContaining(&'static str);

    #[async_trait]
    impl Evaluator for AcceptContaining {
        type Output = String;

        async fn evaluate(&self, response: &str) -> Result<Verdict<String>, PipelineError> {
            if response.contains(self.0) {
                Ok(Verdict::Accept(response.to_string()))
            } else {
                Ok(Verdict::Retry {
                    feedback: format!("missing {}", self.0),
                    fallback: None,
                })
            }
        }
    }

    fn env_with(llm: ScriptedLlm, depth: usize, width: usize) -> (Arc<ScriptedLlm>, ActorEnv) {
        let llm = Arc::new(llm);
        let env = ActorEnv::new(
            llm.clone(),
            Arc::new(NoopCompiler),
            SearchSettings {
                max_depth: depth,
                max_width: width,
                ..SearchSettings::default()
            },
        );
        (llm, env)
    }

    #[tokio::test]
    async fn solve_refines_with_feedback_until_accepted() {
        let (llm, env) = env_with(ScriptedLlm::from_texts(["bad", "good"]), 3, 1);
        let out = solve(&env, Stage::Typespec, "test", vec![Message::user("go")], &AcceptContaining("good"))
            .await
            .unwrap();
        assert_eq!(out, "good");

        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].text(), "bad");
        assert_eq!(second[2].text(), "missing good");
    }

    #[tokio::test]
    async fn solve_exhausts_after_depth_rounds() {
        let (llm, env) = env_with(ScriptedLlm::from_texts(["a", "b", "c", "d"]), 2, 2);
        let err = solve(&env, Stage::Drizzle, "test", vec![Message::user("go")], &AcceptContaining("z"))
            .await
            .unwrap_err();
        match err {
            PipelineError::SearchExhausted { stage, rounds, last_error } => {
                assert_eq!(stage, Stage::Drizzle);
                assert_eq!(rounds, 2);
                assert_eq!(last_error, "missing z");
            }
            other => panic!("Expected SearchExhausted, got {other:?}"),
        }
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test]
    async fn solve_accepts_any_candidate_in_round() {
        let (_, env) = env_with(ScriptedLlm::from_texts(["nope", "yes ok"]), 1, 2);
        let out = solve(&env, Stage::Typespec, "test", vec![Message::user("go")], &AcceptContaining("ok"))
            .await
            .unwrap();
        assert_eq!(out, "yes ok");
    }

    #[tokio::test]
    async fn solve_propagates_llm_errors() {
        let (_, env) = env_with(ScriptedLlm::from_texts(Vec::<String>::new()), 1, 1);
        let err = solve(&env, Stage::Typespec, "test", vec![Message::user("go")], &AcceptContaining("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Llm(_)));
    }

    #[test]
    fn opening_message_includes_revision_context() {
        let msgs = opening_message("PROMPT".into(), Some("old schema"), Some("rename table"));
        let text = msgs[0].text();
        assert!(text.starts_with("PROMPT"));
        assert!(text.contains("old schema"));
        assert!(text.contains("rename table"));

        assert_eq!(opening_message("P".into(), None, None)[0].text(), "P");
    }

    #[tokio::test]
    async fn run_per_function_collects_by_name() {
        let out = run_per_function(vec!["a".into(), "b".into()], 1, |name| async move {
            Ok::<_, PipelineError>(name.to_uppercase())
        })
        .await
        .unwrap();
        assert_eq!(out["a"], "A");
        assert_eq!(out["b"], "B");
    }

    #[test]
    fn targeted_feedback_reruns_only_named_components() {
        let all = vec!["a".to_string(), "b".to_string()];
        let mut existing = BTreeMap::new();
        existing.insert("a".to_string(), ());
        existing.insert("b".to_string(), ());

        let mut feedback = BTreeMap::new();
        assert_eq!(components_to_run(&all, &feedback, &existing), all);

        feedback.insert("b".to_string(), "fix".to_string());
        assert_eq!(components_to_run(&all, &feedback, &existing), vec!["b".to_string()]);

        feedback.insert("general".to_string(), "all".to_string());
        assert_eq!(components_to_run(&all, &feedback, &existing), all);
    }
}
