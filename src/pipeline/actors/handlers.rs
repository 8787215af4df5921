use std::sync::Arc;

use async_trait::async_trait;

use super::{
    components_to_run, opening_message, run_per_function, solve, ActorEnv, Evaluator, StageActor,
    StageOutput, Verdict,
};
use crate::artifacts::{self, COMMON_SCHEMA_PATH, DRIZZLE_SCHEMA_PATH};
use crate::errors::PipelineError;
use crate::pipeline::context::{HandlerOutput, HandlerStatus, HandlerTestOutput, PipelineContext};
use crate::pipeline::parse;
use crate::pipeline::prompts;
use crate::pipeline::state::Stage;
use crate::validate::{Compiler, FileMap};

/// Implements every declared function against its test suite.
///
/// A handler that compiles but still fails its tests when the search budget
/// runs out is kept as [`HandlerStatus::TestsFailed`]; anything worse fails
/// the stage.
pub struct HandlersActor {
    env: ActorEnv,
}

impl HandlersActor {
    pub fn new(env: ActorEnv) -> Self {
        Self { env }
    }
}

struct HandlerEvaluator {
    compiler: Arc<dyn Compiler>,
    function_name: String,
    typescript_schema: String,
    drizzle_schema: String,
    tables: Vec<String>,
    test_suite: HandlerTestOutput,
}

fn fix(errors: &str) -> Verdict<HandlerOutput> {
    Verdict::retry(prompts::render(prompts::HANDLER_FIX, &[("errors", errors)]))
}

#[async_trait]
impl Evaluator for HandlerEvaluator {
    type Output = HandlerOutput;

    async fn evaluate(&self, response: &str) -> Result<Verdict<HandlerOutput>, PipelineError> {
        let source = match parse::parse_handler(response) {
            Ok(source) => source,
            Err(e) => return Ok(fix(&e.to_string())),
        };
        let unknown = parse::unknown_table_imports(&source, &self.tables);
        if !unknown.is_empty() {
            return Ok(fix(&format!(
                "Imported tables do not exist in the Drizzle schema: {}. Available tables: {}.",
                unknown.join(", "),
                self.tables.join(", ")
            )));
        }

        let name = &self.function_name;
        let mut files = FileMap::new();
        files.insert(artifacts::handler_path(name), source.clone());
        files.insert(COMMON_SCHEMA_PATH.to_string(), self.typescript_schema.clone());
        files.insert(DRIZZLE_SCHEMA_PATH.to_string(), self.drizzle_schema.clone());

        let compiled = self.compiler.compile_typescript(&files).await?;
        if !compiled.success() {
            return Ok(fix(&compiled.error_text()));
        }

        let test_path = artifacts::handler_test_path(name);
        files.insert(test_path.clone(), self.test_suite.source.clone());
        let tests = self.compiler.run_tests(&files, &test_path).await?;
        if tests.success() {
            return Ok(Verdict::Accept(HandlerOutput {
                name: name.clone(),
                source,
                status: HandlerStatus::Passed,
            }));
        }

        let output = tests.error_text();
        Ok(Verdict::Retry {
            feedback: prompts::render(
                prompts::HANDLER_FIX,
                &[("errors", format!("Tests failed:\n{output}").as_str())],
            ),
            fallback: Some(HandlerOutput {
                name: name.clone(),
                source,
                status: HandlerStatus::TestsFailed { output },
            }),
        })
    }
}

#[async_trait]
impl StageActor for HandlersActor {
    fn stage(&self) -> Stage {
        Stage::Handlers
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError> {
        let missing = |what| PipelineError::MissingInput {
            stage: Stage::Handlers,
            missing: what,
        };
        let typespec = ctx.typespec.as_ref().ok_or_else(|| missing("a TypeSpec definition"))?;
        let typescript = ctx.typescript.as_ref().ok_or_else(|| missing("a TypeScript schema"))?;
        let drizzle = ctx.drizzle.as_ref().ok_or_else(|| missing("a Drizzle schema"))?;

        let all: Vec<String> = typescript.functions.iter().map(|f| f.name.clone()).collect();
        if let Some(name) = all.iter().find(|n| !ctx.handler_tests.contains_key(*n)) {
            tracing::warn!(function = %name, "No test suite for function");
            return Err(missing("a test suite for every function"));
        }
        let names = components_to_run(&all, &ctx.handlers_feedback, &ctx.handlers);
        tracing::info!(functions = ?names, "Generating handlers");

        let env = &self.env;
        let results = run_per_function(names, env.search.max_concurrency, |name| {
            let test_suite = ctx.handler_tests[&name].clone();
            let prompt = prompts::render(
                prompts::HANDLER,
                &[
                    ("function_name", name.as_str()),
                    ("typespec_schema", typespec.typespec.as_str()),
                    ("typescript_schema", typescript.typescript_schema.as_str()),
                    ("drizzle_schema", drizzle.drizzle_schema.as_str()),
                    ("test_suite", test_suite.source.as_str()),
                ],
            );
            let feedback = ctx.feedback_for_component(Stage::Handlers, &name);
            let previous = ctx.handlers.get(&name).map(|h| h.source.as_str());
            let messages = opening_message(prompt, previous, feedback.as_deref());
            let evaluator = HandlerEvaluator {
                compiler: env.compiler.clone(),
                function_name: name.clone(),
                typescript_schema: typescript.typescript_schema.clone(),
                drizzle_schema: drizzle.drizzle_schema.clone(),
                tables: drizzle.tables.clone(),
                test_suite,
            };
            async move { solve(env, Stage::Handlers, &name, messages, &evaluator).await }
        })
        .await?;

        let failing: Vec<&str> = results
            .values()
            .filter(|h| matches!(h.status, HandlerStatus::TestsFailed { .. }))
            .map(|h| h.name.as_str())
            .collect();
        if !failing.is_empty() {
            tracing::warn!(handlers = ?failing, "Handlers kept with failing tests");
        }
        Ok(StageOutput::Handlers(results))
    }
}
