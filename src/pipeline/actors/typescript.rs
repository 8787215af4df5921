use std::sync::Arc;

use async_trait::async_trait;

use super::{opening_message, solve, ActorEnv, Evaluator, StageActor, StageOutput, Verdict};
use crate::artifacts::COMMON_SCHEMA_PATH;
use crate::errors::PipelineError;
use crate::pipeline::context::{PipelineContext, TypescriptOutput};
use crate::pipeline::parse;
use crate::pipeline::prompts;
use crate::pipeline::state::Stage;
use crate::validate::{Compiler, FileMap};

/// Generates zod schemas, types, and `export declare function` stubs.
pub struct TypescriptActor {
    env: ActorEnv,
}

impl TypescriptActor {
    pub fn new(env: ActorEnv) -> Self {
        Self { env }
    }
}

struct TypescriptEvaluator {
    compiler: Arc<dyn Compiler>,
}

fn fix(errors: &str) -> Verdict<TypescriptOutput> {
    Verdict::retry(prompts::render(prompts::TYPESCRIPT_FIX, &[("errors", errors)]))
}

#[async_trait]
impl Evaluator for TypescriptEvaluator {
    type Output = TypescriptOutput;

    async fn evaluate(&self, response: &str) -> Result<Verdict<TypescriptOutput>, PipelineError> {
        let output = match parse::parse_typescript(response) {
            Ok(output) => output,
            Err(e) => return Ok(fix(&e.to_string())),
        };

        let mut files = FileMap::new();
        files.insert(COMMON_SCHEMA_PATH.to_string(), output.typescript_schema.clone());
        let result = self.compiler.compile_typescript(&files).await?;
        if result.success() {
            Ok(Verdict::Accept(output))
        } else {
            Ok(fix(&result.error_text()))
        }
    }
}

#[async_trait]
impl StageActor for TypescriptActor {
    fn stage(&self) -> Stage {
        Stage::Typescript
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError> {
        let typespec = ctx.typespec.as_ref().ok_or(PipelineError::MissingInput {
            stage: Stage::Typescript,
            missing: "a TypeSpec definition",
        })?;
        let prompt = prompts::render(
            prompts::TYPESCRIPT,
            &[("typespec_definitions", typespec.typespec.as_str())],
        );
        let previous = ctx.typescript.as_ref().map(|t| t.typescript_schema.as_str());
        let messages = opening_message(prompt, previous, ctx.stage_feedback(Stage::Typescript));

        let evaluator = TypescriptEvaluator {
            compiler: self.env.compiler.clone(),
        };
        let output = solve(&self.env, Stage::Typescript, "typescript", messages, &evaluator).await?;
        tracing::info!(functions = output.functions.len(), "TypeScript schema generated");
        Ok(StageOutput::Typescript(output))
    }
}
