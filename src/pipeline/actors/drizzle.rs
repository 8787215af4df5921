use std::sync::Arc;

use async_trait::async_trait;

use super::{opening_message, solve, ActorEnv, Evaluator, StageActor, StageOutput, Verdict};
use crate::errors::PipelineError;
use crate::pipeline::context::{DrizzleOutput, PipelineContext};
use crate::pipeline::parse;
use crate::pipeline::prompts;
use crate::pipeline::state::Stage;
use crate::validate::Compiler;

/// Translates the TypeSpec into a Drizzle (PostgreSQL) schema.
pub struct DrizzleActor {
    env: ActorEnv,
}

impl DrizzleActor {
    pub fn new(env: ActorEnv) -> Self {
        Self { env }
    }
}

struct DrizzleEvaluator {
    compiler: Arc<dyn Compiler>,
}

fn fix(errors: &str) -> Verdict<DrizzleOutput> {
    Verdict::retry(prompts::render(prompts::DRIZZLE_FIX, &[("errors", errors)]))
}

#[async_trait]
impl Evaluator for DrizzleEvaluator {
    type Output = DrizzleOutput;

    async fn evaluate(&self, response: &str) -> Result<Verdict<DrizzleOutput>, PipelineError> {
        let output = match parse::parse_drizzle(response) {
            Ok(output) => output,
            Err(e) => return Ok(fix(&e.to_string())),
        };
        if output.tables.is_empty() {
            return Ok(fix("No tables found. Export every table as `export const nameTable = pgTable(...)`."));
        }

        let result = self.compiler.compile_drizzle(&output.drizzle_schema).await?;
        // Drizzle tooling can exit 0 while still printing errors on stderr.
        if result.success() && result.stderr.trim().is_empty() {
            Ok(Verdict::Accept(output))
        } else {
            Ok(fix(&result.error_text()))
        }
    }
}

#[async_trait]
impl StageActor for DrizzleActor {
    fn stage(&self) -> Stage {
        Stage::Drizzle
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError> {
        let typespec = ctx.typespec.as_ref().ok_or(PipelineError::MissingInput {
            stage: Stage::Drizzle,
            missing: "a TypeSpec definition",
        })?;
        let prompt = prompts::render(
            prompts::DRIZZLE,
            &[("typespec_definitions", typespec.typespec.as_str())],
        );
        let previous = ctx.drizzle.as_ref().map(|d| d.drizzle_schema.as_str());
        let messages = opening_message(prompt, previous, ctx.stage_feedback(Stage::Drizzle));

        let evaluator = DrizzleEvaluator {
            compiler: self.env.compiler.clone(),
        };
        let output = solve(&self.env, Stage::Drizzle, "drizzle", messages, &evaluator).await?;
        tracing::info!(tables = ?output.tables, "Drizzle schema generated");
        Ok(StageOutput::Drizzle(output))
    }
}
