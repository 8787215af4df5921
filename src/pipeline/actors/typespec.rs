use std::sync::Arc;

use async_trait::async_trait;

use super::{opening_message, solve, ActorEnv, Evaluator, StageActor, StageOutput, Verdict};
use crate::errors::PipelineError;
use crate::pipeline::context::{PipelineContext, TypespecOutput};
use crate::pipeline::parse;
use crate::pipeline::prompts;
use crate::pipeline::state::Stage;
use crate::validate::Compiler;

pub struct TypespecActor {
    env: ActorEnv,
}

impl TypespecActor {
    pub fn new(env: ActorEnv) -> Self {
        Self { env }
    }
}

struct TypespecEvaluator {
    compiler: Arc<dyn Compiler>,
}

#[async_trait]
impl Evaluator for TypespecEvaluator {
    type Output = TypespecOutput;

    async fn evaluate(&self, response: &str) -> Result<Verdict<TypespecOutput>, PipelineError> {
        let output = match parse::parse_typespec(response) {
            Ok(output) => output,
            Err(e) => {
                return Ok(Verdict::retry(prompts::render(
                    prompts::TYPESPEC_FIX,
                    &[("errors", e.to_string().as_str())],
                )));
            }
        };
        if output.llm_functions.is_empty() {
            return Ok(Verdict::retry(prompts::render(
                prompts::TYPESPEC_FIX,
                &[("errors", "The interface has no functions decorated with @llm_func.")],
            )));
        }

        let result = self.compiler.compile_typespec(&output.typespec).await?;
        if result.success() {
            Ok(Verdict::Accept(output))
        } else {
            Ok(Verdict::retry(prompts::render(
                prompts::TYPESPEC_FIX,
                &[("errors", result.error_text().as_str())],
            )))
        }
    }
}

#[async_trait]
impl StageActor for TypespecActor {
    fn stage(&self) -> Stage {
        Stage::Typespec
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError> {
        if ctx.user_requests.is_empty() {
            return Err(PipelineError::MissingInput {
                stage: Stage::Typespec,
                missing: "an application description",
            });
        }
        let description = ctx.user_requests.join("\n\n");
        let prompt = prompts::render(prompts::TYPESPEC, &[("application_description", description.as_str())]);
        let previous = ctx.typespec.as_ref().map(|t| t.typespec.as_str());
        let messages = opening_message(prompt, previous, ctx.stage_feedback(Stage::Typespec));

        let evaluator = TypespecEvaluator {
            compiler: self.env.compiler.clone(),
        };
        let output = solve(&self.env, Stage::Typespec, "typespec", messages, &evaluator).await?;
        tracing::info!(functions = output.llm_functions.len(), "TypeSpec generated");
        Ok(StageOutput::Typespec(output))
    }
}
