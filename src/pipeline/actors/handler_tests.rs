use std::sync::Arc;

use async_trait::async_trait;

use super::{
    components_to_run, opening_message, run_per_function, solve, ActorEnv, Evaluator, StageActor,
    StageOutput, Verdict,
};
use crate::artifacts::{self, COMMON_SCHEMA_PATH, DRIZZLE_SCHEMA_PATH};
use crate::errors::PipelineError;
use crate::pipeline::context::{HandlerTestOutput, PipelineContext};
use crate::pipeline::parse;
use crate::pipeline::prompts;
use crate::pipeline::state::Stage;
use crate::validate::{Compiler, FileMap};

/// Generates one bun test suite per declared function.
pub struct HandlerTestsActor {
    env: ActorEnv,
}

impl HandlerTestsActor {
    pub fn new(env: ActorEnv) -> Self {
        Self { env }
    }
}

/// Assemble the test file around the generated imports and cases.
pub(crate) fn compose_suite(function_name: &str, handler_import: &str, imports: &str, tests: &[String]) -> String {
    let mut out = String::new();
    out.push_str("import { afterEach, beforeEach, describe } from \"bun:test\";\n");
    out.push_str("import { resetDB, createDB } from \"../../helpers\";\n");
    out.push_str(handler_import);
    out.push('\n');
    out.push_str(imports);
    out.push_str("\n\n");
    out.push_str(&format!("describe(\"{function_name}\", () => {{\n"));
    out.push_str("    beforeEach(async () => {\n        await createDB();\n    });\n\n");
    out.push_str("    afterEach(async () => {\n        await resetDB();\n    });\n");
    for test in tests {
        out.push('\n');
        for line in test.lines() {
            if line.is_empty() {
                out.push('\n');
            } else {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out.push_str("});\n");
    out
}

struct HandlerTestsEvaluator {
    compiler: Arc<dyn Compiler>,
    function_name: String,
    typescript_schema: String,
    drizzle_schema: String,
    tables: Vec<String>,
}

fn fix(errors: &str) -> Verdict<HandlerTestOutput> {
    Verdict::retry(prompts::render(prompts::HANDLER_TESTS_FIX, &[("errors", errors)]))
}

#[async_trait]
impl Evaluator for HandlerTestsEvaluator {
    type Output = HandlerTestOutput;

    async fn evaluate(&self, response: &str) -> Result<Verdict<HandlerTestOutput>, PipelineError> {
        let (imports, tests) = match parse::parse_handler_tests(response) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(fix(&e.to_string())),
        };
        let unknown = parse::unknown_table_imports(&imports, &self.tables);
        if !unknown.is_empty() {
            return Ok(fix(&format!(
                "Imported tables do not exist in the Drizzle schema: {}. Available tables: {}.",
                unknown.join(", "),
                self.tables.join(", ")
            )));
        }

        let name = &self.function_name;
        let test_path = artifacts::handler_test_path(name);
        // The handler does not exist yet, so compile against its declaration.
        let declared_import = format!("import {{ {name} }} from \"../../common/schema\";");
        let mut files = FileMap::new();
        files.insert(test_path, compose_suite(name, &declared_import, &imports, &tests));
        files.insert(COMMON_SCHEMA_PATH.to_string(), self.typescript_schema.clone());
        files.insert(DRIZZLE_SCHEMA_PATH.to_string(), self.drizzle_schema.clone());

        let result = self.compiler.compile_typescript(&files).await?;
        if !result.success() {
            return Ok(fix(&result.error_text()));
        }

        let handler_import = format!(
            "import {{ handle as {name} }} from \"../../handlers/{}\";",
            artifacts::module_name(name)
        );
        let source = compose_suite(name, &handler_import, &imports, &tests);
        Ok(Verdict::Accept(HandlerTestOutput {
            name: name.clone(),
            imports,
            tests,
            source,
        }))
    }
}

#[async_trait]
impl StageActor for HandlerTestsActor {
    fn stage(&self) -> Stage {
        Stage::HandlerTests
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StageOutput, PipelineError> {
        let typescript = ctx.typescript.as_ref().ok_or(PipelineError::MissingInput {
            stage: Stage::HandlerTests,
            missing: "a TypeScript schema",
        })?;
        let drizzle = ctx.drizzle.as_ref().ok_or(PipelineError::MissingInput {
            stage: Stage::HandlerTests,
            missing: "a Drizzle schema",
        })?;

        let all: Vec<String> = typescript.functions.iter().map(|f| f.name.clone()).collect();
        let names = components_to_run(&all, &ctx.handler_tests_feedback, &ctx.handler_tests);
        tracing::info!(functions = ?names, "Generating handler tests");

        let env = &self.env;
        let results = run_per_function(names, env.search.max_concurrency, |name| {
            let prompt = prompts::render(
                prompts::HANDLER_TESTS,
                &[
                    ("function_name", name.as_str()),
                    ("typescript_schema", typescript.typescript_schema.as_str()),
                    ("drizzle_schema", drizzle.drizzle_schema.as_str()),
                ],
            );
            let feedback = ctx.feedback_for_component(Stage::HandlerTests, &name);
            let previous = ctx.handler_tests.get(&name).map(|t| t.source.as_str());
            let messages = opening_message(prompt, previous, feedback.as_deref());
            let evaluator = HandlerTestsEvaluator {
                compiler: env.compiler.clone(),
                function_name: name.clone(),
                typescript_schema: typescript.typescript_schema.clone(),
                drizzle_schema: drizzle.drizzle_schema.clone(),
                tables: drizzle.tables.clone(),
            };
            async move {
                solve(env, Stage::HandlerTests, &name, messages, &evaluator).await
            }
        })
        .await?;

        Ok(StageOutput::HandlerTests(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::pipeline::actors::SearchSettings;
    use crate::pipeline::context::{DrizzleOutput, FunctionDeclaration, TypescriptOutput};
    use crate::validate::NoopCompiler;

    fn ctx() -> PipelineContext {
        let mut ctx = PipelineContext::new("greeter");
        ctx.drizzle = Some(DrizzleOutput {
            reasoning: String::new(),
            drizzle_schema: "export const greetingsTable = pgTable(\"greetings\", {});".into(),
            tables: vec!["greetingsTable".into()],
        });
        ctx.typescript = Some(TypescriptOutput {
            reasoning: String::new(),
            typescript_schema: "export declare function greetUser(options: R): Promise<string>;".into(),
            functions: vec![FunctionDeclaration {
                name: "greetUser".into(),
                argument_type: "R".into(),
                return_type: "Promise<string>".into(),
            }],
        });
        ctx
    }

    #[test]
    fn suite_wraps_cases_in_describe() {
        let suite = compose_suite(
            "greet",
            "import { handle as greet } from \"../../handlers/greet\";",
            "import { expect, it } from \"bun:test\";",
            &["it(\"works\", () => {\n  expect(1).toBe(1);\n});".to_string()],
        );
        assert!(suite.contains("describe(\"greet\", () => {"));
        assert!(suite.contains("    it(\"works\", () => {\n      expect(1).toBe(1);\n    });"));
        assert!(suite.trim_end().ends_with("});"));
    }

    #[tokio::test]
    async fn unknown_table_import_is_rejected_then_fixed() {
        let bad = "<imports>import { mealsTable } from \"../../db/schema/application\";</imports><test>it(\"a\", () => {});</test>";
        let good = "<imports>import { greetingsTable } from \"../../db/schema/application\";</imports><test>it(\"a\", () => {});</test>";
        let llm = Arc::new(ScriptedLlm::from_texts([bad, good]));
        let env = ActorEnv::new(
            llm.clone(),
            Arc::new(NoopCompiler),
            SearchSettings {
                max_width: 1,
                ..SearchSettings::default()
            },
        );

        let out = HandlerTestsActor::new(env).run(&ctx()).await.unwrap();
        let StageOutput::HandlerTests(tests) = out else {
            panic!("Expected handler tests output");
        };
        let suite = &tests["greetUser"];
        assert!(suite.source.contains("from \"../../handlers/greet_user\""));
        assert!(llm.requests()[1].messages[2].text().contains("mealsTable"));
    }
}
