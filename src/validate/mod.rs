//! Validation seam for generated artifacts.
//!
//! Stage actors never call compilers directly; they go through a
//! [`Compiler`]. A check that runs and reports problems returns a failed
//! [`CompileResult`]; only a validator that cannot run at all is an error.

mod process;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

pub use process::ProcessCompiler;

/// Generated files keyed by path relative to the app root.
pub type FileMap = BTreeMap<String, String>;

/// Exit status and captured output of one validator run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompileResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CompileResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: output.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The diagnostics to show the LLM: stdout, falling back to stderr.
    pub fn error_text(&self) -> String {
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            self.stderr.trim().to_string()
        } else {
            stdout.to_string()
        }
    }
}

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile a TypeSpec document (helpers header already prepended).
    async fn compile_typespec(&self, source: &str) -> Result<CompileResult, ValidationError>;

    async fn compile_drizzle(&self, schema: &str) -> Result<CompileResult, ValidationError>;

    async fn compile_typescript(&self, files: &FileMap) -> Result<CompileResult, ValidationError>;

    async fn run_tests(
        &self,
        files: &FileMap,
        test_path: &str,
    ) -> Result<CompileResult, ValidationError>;
}

/// Accepts everything. Used when validation is disabled and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompiler;

#[async_trait]
impl Compiler for NoopCompiler {
    async fn compile_typespec(&self, _source: &str) -> Result<CompileResult, ValidationError> {
        Ok(CompileResult::ok())
    }

    async fn compile_drizzle(&self, _schema: &str) -> Result<CompileResult, ValidationError> {
        Ok(CompileResult::ok())
    }

    async fn compile_typescript(&self, _files: &FileMap) -> Result<CompileResult, ValidationError> {
        Ok(CompileResult::ok())
    }

    async fn run_tests(
        &self,
        _files: &FileMap,
        _test_path: &str,
    ) -> Result<CompileResult, ValidationError> {
        Ok(CompileResult::ok())
    }
}

/// Header prepended to every TypeSpec document before compiling.
pub const TYPESPEC_HEADER: &str =
    "import \"./helpers.js\";\n\nextern dec llm_func(target: unknown, description: string);\n\n";
