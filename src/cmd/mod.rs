//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `generate` | `Generate`       |
//! | `agent`    | `Agent`          |
//! | `tools`    | `Tools`          |
//! | `config`   | `Config`         |

pub mod agent;
pub mod config;
pub mod generate;
pub mod serve;
pub mod tools;

pub use agent::{AgentArgs, cmd_agent};
pub use config::cmd_config;
pub use generate::{GenerateArgs, cmd_generate};
pub use serve::cmd_serve;
pub use tools::cmd_tools;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use appgen::config::AppgenConfig;
use appgen::llm::{LlmClient, ScriptedLlm};

/// A scripted client when a script file is given, otherwise the configured provider.
pub(crate) fn llm_from_script_or_config(
    script: Option<&Path>,
    config: &AppgenConfig,
) -> Result<Arc<dyn LlmClient>> {
    match script {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            let llm = ScriptedLlm::from_json(&json)
                .with_context(|| format!("Failed to parse script {}", path.display()))?;
            tracing::info!(path = %path.display(), completions = llm.remaining(), "Using scripted LLM");
            Ok(Arc::new(llm))
        }
        None => config.llm_client(),
    }
}
