//! Configuration for appgen.
//!
//! Settings are read from `.appgen/appgen.toml` and layered:
//! file → environment → CLI.
//!
//! ```toml
//! [llm]
//! model = "claude-sonnet-4-20250514"
//! max_tokens = 8192
//! max_retries = 3
//!
//! [pipeline]
//! mode = "interactive"
//! max_depth = 3
//! max_width = 2
//! max_concurrency = 5
//!
//! [validation]
//! enabled = true
//! template_dir = "templates/app_schema"
//! typespec_command = "npx tsp compile ."
//! drizzle_command = "npx tsc --noEmit"
//! typescript_command = "npx tsc --noEmit"
//! test_command = "bun test {test_path}"
//! timeout = 120
//!
//! [sandbox]
//! image = "oven/bun:1"
//! memory = "2g"
//! cpus = 1.0
//! network = false
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8001
//! max_iterations = 30
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifacts;
use crate::llm::{AnthropicClient, LlmClient};
use crate::pipeline::actors::{ActorEnv, SearchSettings};
use crate::pipeline::InteractionMode;
use crate::validate::{Compiler, FileMap, NoopCompiler, ProcessCompiler};

pub const CONFIG_DIR: &str = ".appgen";
pub const CONFIG_FILE: &str = "appgen.toml";

/// Chat-completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    /// Usually left unset in favor of `ANTHROPIC_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_retries() -> u32 {
    3
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            api_base: None,
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
        }
    }
}

/// Stage pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub mode: InteractionMode,
    /// Refinement rounds per stage.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Concurrent candidates per round.
    #[serde(default = "default_max_width")]
    pub max_width: usize,
    /// Concurrent per-function jobs in handler stages.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_depth() -> usize {
    3
}

fn default_max_width() -> usize {
    2
}

fn default_max_concurrency() -> usize {
    5
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            mode: InteractionMode::default(),
            max_depth: default_max_depth(),
            max_width: default_max_width(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// External validator commands. Each runs inside a scratch copy of
/// `template_dir` with the generated files written in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_typespec_command")]
    pub typespec_command: String,
    #[serde(default = "default_tsc_command")]
    pub drizzle_command: String,
    #[serde(default = "default_tsc_command")]
    pub typescript_command: String,
    /// `{test_path}` is replaced with the test file being run.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Seconds before a validator is killed.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_typespec_command() -> String {
    "npx tsp compile .".to_string()
}

fn default_tsc_command() -> String {
    "npx tsc --noEmit".to_string()
}

fn default_test_command() -> String {
    "bun test {test_path}".to_string()
}

fn default_timeout() -> u64 {
    120
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            template_dir: None,
            work_dir: None,
            typespec_command: default_typespec_command(),
            drizzle_command: default_tsc_command(),
            typescript_command: default_tsc_command(),
            test_command: default_test_command(),
            timeout: default_timeout(),
        }
    }
}

/// Docker sandbox for validators. No image means validators run on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> f64 {
    1.0
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            image: None,
            memory: default_memory(),
            cpus: default_cpus(),
            network: false,
            env: HashMap::new(),
        }
    }
}

/// Agent server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on `/message`; unset disables auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_token: Option<String>,
    /// Permissive CORS for local frontends.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    /// Upper bound on LLM turns per `/message` request.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_max_iterations() -> usize {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            builder_token: None,
            dev_mode: false,
            snapshot_dir: None,
            max_iterations: default_max_iterations(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily-rolling log files; stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// The complete appgen.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppgenToml {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AppgenToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse appgen.toml")
    }

    /// Load `.appgen/appgen.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize appgen.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment variables on top of file settings.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = env("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = env("APPGEN_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(token) = env("BUILDER_TOKEN").filter(|v| !v.is_empty()) {
            self.server.builder_token = Some(token);
        }
        if let Some(dir) = env("SNAPSHOT_DIR").filter(|v| !v.is_empty()) {
            self.server.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = env("APPGEN_MODE").filter(|v| !v.is_empty()) {
            self.pipeline.mode = mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!("APPGEN_MODE: {e}"))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_depth == 0 {
            warnings.push("pipeline.max_depth is 0: stages will never call the LLM".to_string());
        }
        if self.pipeline.max_width == 0 {
            warnings.push("pipeline.max_width is 0: no candidates will be generated".to_string());
        }
        if self.pipeline.max_concurrency == 0 {
            warnings.push("pipeline.max_concurrency is 0: treated as 1".to_string());
        }
        if self.validation.enabled {
            match &self.validation.template_dir {
                None => warnings.push(
                    "validation.enabled is true but validation.template_dir is not set".to_string(),
                ),
                Some(dir) if !dir.is_dir() => warnings.push(format!(
                    "validation.template_dir '{}' does not exist",
                    dir.display()
                )),
                Some(_) => {}
            }
            if !self.validation.test_command.contains("{test_path}") {
                warnings.push(
                    "validation.test_command has no {test_path} placeholder; every handler runs the whole suite"
                        .to_string(),
                );
            }
        }
        if self.sandbox.cpus <= 0.0 {
            warnings.push(format!("sandbox.cpus must be positive, got {}", self.sandbox.cpus));
        }
        if self.server.max_iterations == 0 {
            warnings.push("server.max_iterations is 0: agent requests will do nothing".to_string());
        }

        warnings
    }
}

/// Resolved configuration: appgen.toml + environment + CLI overrides.
#[derive(Debug, Clone)]
pub struct AppgenConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: AppgenToml,
    pub verbose: bool,
}

impl AppgenConfig {
    /// Load from a project directory, reading `.env` and the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = AppgenToml::load_or_default(&config_dir)?;
        // A missing .env is the common case.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        toml.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        mode: Option<InteractionMode>,
        model: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(mode) = mode {
            config.toml.pipeline.mode = mode;
        }
        if let Some(model) = model {
            config.toml.llm.model = model;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn snapshot_dir(&self) -> Option<PathBuf> {
        self.toml.server.snapshot_dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn search_settings(&self) -> SearchSettings {
        let pipeline = &self.toml.pipeline;
        SearchSettings {
            max_depth: pipeline.max_depth,
            max_width: pipeline.max_width,
            max_concurrency: pipeline.max_concurrency,
            max_tokens: self.toml.llm.max_tokens,
            model: None,
        }
    }

    /// The configured provider client.
    pub fn llm_client(&self) -> Result<Arc<dyn LlmClient>> {
        let llm = &self.toml.llm;
        let mut client = AnthropicClient::from_key_or_env(llm.api_key.as_deref(), &llm.model)?
            .with_max_retries(llm.max_retries);
        if let Some(base) = &llm.api_base {
            client = client.with_api_base(base.clone());
        }
        Ok(Arc::new(client))
    }

    /// External validators when enabled, otherwise a compiler that accepts everything.
    pub fn compiler(&self) -> Result<Arc<dyn Compiler>> {
        let validation = &self.toml.validation;
        if !validation.enabled {
            tracing::debug!("Validation disabled, accepting all artifacts");
            return Ok(Arc::new(NoopCompiler));
        }
        let template_dir = validation
            .template_dir
            .as_deref()
            .map(|dir| self.resolve(dir))
            .context("validation.enabled requires validation.template_dir")?;
        let mut validation = validation.clone();
        validation.work_dir = validation.work_dir.as_deref().map(|dir| self.resolve(dir));
        Ok(Arc::new(ProcessCompiler::new(
            template_dir,
            validation,
            self.toml.sandbox.clone(),
        )))
    }

    pub fn actor_env(&self, llm: Arc<dyn LlmClient>) -> Result<ActorEnv> {
        Ok(ActorEnv::new(llm, self.compiler()?, self.search_settings()))
    }

    /// Files of the configured app template, or nothing when none is set.
    pub fn template_files(&self) -> Result<FileMap> {
        match &self.toml.validation.template_dir {
            Some(dir) => {
                let dir = self.resolve(dir);
                if dir.is_dir() {
                    artifacts::load_template(&dir)
                } else {
                    tracing::warn!(dir = %dir.display(), "Template directory not found");
                    Ok(FileMap::new())
                }
            }
            None => Ok(FileMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let toml = AppgenToml::default();
        assert_eq!(toml.pipeline.max_depth, 3);
        assert_eq!(toml.pipeline.max_width, 2);
        assert_eq!(toml.pipeline.max_concurrency, 5);
        assert_eq!(toml.pipeline.mode, InteractionMode::Interactive);
        assert!(!toml.validation.enabled);
        assert_eq!(toml.server.port, 8001);
        assert!(toml.sandbox.image.is_none());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let toml = AppgenToml::parse(
            r#"
[pipeline]
mode = "typespec_only"
max_width = 3

[sandbox]
image = "oven/bun:1"

[sandbox.env]
NODE_ENV = "test"
"#,
        )
        .unwrap();
        assert_eq!(toml.pipeline.mode, InteractionMode::TypespecOnly);
        assert_eq!(toml.pipeline.max_width, 3);
        assert_eq!(toml.pipeline.max_depth, 3);
        assert_eq!(toml.sandbox.image.as_deref(), Some("oven/bun:1"));
        assert_eq!(toml.sandbox.env.get("NODE_ENV").unwrap(), "test");
        assert_eq!(toml.llm.max_tokens, 8192);
    }

    #[test]
    fn test_parse_invalid_mode_fails() {
        assert!(AppgenToml::parse("[pipeline]\nmode = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = AppgenToml::parse("[llm]\nmodel = \"from-file\"\n").unwrap();
        toml.apply_env(env_from(&[
            ("APPGEN_MODEL", "from-env"),
            ("BUILDER_TOKEN", "secret"),
            ("APPGEN_MODE", "non_interactive"),
            ("SNAPSHOT_DIR", "/tmp/snaps"),
        ]))
        .unwrap();
        assert_eq!(toml.llm.model, "from-env");
        assert_eq!(toml.server.builder_token.as_deref(), Some("secret"));
        assert_eq!(toml.pipeline.mode, InteractionMode::NonInteractive);
        assert_eq!(toml.server.snapshot_dir, Some(PathBuf::from("/tmp/snaps")));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut toml = AppgenToml::default();
        toml.apply_env(env_from(&[("BUILDER_TOKEN", "")])).unwrap();
        assert!(toml.server.builder_token.is_none());
    }

    #[test]
    fn test_invalid_env_mode_is_error() {
        let mut toml = AppgenToml::default();
        let err = toml.apply_env(env_from(&[("APPGEN_MODE", "loud")])).unwrap_err();
        assert!(err.to_string().contains("APPGEN_MODE"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = AppgenToml::default();
        toml.pipeline.max_concurrency = 9;
        toml.save(&path).unwrap();
        let loaded = AppgenToml::load(&path).unwrap();
        assert_eq!(loaded.pipeline.max_concurrency, 9);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = AppgenToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.server.max_iterations, 30);
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = AppgenToml::default();
        assert!(toml.validate().is_empty());

        toml.validation.enabled = true;
        toml.pipeline.max_width = 0;
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("template_dir")));
        assert!(warnings.iter().any(|w| w.contains("max_width")));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let dir = tempdir().unwrap();
        let mut config = AppgenConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.logging.dir = Some(PathBuf::from("logs"));
        assert_eq!(config.log_dir().unwrap(), config.project_dir.join("logs"));
        assert_eq!(config.resolve(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn test_search_settings_follow_pipeline_section() {
        let dir = tempdir().unwrap();
        let mut config = AppgenConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.pipeline.max_width = 4;
        config.toml.llm.max_tokens = 1000;
        let search = config.search_settings();
        assert_eq!(search.max_width, 4);
        assert_eq!(search.max_tokens, 1000);
    }

    #[test]
    fn test_enabled_validation_needs_template_dir() {
        let dir = tempdir().unwrap();
        let mut config = AppgenConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.compiler().is_ok());
        assert!(config.template_files().unwrap().is_empty());

        config.toml.validation.enabled = true;
        let err = config.compiler().err().unwrap();
        assert!(err.to_string().contains("template_dir"));
    }
}
