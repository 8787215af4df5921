use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use super::{CompileResult, Compiler, FileMap, TYPESPEC_HEADER};
use crate::config::{SandboxSection, ValidationSection};
use crate::errors::ValidationError;

const TYPESPEC_PATH: &str = "spec/main.tsp";
const DRIZZLE_PATH: &str = "src/db/schema/application.ts";

/// Runs validators as external processes in a scratch copy of an app template.
///
/// Every check gets a fresh workspace under `work_root`, so concurrent
/// candidates never see each other's files. `node_modules` is linked rather
/// than copied.
#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    template_dir: PathBuf,
    work_root: PathBuf,
    validation: ValidationSection,
    sandbox: SandboxSection,
}

impl ProcessCompiler {
    pub fn new(
        template_dir: PathBuf,
        validation: ValidationSection,
        sandbox: SandboxSection,
    ) -> Self {
        let work_root = validation
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("appgen-validate"));
        Self {
            template_dir,
            work_root,
            validation,
            sandbox,
        }
    }

    /// Create a scratch workspace; it is removed again if populating it fails.
    fn prepare_workspace(&self, files: &FileMap) -> Result<PathBuf, ValidationError> {
        let workspace = self.work_root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&workspace).map_err(|source| ValidationError::Workspace {
            path: workspace.clone(),
            source,
        })?;

        if let Err(e) = populate_workspace(&self.template_dir, &workspace, files) {
            remove_workspace(&workspace);
            return Err(e);
        }
        Ok(workspace)
    }

    /// Build the process, wrapped in `docker run` when a sandbox image is set.
    fn build_command(&self, workspace: &Path, subdir: &str, command: &str) -> Command {
        match &self.sandbox.image {
            Some(image) => {
                let mut cmd = Command::new("docker");
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-v")
                    .arg(format!("{}:/app", workspace.display()))
                    .arg("-w")
                    .arg(if subdir.is_empty() {
                        "/app".to_string()
                    } else {
                        format!("/app/{subdir}")
                    })
                    .arg("--memory")
                    .arg(&self.sandbox.memory)
                    .arg("--cpus")
                    .arg(self.sandbox.cpus.to_string());
                if !self.sandbox.network {
                    cmd.arg("--network").arg("none");
                }
                for (key, value) in &self.sandbox.env {
                    cmd.arg("-e").arg(format!("{key}={value}"));
                }
                cmd.arg(image).arg("sh").arg("-c").arg(command);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(command)
                    .current_dir(workspace.join(subdir))
                    .envs(&self.sandbox.env);
                cmd
            }
        }
    }

    async fn run_in_workspace(
        &self,
        files: &FileMap,
        subdir: &str,
        command: &str,
    ) -> Result<CompileResult, ValidationError> {
        if command.trim().is_empty() {
            return Err(ValidationError::NotConfigured { check: "validator" });
        }
        let workspace = self.prepare_workspace(files)?;
        let result = self.run_command(&workspace, subdir, command).await;
        remove_workspace(&workspace);
        result
    }

    async fn run_command(
        &self,
        workspace: &Path,
        subdir: &str,
        command: &str,
    ) -> Result<CompileResult, ValidationError> {
        tracing::debug!(command, workspace = %workspace.display(), "Running validator");

        let child = self
            .build_command(workspace, subdir, command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ValidationError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let secs = self.validation.timeout;
        let output = match timeout(Duration::from_secs(secs), child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ValidationError::Spawn {
                command: command.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(ValidationError::Timeout {
                    command: command.to_string(),
                    secs,
                });
            }
        };

        let result = CompileResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(command, exit_code = result.exit_code, "Validator finished");
        Ok(result)
    }
}

fn populate_workspace(template: &Path, workspace: &Path, files: &FileMap) -> Result<(), ValidationError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ValidationError::Workspace { path, source }
    };

    copy_template(template, workspace)?;
    for (rel, content) in files {
        let path = workspace.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::write(&path, content).map_err(io_err(&path))?;
    }
    Ok(())
}

fn remove_workspace(workspace: &Path) {
    if let Err(e) = std::fs::remove_dir_all(workspace) {
        tracing::debug!(workspace = %workspace.display(), error = %e, "Failed to clean up validation workspace");
    }
}

fn copy_template(template: &Path, workspace: &Path) -> Result<(), ValidationError> {
    let walker = WalkDir::new(template)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != "node_modules" && e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| ValidationError::Workspace {
            path: template.to_path_buf(),
            source: e.into(),
        })?;
        let Ok(rel) = entry.path().strip_prefix(template) else {
            continue;
        };
        let dest = workspace.join(rel);
        let result = if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
        } else {
            std::fs::copy(entry.path(), &dest).map(|_| ())
        };
        result.map_err(|source| ValidationError::Workspace { path: dest, source })?;
    }

    link_node_modules(template, workspace)
}

#[cfg(unix)]
fn link_node_modules(template: &Path, workspace: &Path) -> Result<(), ValidationError> {
    let source = template.join("node_modules");
    if !source.is_dir() {
        return Ok(());
    }
    let source = source
        .canonicalize()
        .map_err(|e| ValidationError::Workspace {
            path: source.clone(),
            source: e,
        })?;
    let dest = workspace.join("node_modules");
    std::os::unix::fs::symlink(&source, &dest)
        .map_err(|source| ValidationError::Workspace { path: dest, source })
}

#[cfg(not(unix))]
fn link_node_modules(_template: &Path, _workspace: &Path) -> Result<(), ValidationError> {
    Ok(())
}

#[async_trait]
impl Compiler for ProcessCompiler {
    async fn compile_typespec(&self, source: &str) -> Result<CompileResult, ValidationError> {
        let mut files = FileMap::new();
        files.insert(TYPESPEC_PATH.to_string(), format!("{TYPESPEC_HEADER}{source}"));
        self.run_in_workspace(&files, "spec", &self.validation.typespec_command)
            .await
    }

    async fn compile_drizzle(&self, schema: &str) -> Result<CompileResult, ValidationError> {
        let mut files = FileMap::new();
        files.insert(DRIZZLE_PATH.to_string(), schema.to_string());
        self.run_in_workspace(&files, "", &self.validation.drizzle_command)
            .await
    }

    async fn compile_typescript(&self, files: &FileMap) -> Result<CompileResult, ValidationError> {
        self.run_in_workspace(files, "", &self.validation.typescript_command)
            .await
    }

    async fn run_tests(
        &self,
        files: &FileMap,
        test_path: &str,
    ) -> Result<CompileResult, ValidationError> {
        let command = self.validation.test_command.replace("{test_path}", test_path);
        self.run_in_workspace(files, "", &command).await
    }
}
