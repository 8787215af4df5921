//! Human-in-the-loop generation (`appgen generate`).

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use appgen::artifacts;
use appgen::config::AppgenConfig;
use appgen::errors::PipelineError;
use appgen::gates::{ReviewDecision, ReviewGate};
use appgen::pipeline::{Application, FsmState, Stage};
use appgen::ui::PipelineUI;

pub struct GenerateArgs {
    pub description: Option<String>,
    pub typespec: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub yes: bool,
}

pub async fn cmd_generate(config: &AppgenConfig, args: GenerateArgs) -> Result<()> {
    let llm = super::llm_from_script_or_config(args.script.as_deref(), config)?;
    let env = config.actor_env(llm)?;
    let mode = config.toml.pipeline.mode;
    let ui = PipelineUI::new(config.verbose);
    let mut gate = ReviewGate::new(args.yes);

    let mut app = Application::new(&env, mode);
    tracing::info!(%mode, "Starting generation");

    if let Some(path) = &args.typespec {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read TypeSpec {}", path.display()))?;
        app = app.with_typespec(&source)?;
        ui.start_processing(FsmState::Processing(Stage::Drizzle));
        app.confirm().await?;
    } else {
        let description = match &args.description {
            Some(description) => description.clone(),
            None => dialoguer::Input::<String>::new()
                .with_prompt("Describe the application")
                .allow_empty(false)
                .interact_text()
                .context("Failed to read application description")?,
        };
        ui.start_processing(FsmState::Processing(Stage::Typespec));
        app.start(&description).await?;
    }

    loop {
        match app.state() {
            FsmState::Review(stage) => {
                ui.show_review(stage, &app.state_output());
                match gate.check_stage(stage)? {
                    ReviewDecision::Confirm => {
                        ui.start_processing(
                            stage.next().map(FsmState::Processing).unwrap_or(FsmState::Complete),
                        );
                        app.confirm().await?;
                    }
                    ReviewDecision::Revise { feedback, component } => {
                        ui.start_processing(FsmState::Processing(stage));
                        match app.provide_feedback(&feedback, component).await {
                            Err(e @ PipelineError::UnknownComponent { .. }) => {
                                ui.failure(&e.to_string());
                            }
                            other => {
                                other?;
                            }
                        }
                    }
                    ReviewDecision::Abort => {
                        ui.failure("Aborted by user");
                        return Ok(());
                    }
                }
            }
            FsmState::Complete => break,
            FsmState::Failure => {
                let error = app.maybe_error().unwrap_or("unknown error").to_string();
                ui.failure(&format!("Generation failed: {error}"));
                bail!("Generation failed: {error}");
            }
            other => bail!("Pipeline stopped in unexpected state {other}"),
        }
    }

    let files = app.artifacts();
    ui.show_files(&files);
    if let Some(dir) = &args.output {
        artifacts::write_to_dir(&files, dir)?;
    }
    ui.complete(args.output.as_deref(), files.len());
    Ok(())
}
