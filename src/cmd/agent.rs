//! Local agent conversation (`appgen agent`).
//!
//! Drives the same session the server runs, carrying `agentState` between
//! turns the way a platform client would.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tokio::sync::mpsc;

use appgen::artifacts;
use appgen::config::AppgenConfig;
use appgen::llm::{ContentBlock, Message};
use appgen::server::models::{
    AgentRequest, AgentSettings, AgentSseEvent, AgentState, ConversationMessage, MessageKind,
    MessageRole,
};
use appgen::session::{AgentSession, SessionDeps};
use appgen::snapshot::SnapshotSaver;
use appgen::ui::PipelineUI;

pub struct AgentArgs {
    pub message: Option<String>,
    pub script: Option<PathBuf>,
    pub stage_script: Option<PathBuf>,
    pub raw: bool,
    pub output: Option<PathBuf>,
    pub max_iterations: Option<usize>,
}

pub async fn cmd_agent(config: &AppgenConfig, args: AgentArgs) -> Result<()> {
    let agent_llm = super::llm_from_script_or_config(args.script.as_deref(), config)?;
    let stage_llm = match &args.stage_script {
        Some(path) => super::llm_from_script_or_config(Some(path), config)?,
        None if args.script.is_some() => agent_llm.clone(),
        None => config.llm_client()?,
    };
    let naming_llm = if args.script.is_some() { None } else { Some(agent_llm.clone()) };

    let deps = SessionDeps {
        env: config.actor_env(stage_llm)?,
        agent_llm,
        naming_llm,
        template: Arc::new(config.template_files()?),
        snapshots: SnapshotSaver::new(config.snapshot_dir()),
        mode: config.toml.pipeline.mode,
        max_iterations: args.max_iterations.unwrap_or(config.toml.server.max_iterations),
    };
    let ui = PipelineUI::new(config.verbose);

    let trace_id = uuid::Uuid::new_v4().to_string();
    let mut session = AgentSession::new("local", &trace_id, deps);
    let mut history: Vec<ConversationMessage> = Vec::new();
    let mut agent_state: Option<AgentState> = None;
    let mut next_message = args.message.clone();

    loop {
        let text = match next_message.take() {
            Some(text) => text,
            None => {
                let text: String = dialoguer::Input::new()
                    .with_prompt("You (empty to quit)")
                    .allow_empty(true)
                    .interact_text()
                    .context("Failed to read user input")?;
                if text.trim().is_empty() {
                    return Ok(());
                }
                text
            }
        };
        history.push(ConversationMessage {
            role: MessageRole::User,
            content: text,
        });

        let request = AgentRequest {
            all_messages: history.clone(),
            application_id: "local".to_string(),
            trace_id: trace_id.clone(),
            agent_state: agent_state.clone(),
            all_files: None,
            settings: Some(AgentSettings {
                max_iterations: args.max_iterations,
                interaction_mode: None,
            }),
        };

        let (tx, mut rx) = mpsc::channel::<AgentSseEvent>(16);
        let printer = {
            let raw = args.raw;
            tokio::spawn(async move {
                let mut events = Vec::new();
                while let Some(event) = rx.recv().await {
                    if raw {
                        print!("{}", event.to_sse_frame());
                    }
                    events.push(event);
                }
                events
            })
        };
        session.process(&request, tx).await;
        let events = printer.await.context("Event printer task failed")?;

        let Some(last) = events.last() else {
            return Ok(());
        };
        if !args.raw {
            for event in &events {
                show_event(&ui, event);
            }
        }

        if let Some(state) = events.iter().rev().find_map(|e| e.message.agent_state.clone()) {
            agent_state = Some(state);
        }
        history.push(ConversationMessage {
            role: MessageRole::Assistant,
            content: assistant_text(&last.message.content),
        });

        match last.message.kind {
            MessageKind::ReviewResult => {
                if let Some(dir) = &args.output {
                    let checkpoint = agent_state.as_ref().and_then(|s| s.fsm_state.as_ref());
                    if let Some(checkpoint) = checkpoint {
                        let files = artifacts::collect(&checkpoint.context);
                        artifacts::write_to_dir(&files, dir)?;
                        ui.complete(Some(dir), files.len());
                    }
                }
                return Ok(());
            }
            MessageKind::RuntimeError => return Ok(()),
            MessageKind::RefinementRequest | MessageKind::StageResult => {}
        }
    }
}

fn show_event(ui: &PipelineUI, event: &AgentSseEvent) {
    let message = &event.message;
    match message.kind {
        MessageKind::StageResult | MessageKind::RefinementRequest => {
            if let Ok(messages) = serde_json::from_str::<Vec<Message>>(&message.content) {
                for block in messages.iter().flat_map(|m| &m.content) {
                    if let ContentBlock::ToolUse { name, input, .. } = block {
                        ui.show_tool_use(name, input);
                    }
                }
            }
            let text = assistant_text(&message.content);
            if !text.trim().is_empty() {
                ui.show_agent_text(&text);
            }
        }
        MessageKind::ReviewResult => {
            if let Some(stats) = &message.diff_stat {
                for stat in stats {
                    println!(
                        "  {} {} {}",
                        style(&stat.path).cyan(),
                        style(format!("+{}", stat.insertions)).green(),
                        style(format!("-{}", stat.deletions)).red()
                    );
                }
            }
            if let Some(commit) = &message.commit_message {
                ui.success(commit);
            }
        }
        MessageKind::RuntimeError => ui.failure(&message.content),
    }
}

/// Event content is a JSON list of assistant messages; fall back to the raw text.
fn assistant_text(content: &str) -> String {
    match serde_json::from_str::<Vec<Message>>(content) {
        Ok(messages) => messages
            .iter()
            .map(Message::text)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Err(_) => content.to_string(),
    }
}
