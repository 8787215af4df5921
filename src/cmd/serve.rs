//! Agent API server command (`appgen serve`).

use std::sync::Arc;

use anyhow::Result;

use appgen::config::AppgenConfig;
use appgen::server::{self, ServerConfig};
use appgen::session::SessionDeps;
use appgen::snapshot::SnapshotSaver;

pub async fn cmd_serve(
    config: &AppgenConfig,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{warning}");
    }

    let llm = config.llm_client()?;
    let template = config.template_files()?;
    tracing::info!(files = template.len(), "Loaded app template");

    let section = &config.toml.server;
    let deps = SessionDeps {
        env: config.actor_env(llm.clone())?,
        agent_llm: llm.clone(),
        naming_llm: Some(llm),
        template: Arc::new(template),
        snapshots: SnapshotSaver::new(config.snapshot_dir()),
        mode: config.toml.pipeline.mode,
        max_iterations: section.max_iterations,
    };

    server::start_server(
        ServerConfig {
            host: host.unwrap_or_else(|| section.host.clone()),
            port: port.unwrap_or(section.port),
            builder_token: section.builder_token.clone(),
            dev_mode: dev || section.dev_mode,
        },
        deps,
    )
    .await
}
