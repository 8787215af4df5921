use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use appgen::config::AppgenConfig;
use appgen::pipeline::InteractionMode;

mod cmd;

#[derive(Parser)]
#[command(name = "appgen")]
#[command(version, about = "LLM-driven application generator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Which stages stop for review: interactive, non_interactive, typespec_only
    #[arg(long, global = true)]
    pub mode: Option<InteractionMode>,

    /// Model override for all LLM calls
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent API server (POST /message, GET /health)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for local frontends)
        #[arg(long)]
        dev: bool,
    },
    /// Generate an application, reviewing each stage in the terminal
    Generate {
        /// Application description (prompted for when omitted)
        description: Option<String>,

        /// Start from an existing TypeSpec file instead of a description
        #[arg(long, conflicts_with = "description")]
        typespec: Option<PathBuf>,

        /// Directory to write the generated files into
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replay stage completions from a JSON file instead of calling the provider
        #[arg(long)]
        script: Option<PathBuf>,

        /// Confirm every review without prompting
        #[arg(long)]
        yes: bool,
    },
    /// Chat with the controlling agent, which drives the pipeline through the FSM tools
    Agent {
        /// First user message (prompted for when omitted)
        message: Option<String>,

        /// Replay the agent's completions from a JSON file
        #[arg(long)]
        script: Option<PathBuf>,

        /// Replay stage completions from a JSON file
        #[arg(long)]
        stage_script: Option<PathBuf>,

        /// Print raw SSE frames instead of formatted output
        #[arg(long)]
        raw: bool,

        /// Directory to write the generated files into once complete
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Print the FSM tool definitions given to the controlling agent
    Tools {
        /// Print the agent system prompt as well
        #[arg(long)]
        system_prompt: bool,
    },
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default appgen.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when the file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }
    if let Commands::Tools { system_prompt } = &cli.command {
        return cmd::cmd_tools(*system_prompt);
    }

    let config = AppgenConfig::with_cli_args(project_dir, cli.verbose, cli.mode, cli.model.clone())?;
    let json_logs = match cli.log_format {
        Some(format) => format == LogFormat::Json,
        None => config.toml.logging.json,
    };
    let _log_guard = appgen::telemetry::init(cli.verbose, json_logs, config.log_dir().as_deref());

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&config, host.clone(), *port, *dev).await?;
        }
        Commands::Generate {
            description,
            typespec,
            output,
            script,
            yes,
        } => {
            cmd::cmd_generate(
                &config,
                cmd::GenerateArgs {
                    description: description.clone(),
                    typespec: typespec.clone(),
                    output: output.clone(),
                    script: script.clone(),
                    yes: *yes,
                },
            )
            .await?;
        }
        Commands::Agent {
            message,
            script,
            stage_script,
            raw,
            output,
            max_iterations,
        } => {
            cmd::cmd_agent(
                &config,
                cmd::AgentArgs {
                    message: message.clone(),
                    script: script.clone(),
                    stage_script: stage_script.clone(),
                    raw: *raw,
                    output: output.clone(),
                    max_iterations: *max_iterations,
                },
            )
            .await?;
        }
        Commands::Tools { .. } | Commands::Config { .. } => {}
    }

    Ok(())
}
