//! Configuration view and validation commands (`appgen config`).

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use appgen::config::{AppgenConfig, AppgenToml, CONFIG_DIR, CONFIG_FILE};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("appgen Configuration");
            println!("====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                AppgenToml::load(&config_path)?
            } else {
                println!("No appgen.toml found at {}", config_path.display());
                println!("Using default configuration.");
                AppgenToml::default()
            };
            println!();

            println!("[llm]");
            println!("  model = \"{}\"", toml.llm.model);
            println!("  max_tokens = {}", toml.llm.max_tokens);
            println!("  max_retries = {}", toml.llm.max_retries);
            if let Some(base) = &toml.llm.api_base {
                println!("  api_base = \"{}\"", base);
            }
            println!();

            println!("[pipeline]");
            println!("  mode = \"{}\"", toml.pipeline.mode);
            println!("  max_depth = {}", toml.pipeline.max_depth);
            println!("  max_width = {}", toml.pipeline.max_width);
            println!("  max_concurrency = {}", toml.pipeline.max_concurrency);
            println!();

            println!("[validation]");
            println!("  enabled = {}", toml.validation.enabled);
            if let Some(dir) = &toml.validation.template_dir {
                println!("  template_dir = \"{}\"", dir.display());
            }
            println!("  timeout = {}", toml.validation.timeout);
            println!();

            if let Some(image) = &toml.sandbox.image {
                println!("[sandbox]");
                println!("  image = \"{}\"", image);
                println!("  memory = \"{}\"", toml.sandbox.memory);
                println!("  cpus = {}", toml.sandbox.cpus);
                println!();
            }

            println!("[server]");
            println!("  host = \"{}\"", toml.server.host);
            println!("  port = {}", toml.server.port);
            println!("  max_iterations = {}", toml.server.max_iterations);
            println!();

            // Effective values include .env and process environment.
            println!("Effective values (with env overrides):");
            let config = AppgenConfig::new(project_dir.to_path_buf())?;
            println!("  model = \"{}\"", config.toml.llm.model);
            println!("  mode = \"{}\"", config.toml.pipeline.mode);
            println!(
                "  api_key = {}",
                if config.toml.llm.api_key.is_some() { "set" } else { "not set" }
            );
            println!(
                "  builder_token = {}",
                if config.toml.server.builder_token.is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No appgen.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = AppgenToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("appgen.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            let toml = AppgenToml::default();
            toml.save(&config_path)?;

            println!("Created appgen.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [llm] model, max_tokens, max_retries");
            println!("  - [pipeline] mode, max_depth, max_width, max_concurrency");
            println!("  - [validation] template_dir and validator commands");
            println!();
        }
    }

    Ok(())
}
