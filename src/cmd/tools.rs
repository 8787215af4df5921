//! Tool definition dump (`appgen tools`).

use anyhow::{Context, Result};

use appgen::tools::FsmToolProcessor;

pub fn cmd_tools(system_prompt: bool) -> Result<()> {
    let tools = FsmToolProcessor::tool_definitions();
    let json = serde_json::to_string_pretty(&tools).context("Failed to serialize tool definitions")?;
    println!("{json}");

    if system_prompt {
        println!();
        println!("{}", FsmToolProcessor::system_prompt());
    }
    Ok(())
}
