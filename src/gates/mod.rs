//! Human review gate for `*_review` checkpoints.

use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};

use crate::pipeline::Stage;

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Confirm,
    /// Rerun the stage with this feedback.
    Revise {
        feedback: String,
        component: Option<String>,
    },
    Abort,
}

pub struct ReviewGate {
    pub skip_all: bool,
}

impl ReviewGate {
    pub fn new(skip_all: bool) -> Self {
        Self { skip_all }
    }

    pub fn check_stage(&mut self, stage: Stage) -> Result<ReviewDecision> {
        if self.skip_all {
            println!("  {} (--yes flag)", console::style("Auto-confirmed").dim());
            return Ok(ReviewDecision::Confirm);
        }
        self.prompt_user(stage)
    }

    fn prompt_user(&mut self, stage: Stage) -> Result<ReviewDecision> {
        let options = &[
            "Confirm and continue",
            "Confirm and auto-confirm remaining stages (--yes)",
            "Give feedback and regenerate",
            "Abort",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Review {}", stage.description()))
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(ReviewDecision::Confirm),
            1 => {
                self.skip_all = true;
                Ok(ReviewDecision::Confirm)
            }
            2 => {
                let feedback: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Feedback")
                    .allow_empty(false)
                    .interact_text()
                    .context("Failed to read feedback")?;
                let component = if stage.is_per_component() {
                    let name: String = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt("Function name (empty for all)")
                        .allow_empty(true)
                        .interact_text()
                        .context("Failed to read function name")?;
                    normalize_component(&name)
                } else {
                    None
                };
                Ok(ReviewDecision::Revise { feedback, component })
            }
            _ => Ok(ReviewDecision::Abort),
        }
    }
}

/// Blank input means "all components".
pub fn normalize_component(input: &str) -> Option<String> {
    let trimmed = input.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
