use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::{FsmState, Stage};
use crate::ui::icons::{CHECK, CROSS, FILE_NEW, FOLDER, REVIEW, RUNNING, SPARKLE, TOOL};
use crate::validate::FileMap;

/// Terminal UI for a pipeline run: a spinner while a stage generates, plus
/// static lines for reviews, tool calls and written files.
pub struct PipelineUI {
    spinner: ProgressBar,
    verbose: bool,
}

impl PipelineUI {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_prefix("appgen");
        Self { spinner, verbose }
    }

    /// Hidden UI for non-terminal runs and tests.
    pub fn hidden() -> Self {
        Self {
            spinner: ProgressBar::hidden(),
            verbose: false,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.spinner.is_hidden() {
            println!("{}", msg.as_ref());
        } else {
            self.spinner.println(msg.as_ref());
        }
    }

    /// Start the spinner for work that runs until the next review.
    pub fn start_processing(&self, state: FsmState) {
        let label = match state.stage() {
            Some(stage) => format!("Generating {}", style(stage.description()).yellow()),
            None => "Working".to_string(),
        };
        self.print_line(format!("{}{}", RUNNING, label));
        self.spinner.set_message(label);
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    pub fn finish_processing(&self) {
        self.spinner.disable_steady_tick();
        self.spinner.set_message("");
    }

    /// Show the artifact a review state waits on.
    pub fn show_review(&self, stage: Stage, output: &serde_json::Value) {
        self.finish_processing();
        self.print_line(format!(
            "\n{}{} {}",
            REVIEW,
            style("Review:").bold(),
            style(stage.description()).cyan()
        ));
        let body = match output.get(stage.as_str()) {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
            None => serde_json::to_string_pretty(output).unwrap_or_default(),
        };
        for line in body.lines() {
            self.print_line(format!("  {}", style(line).dim()));
        }
    }

    pub fn show_tool_use(&self, name: &str, input: &serde_json::Value) {
        if self.verbose {
            self.print_line(format!("    {}{} {}", TOOL, style(name).yellow(), style(input).dim()));
        } else {
            self.print_line(format!("    {}{}", TOOL, style(name).yellow()));
        }
    }

    pub fn show_agent_text(&self, text: &str) {
        self.print_line(format!("\n{}", text.trim()));
    }

    pub fn show_files(&self, files: &FileMap) {
        for path in files.keys() {
            self.print_line(format!("  {}{}", FILE_NEW, style(path).green()));
        }
    }

    pub fn complete(&self, output_dir: Option<&std::path::Path>, file_count: usize) {
        self.finish_processing();
        match output_dir {
            Some(dir) => self.print_line(format!(
                "{}{} {} files written to {}{}",
                SPARKLE,
                style("Complete:").green().bold(),
                file_count,
                FOLDER,
                style(dir.display()).cyan()
            )),
            None => self.print_line(format!(
                "{}{} {} files generated",
                SPARKLE,
                style("Complete:").green().bold(),
                file_count
            )),
        }
    }

    pub fn success(&self, msg: &str) {
        self.print_line(format!("{}{}", CHECK, style(msg).green()));
    }

    pub fn failure(&self, msg: &str) {
        self.finish_processing();
        self.print_line(format!("{}{}", CROSS, style(msg).red().bold()));
    }
}
