//! Stepwise CLI.
//!
//! Binary name: `stepwise`
//!
//! Offline inspection tools: parse a model's planning response the way the
//! engine does, and check an engine configuration file.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stepwise_core::{parse_plan, ExecutionPlan};
use stepwise_runtime::EngineConfig;

/// Inspect Stepwise plans and engine configuration.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
struct Cli {
    /// Output machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a planning response and show the resolved plan.
    Plan {
        /// File with the raw model response, or `-` for stdin.
        input: String,

        /// Goal recorded on the plan.
        #[arg(long, default_value = "(cli)")]
        goal: String,
    },

    /// Load and validate an engine configuration file.
    Config {
        /// YAML configuration file.
        path: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct StepSummary {
    step_number: u32,
    description: String,
    tool_name: Option<String>,
    depends_on: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct PlanSummary {
    steps: Vec<StepSummary>,
    waves: Vec<Vec<u32>>,
    /// Steps that can never run because they sit on a dependency cycle
    unreachable: Vec<u32>,
}

impl PlanSummary {
    fn from_plan(plan: &ExecutionPlan) -> Self {
        let spec = plan.to_spec();
        Self {
            steps: spec
                .steps
                .into_iter()
                .map(|s| StepSummary {
                    step_number: s.step_number,
                    description: s.description,
                    tool_name: s.tool_name,
                    depends_on: s.depends_on,
                })
                .collect(),
            waves: plan.waves(),
            unreachable: plan.blocked_steps().iter().map(|s| s.step_number).collect(),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let tool = step.tool_name.as_deref().unwrap_or("(model)");
            out.push_str(&format!("{:>3}. [{}] {}", step.step_number, tool, step.description));
            if !step.depends_on.is_empty() {
                let deps: Vec<String> = step.depends_on.iter().map(u32::to_string).collect();
                out.push_str(&format!("  <- {}", deps.join(", ")));
            }
            out.push('\n');
        }
        out.push_str("\nWaves:\n");
        for (i, wave) in self.waves.iter().enumerate() {
            let numbers: Vec<String> = wave.iter().map(u32::to_string).collect();
            out.push_str(&format!("  {}: {}\n", i + 1, numbers.join(", ")));
        }
        if !self.unreachable.is_empty() {
            let numbers: Vec<String> = self.unreachable.iter().map(u32::to_string).collect();
            out.push_str(&format!("\nUnreachable (dependency cycle): {}\n", numbers.join(", ")));
        }
        out
    }
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
}

fn plan_command(input: &str, goal: &str, json: bool) -> anyhow::Result<()> {
    let response = read_input(input)?;
    let spec = parse_plan(&response).context("Response does not contain a usable plan")?;
    let plan = ExecutionPlan::from_spec(goal, spec, 0);
    tracing::info!(steps = plan.steps().len(), "Plan parsed");

    let summary = PlanSummary::from_plan(&plan);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

fn config_command(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_yaml_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    tracing::info!(path = %path.display(), "Configuration valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Plan { input, goal } => plan_command(input, goal, cli.json),
        Commands::Config { path } => config_command(path),
    }
}
