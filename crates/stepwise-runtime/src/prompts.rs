//! Prompts for planning, replanning, step execution and synthesis.
//!
//! Each prompt is a fixed instruction block followed by markdown sections
//! with the dynamic content. Section headings are stable so model-side
//! behavior does not depend on wording that changes between revisions.

use std::fmt::Write;

use stepwise_core::{PlanParseError, PlanStep};

use crate::engine::{FailedStep, StepOutcome};
use crate::providers::ToolDescription;

/// Instructions for producing a plan.
pub const PLANNER_INSTRUCTIONS: &str = r#"You are a planner. Break the goal into the smallest set of concrete steps.

## Rules
1. Use a tool only if it is listed under Available Tools, with arguments it accepts
2. A step without a tool is answered by a language model from its description
3. List in dependsOn every earlier step whose result the step needs
4. Steps without dependencies run in parallel
5. Respond with JSON only, no commentary

## Output Format (JSON)
{
  "steps": [
    {
      "stepNumber": 1,
      "description": "what this step does",
      "toolName": "tool name" | null,
      "toolArguments": {},
      "dependsOn": []
    }
  ]
}
"#;

/// Instructions for producing the final answer.
pub const SYNTHESIS_INSTRUCTIONS: &str = r#"You are writing the final answer to the goal below.
Use only the step results provided. If results are missing or partial, say what
could not be determined instead of guessing."#;

const NO_TOOLS: &str = "(none: every step is answered by the model)";
const NO_RESULTS: &str = "(no step results: no step completed successfully)";

/// Shorten `text` to at most `max_chars` characters, noting what was cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}… [truncated {} chars]", kept, total - max_chars)
}

fn push_tools(prompt: &mut String, tools: &[ToolDescription]) {
    prompt.push_str("\n## Available Tools\n");
    if tools.is_empty() {
        prompt.push_str(NO_TOOLS);
        prompt.push('\n');
        return;
    }
    for tool in tools {
        let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
        if !tool.parameters.is_null() {
            let _ = writeln!(prompt, "  arguments schema: {}", tool.parameters);
        }
    }
}

fn push_outcomes(prompt: &mut String, heading: &str, outcomes: &[StepOutcome], max_chars: usize) {
    let _ = writeln!(prompt, "\n## {}", heading);
    if outcomes.is_empty() {
        prompt.push_str(NO_RESULTS);
        prompt.push('\n');
        return;
    }
    for outcome in outcomes {
        let _ = writeln!(
            prompt,
            "### Step {} (revision {}): {}",
            outcome.step_number, outcome.revision, outcome.description
        );
        if let Some(tool) = &outcome.tool_name {
            let _ = writeln!(prompt, "tool: {}", tool);
        }
        let _ = writeln!(prompt, "{}", truncate(&outcome.result, max_chars));
    }
}

/// Initial planning prompt.
pub fn planning_prompt(goal: &str, tools: &[ToolDescription]) -> String {
    let mut prompt = String::from(PLANNER_INSTRUCTIONS);
    let _ = writeln!(prompt, "\n## Goal\n{}", goal);
    push_tools(&mut prompt, tools);
    prompt
}

/// Follow-up after a response that did not contain a usable plan.
pub fn reprompt(original_prompt: &str, error: &PlanParseError) -> String {
    format!(
        "{}\n## Previous Response Rejected\n{}\nRespond again with a single JSON object in the output format and nothing else.\n",
        original_prompt, error
    )
}

/// Planning prompt after a revision with failed steps.
pub fn replan_prompt(
    goal: &str,
    tools: &[ToolDescription],
    completed: &[StepOutcome],
    failed: &[FailedStep],
    max_chars: usize,
) -> String {
    let mut prompt = String::from(PLANNER_INSTRUCTIONS);
    prompt.push_str(
        "\nThe previous plan did not fully succeed. Plan only the remaining work. \
         Completed results stay available and are not re-executed.\n",
    );
    let _ = writeln!(prompt, "\n## Goal\n{}", goal);
    push_tools(&mut prompt, tools);
    push_outcomes(&mut prompt, "Completed Steps", completed, max_chars);

    prompt.push_str("\n## Failed Steps\n");
    for step in failed {
        let _ = writeln!(
            prompt,
            "- Step {} (revision {}): {}\n  error: {}",
            step.step_number,
            step.revision,
            step.description,
            truncate(&step.error, max_chars)
        );
    }
    prompt
}

/// Prompt for a step answered by the model.
pub fn step_prompt(goal: &str, step: &PlanStep, dependencies: &[StepOutcome], max_chars: usize) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "## Goal\n{}", goal);
    if !dependencies.is_empty() {
        push_outcomes(&mut prompt, "Inputs From Earlier Steps", dependencies, max_chars);
    }
    let _ = writeln!(
        prompt,
        "\n## Current Step\nStep {}: {}\nRespond with the result of this step only.",
        step.step_number, step.description
    );
    prompt
}

/// Final synthesis prompt over every completed result.
pub fn synthesis_prompt(goal: &str, results: &[StepOutcome], max_chars: usize) -> String {
    let mut prompt = String::from(SYNTHESIS_INSTRUCTIONS);
    let _ = writeln!(prompt, "\n\n## Goal\n{}", goal);
    push_outcomes(&mut prompt, "Step Results", results, max_chars);
    prompt
}
