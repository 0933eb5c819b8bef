//! Run results and the history of revisions inside a run.

use serde::Serialize;

use stepwise_core::{ExecutionPlan, PlanStep};

/// A completed step and its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub revision: u32,
    pub step_number: u32,
    pub description: String,
    pub tool_name: Option<String>,
    pub result: String,
}

impl StepOutcome {
    /// `None` unless the step completed.
    pub(crate) fn from_step(revision: u32, step: &PlanStep) -> Option<Self> {
        step.result().map(|result| Self {
            revision,
            step_number: step.step_number,
            description: step.description.clone(),
            tool_name: step.tool_name.clone(),
            result: result.to_string(),
        })
    }
}

/// A step that failed or could not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    pub revision: u32,
    pub step_number: u32,
    pub description: String,
    pub tool_name: Option<String>,
    pub error: String,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Final answer, after output guardrails
    pub answer: String,

    /// Every executed revision, oldest first
    pub plans: Vec<ExecutionPlan>,

    pub revisions: u32,

    /// Failures remained when the replan budget ran out
    pub budget_exhausted: bool,

    /// A replan response was unusable and the run moved on to synthesis
    pub replan_abandoned: bool,

    /// Completed steps of every revision, in revision then step order
    pub completed_steps: Vec<StepOutcome>,
}

impl RunReport {
    pub fn final_plan(&self) -> Option<&ExecutionPlan> {
        self.plans.last()
    }

    /// Failed and blocked steps of the last revision.
    pub fn unresolved_steps(&self) -> Vec<FailedStep> {
        self.final_plan().map(unresolved_steps).unwrap_or_default()
    }
}

/// Failed steps followed by pending steps that could no longer run.
pub(crate) fn unresolved_steps(plan: &ExecutionPlan) -> Vec<FailedStep> {
    let failed = plan.failed_steps().map(|step| FailedStep {
        revision: plan.revision(),
        step_number: step.step_number,
        description: step.description.clone(),
        tool_name: step.tool_name.clone(),
        error: step.error().unwrap_or_default().to_string(),
    });
    let blocked = plan.blocked_steps().into_iter().map(|step| FailedStep {
        revision: plan.revision(),
        step_number: step.step_number,
        description: step.description.clone(),
        tool_name: step.tool_name.clone(),
        error: "not run: a dependency failed or is part of a cycle".to_string(),
    });
    failed.chain(blocked).collect()
}

/// Plans executed so far in a run.
#[derive(Debug, Default)]
pub(crate) struct RunHistory {
    plans: Vec<ExecutionPlan>,
}

impl RunHistory {
    pub fn archive(&mut self, plan: ExecutionPlan) {
        self.plans.push(plan);
    }

    pub fn completed(&self) -> Vec<StepOutcome> {
        self.plans.iter().flat_map(completed_of).collect()
    }

    /// Completed steps including those of a revision still in progress.
    pub fn completed_with(&self, current: Option<&ExecutionPlan>) -> Vec<StepOutcome> {
        let mut outcomes = self.completed();
        if let Some(plan) = current {
            outcomes.extend(completed_of(plan));
        }
        outcomes
    }

    pub fn latest_failures(&self) -> Vec<FailedStep> {
        self.plans.last().map(unresolved_steps).unwrap_or_default()
    }

    pub fn into_plans(self) -> Vec<ExecutionPlan> {
        self.plans
    }
}

fn completed_of(plan: &ExecutionPlan) -> Vec<StepOutcome> {
    plan.completed_steps()
        .filter_map(|step| StepOutcome::from_step(plan.revision(), step))
        .collect()
}
