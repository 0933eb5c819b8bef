//! Execution plan model.
//!
//! An [`ExecutionPlan`] is one revision of the work needed for a goal. Steps
//! are kept in declared order; execution order is driven purely by
//! `depends_on`. Step state only moves forward:
//!
//! ```text
//! pending -> running -> completed
//!                    \-> failed
//! ```
//!
//! A replan never mutates an existing plan; it builds a new one with the next
//! revision number.

mod parser;
mod wire;

pub use parser::{extract_json_object, parse_plan, validate_plan_schema, PlanParseError};
pub use wire::{PlanSpec, StepSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque step identifier, unique within a plan and meaningless across
/// revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors from illegal plan state changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanStateError {
    #[error("Step {step_number} cannot move from {from} to {to}")]
    InvalidTransition {
        step_number: u32,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Step {step_number} has unfinished dependencies")]
    DependenciesNotMet { step_number: u32 },

    #[error("Unknown step id {0}")]
    UnknownStep(StepId),
}

/// A single unit of work within a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Identifier assigned when the plan was built
    pub id: StepId,

    /// Author-facing 1-based ordinal, used for prompts and dependency resolution
    pub step_number: u32,

    /// What the step is meant to accomplish
    pub description: String,

    /// Tool to invoke; `None` means the step is delegated to the model
    pub tool_name: Option<String>,

    /// Arguments passed to the tool
    pub tool_arguments: Map<String, Value>,

    depends_on: BTreeSet<StepId>,
    status: StepStatus,
    result: Option<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn depends_on(&self) -> &BTreeSet<StepId> {
        &self.depends_on
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_tool_step(&self) -> bool {
        self.tool_name.is_some()
    }

    /// Short label for logs and error messages, e.g. `step 2 (tool search)`.
    pub fn label(&self) -> String {
        match &self.tool_name {
            Some(tool) => format!("step {} (tool {})", self.step_number, tool),
            None => format!("step {}", self.step_number),
        }
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), PlanStateError> {
        let allowed = matches!(
            (self.status, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        );
        if !allowed {
            return Err(PlanStateError::InvalidTransition {
                step_number: self.step_number,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One revision of a plan for a goal.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    goal: String,
    steps: Vec<PlanStep>,
    revision: u32,
}

impl ExecutionPlan {
    /// Build a plan from its wire form.
    ///
    /// Step numbers are resolved to ids here. A dependency on an unknown step
    /// number or on the step itself is dropped. When two steps share a number,
    /// references resolve to the first one declared.
    pub fn from_spec(goal: impl Into<String>, spec: PlanSpec, revision: u32) -> Self {
        let ids: Vec<StepId> = spec.steps.iter().map(|_| StepId::new()).collect();

        let mut by_number: HashMap<u32, StepId> = HashMap::new();
        for (step, id) in spec.steps.iter().zip(&ids) {
            by_number.entry(step.step_number).or_insert(*id);
        }

        let steps = spec
            .steps
            .into_iter()
            .zip(ids)
            .map(|(step, id)| {
                let mut depends_on = BTreeSet::new();
                for number in &step.depends_on {
                    match by_number.get(number) {
                        Some(dep) if *dep != id => {
                            depends_on.insert(*dep);
                        }
                        Some(_) => {
                            tracing::debug!(step = step.step_number, "dropping self dependency");
                        }
                        None => {
                            tracing::debug!(
                                step = step.step_number,
                                depends_on = number,
                                "dropping dangling dependency"
                            );
                        }
                    }
                }

                let tool_name = step
                    .tool_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty());

                PlanStep {
                    id,
                    step_number: step.step_number,
                    description: step.description,
                    tool_name,
                    tool_arguments: step.tool_arguments,
                    depends_on,
                    status: StepStatus::Pending,
                    result: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                }
            })
            .collect();

        Self {
            goal: goal.into(),
            steps,
            revision,
        }
    }

    /// Single model step that answers the goal directly.
    pub fn direct_answer(goal: impl Into<String>, revision: u32) -> Self {
        let goal = goal.into();
        let spec = PlanSpec::new(vec![StepSpec::new(1, goal.clone())]);
        Self::from_spec(goal, spec, revision)
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn step(&self, id: StepId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_by_number(&self, step_number: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    fn step_mut(&mut self, id: StepId) -> Result<&mut PlanStep, PlanStateError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(PlanStateError::UnknownStep(id))
    }

    fn status_of(&self, id: StepId) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    fn is_eligible(&self, step: &PlanStep) -> bool {
        step.status == StepStatus::Pending
            && step
                .depends_on
                .iter()
                .all(|dep| self.status_of(*dep) == Some(StepStatus::Completed))
    }

    /// Pending steps whose dependencies are all completed, in declared order.
    pub fn eligible_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| self.is_eligible(s))
            .map(|s| s.id)
            .collect()
    }

    /// Move a step to `running`. Refused unless every dependency completed.
    pub fn start_step(&mut self, id: StepId) -> Result<(), PlanStateError> {
        let step = self.step(id).ok_or(PlanStateError::UnknownStep(id))?;
        if step.status == StepStatus::Pending && !self.is_eligible(step) {
            return Err(PlanStateError::DependenciesNotMet {
                step_number: step.step_number,
            });
        }

        let step = self.step_mut(id)?;
        step.transition(StepStatus::Running)?;
        step.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a step's result. Only valid once, from `running`.
    pub fn complete_step(&mut self, id: StepId, result: impl Into<String>) -> Result<(), PlanStateError> {
        let step = self.step_mut(id)?;
        step.transition(StepStatus::Completed)?;
        step.result = Some(result.into());
        step.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Record a step's error. Only valid once, from `running`.
    pub fn fail_step(&mut self, id: StepId, error: impl Into<String>) -> Result<(), PlanStateError> {
        let step = self.step_mut(id)?;
        step.transition(StepStatus::Failed)?;
        step.error = Some(error.into());
        step.finished_at = Some(Utc::now());
        Ok(())
    }

    /// True when no step is running.
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status != StepStatus::Running)
    }

    /// True when nothing is running and nothing more can start.
    pub fn is_finished(&self) -> bool {
        self.is_settled() && self.eligible_steps().is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn completed_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }

    /// Pending steps that can never become eligible in this revision, either
    /// because a dependency failed or because they sit on a dependency cycle.
    pub fn blocked_steps(&self) -> Vec<&PlanStep> {
        let mut viable: HashSet<StepId> = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Running))
            .map(|s| s.id)
            .collect();

        loop {
            let newly: Vec<StepId> = self
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending && !viable.contains(&s.id))
                .filter(|s| s.depends_on.iter().all(|d| viable.contains(d)))
                .map(|s| s.id)
                .collect();
            if newly.is_empty() {
                break;
            }
            viable.extend(newly);
        }

        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && !viable.contains(&s.id))
            .collect()
    }

    /// Group step numbers into waves that could run together if every step
    /// succeeds. Steps on a dependency cycle appear in no wave.
    pub fn waves(&self) -> Vec<Vec<u32>> {
        let mut placed: HashSet<StepId> = HashSet::new();
        let mut waves = Vec::new();

        loop {
            let wave: Vec<&PlanStep> = self
                .steps
                .iter()
                .filter(|s| !placed.contains(&s.id))
                .filter(|s| s.depends_on.iter().all(|d| placed.contains(d)))
                .collect();
            if wave.is_empty() {
                break;
            }
            placed.extend(wave.iter().map(|s| s.id));
            waves.push(wave.iter().map(|s| s.step_number).collect());
        }

        waves
    }

    /// The plan in wire form, with dependencies mapped back to step numbers.
    pub fn to_spec(&self) -> PlanSpec {
        let numbers: HashMap<StepId, u32> =
            self.steps.iter().map(|s| (s.id, s.step_number)).collect();

        PlanSpec::new(
            self.steps
                .iter()
                .map(|s| StepSpec {
                    step_number: s.step_number,
                    description: s.description.clone(),
                    tool_name: s.tool_name.clone(),
                    tool_arguments: s.tool_arguments.clone(),
                    depends_on: s.depends_on.iter().filter_map(|d| numbers.get(d).copied()).collect(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chain_plan() -> ExecutionPlan {
        ExecutionPlan::from_spec(
            "chain",
            PlanSpec::new(vec![
                StepSpec::new(1, "first"),
                StepSpec::new(2, "second").depends_on([1]),
                StepSpec::new(3, "third").depends_on([2]),
            ]),
            0,
        )
    }

    fn id_of(plan: &ExecutionPlan, number: u32) -> StepId {
        plan.step_by_number(number).unwrap().id
    }

    #[test]
    fn test_dependencies_resolve_to_ids() {
        let plan = chain_plan();
        let first = id_of(&plan, 1);
        let second = plan.step_by_number(2).unwrap();

        assert_eq!(second.depends_on().iter().copied().collect::<Vec<_>>(), vec![first]);
        assert_eq!(plan.revision(), 0);
        assert_eq!(plan.goal(), "chain");
    }

    #[test]
    fn test_dangling_and_self_dependencies_dropped() {
        let plan = ExecutionPlan::from_spec(
            "g",
            PlanSpec::new(vec![StepSpec::new(1, "a").depends_on([1, 7, 42])]),
            0,
        );
        assert!(plan.steps()[0].depends_on().is_empty());
        assert_eq!(plan.eligible_steps().len(), 1);
    }

    #[test]
    fn test_duplicate_numbers_resolve_to_first() {
        let plan = ExecutionPlan::from_spec(
            "g",
            PlanSpec::new(vec![
                StepSpec::new(1, "a"),
                StepSpec::new(1, "b"),
                StepSpec::new(2, "c").depends_on([1]),
            ]),
            0,
        );
        let first = plan.steps()[0].id;
        assert_eq!(plan.steps()[2].depends_on().iter().next(), Some(&first));
    }

    #[test]
    fn test_blank_tool_name_means_model_step() {
        let spec = PlanSpec::new(vec![StepSpec::new(1, "a").with_tool("  ", Map::new())]);
        let plan = ExecutionPlan::from_spec("g", spec, 0);
        assert!(!plan.steps()[0].is_tool_step());
    }

    #[test]
    fn test_only_roots_are_eligible_initially() {
        let plan = chain_plan();
        assert_eq!(plan.eligible_steps(), vec![id_of(&plan, 1)]);
    }

    #[test]
    fn test_start_refused_before_dependencies_complete() {
        let mut plan = chain_plan();
        let second = id_of(&plan, 2);

        assert_eq!(
            plan.start_step(second),
            Err(PlanStateError::DependenciesNotMet { step_number: 2 })
        );
        assert_eq!(plan.step(second).unwrap().status(), StepStatus::Pending);
    }

    #[test]
    fn test_lifecycle_and_terminal_states() {
        let mut plan = chain_plan();
        let first = id_of(&plan, 1);

        plan.start_step(first).unwrap();
        assert!(!plan.is_settled());
        plan.complete_step(first, "done").unwrap();

        let step = plan.step(first).unwrap();
        assert_eq!(step.status(), StepStatus::Completed);
        assert_eq!(step.result(), Some("done"));
        assert!(step.started_at().is_some() && step.finished_at().is_some());

        // Terminal states are never revisited.
        assert!(matches!(
            plan.fail_step(first, "late"),
            Err(PlanStateError::InvalidTransition { .. })
        ));
        assert!(plan.start_step(first).is_err());
        assert_eq!(plan.step(first).unwrap().error(), None);

        assert_eq!(plan.eligible_steps(), vec![id_of(&plan, 2)]);
    }

    #[test]
    fn test_complete_requires_running() {
        let mut plan = chain_plan();
        let first = id_of(&plan, 1);
        assert!(plan.complete_step(first, "x").is_err());
        assert_eq!(plan.step(first).unwrap().result(), None);
    }

    #[test]
    fn test_failure_blocks_dependents() {
        let mut plan = chain_plan();
        let first = id_of(&plan, 1);
        plan.start_step(first).unwrap();
        plan.fail_step(first, "boom").unwrap();

        assert!(plan.has_failures());
        assert!(plan.is_finished());
        let blocked: Vec<u32> = plan.blocked_steps().iter().map(|s| s.step_number).collect();
        assert_eq!(blocked, vec![2, 3]);
    }

    #[test]
    fn test_cycle_is_blocked_and_has_no_wave() {
        let plan = ExecutionPlan::from_spec(
            "g",
            PlanSpec::new(vec![
                StepSpec::new(1, "a"),
                StepSpec::new(2, "b").depends_on([3]),
                StepSpec::new(3, "c").depends_on([2]),
            ]),
            0,
        );
        assert_eq!(plan.waves(), vec![vec![1]]);
        let blocked: Vec<u32> = plan.blocked_steps().iter().map(|s| s.step_number).collect();
        assert_eq!(blocked, vec![2, 3]);
    }

    #[test]
    fn test_waves_group_independent_steps() {
        let plan = ExecutionPlan::from_spec(
            "g",
            PlanSpec::new(vec![
                StepSpec::new(1, "a"),
                StepSpec::new(2, "b"),
                StepSpec::new(3, "c").depends_on([1, 2]),
            ]),
            0,
        );
        assert_eq!(plan.waves(), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_direct_answer_plan() {
        let plan = ExecutionPlan::direct_answer("What is 2+2?", 3);
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].description, "What is 2+2?");
        assert!(!plan.steps()[0].is_tool_step());
        assert_eq!(plan.revision(), 3);
    }

    #[test]
    fn test_to_spec_round_trips_numbers() {
        let plan = chain_plan();
        let spec = plan.to_spec();
        assert_eq!(spec.steps[2].depends_on, vec![2]);
    }

    proptest! {
        #[test]
        fn prop_dependencies_always_resolve_within_plan(
            deps in proptest::collection::vec(proptest::collection::vec(0u32..12, 0..5), 1..8),
        ) {
            let spec = PlanSpec::new(
                deps.iter()
                    .enumerate()
                    .map(|(i, d)| StepSpec::new(i as u32 + 1, format!("s{}", i)).depends_on(d.clone()))
                    .collect(),
            );
            let plan = ExecutionPlan::from_spec("g", spec, 0);
            let ids: HashSet<StepId> = plan.steps().iter().map(|s| s.id).collect();

            prop_assert_eq!(ids.len(), plan.steps().len());
            for step in plan.steps() {
                prop_assert!(!step.depends_on().contains(&step.id));
                for dep in step.depends_on() {
                    prop_assert!(ids.contains(dep));
                }
            }
        }

        #[test]
        fn prop_never_running_before_dependencies_complete(
            deps in proptest::collection::vec(proptest::collection::vec(1u32..8, 0..4), 1..8),
            failures in proptest::collection::vec(any::<bool>(), 8),
        ) {
            let spec = PlanSpec::new(
                deps.iter()
                    .enumerate()
                    .map(|(i, d)| StepSpec::new(i as u32 + 1, format!("s{}", i)).depends_on(d.clone()))
                    .collect(),
            );
            let mut plan = ExecutionPlan::from_spec("g", spec, 0);

            loop {
                let eligible = plan.eligible_steps();
                if eligible.is_empty() {
                    break;
                }
                for id in eligible {
                    let step = plan.step(id).unwrap();
                    for dep in step.depends_on() {
                        prop_assert_eq!(plan.step(*dep).unwrap().status(), StepStatus::Completed);
                    }
                    let fail = failures[(step.step_number as usize - 1) % failures.len()];
                    plan.start_step(id).unwrap();
                    if fail {
                        plan.fail_step(id, "x").unwrap();
                    } else {
                        plan.complete_step(id, "ok").unwrap();
                    }
                }
            }

            prop_assert!(plan.is_finished());
            for step in plan.steps() {
                if step.status() == StepStatus::Pending {
                    prop_assert!(plan.blocked_steps().iter().any(|b| b.id == step.id));
                }
            }
        }
    }
}
