//! Plan execution engine.
//!
//! A run moves through revisions. Each revision is planned, then executed:
//! eligible steps are dispatched concurrently and their outcomes written back
//! by the run loop, which is the only owner of the plan. A revision with
//! failed or blocked steps triggers a replan until the revision budget runs
//! out. Completed results of every revision feed the final synthesis.
//!
//! ```text
//! input guardrails → plan → execute ─┬─ all resolved ──────────┐
//!                     ▲              └─ failures → replan ─┐   │
//!                     └────────────────────────────────────┘   ▼
//!                                    synthesis → output guardrails
//! ```

mod planner;
mod report;
mod step_runner;
mod synthesis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use stepwise_core::{ExecutionPlan, PlanStateError, StepId, StepStatus};

use crate::config::{ConfigError, EngineConfig};
use crate::events::{EngineEvent, EngineObserver};
use crate::guardrails::{
    GuardrailContext, GuardrailError, GuardrailRunner, GuardrailSet, InputGuardrail, OutputGuardrail,
    ToolGuardrail,
};
use crate::providers::{ModelError, ModelService, ToolRegistry, ToolService};
use crate::resilience::{CircuitState, FallbackError};

use report::RunHistory;
use step_runner::{BreakerRegistry, StepError, StepJob, StepRunner};

pub use planner::PlanSource;
pub use report::{FailedStep, RunReport, StepOutcome};

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Guardrail blocked the run: {0}")]
    Guardrail(#[from] GuardrailError),

    #[error("No usable plan: {0}")]
    Planning(FallbackError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Run cancelled with {} completed steps", .completed_steps.len())]
    Cancelled { completed_steps: Vec<StepOutcome> },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Plan state error: {0}")]
    PlanState(#[from] PlanStateError),

    #[error("Engine not configured: {0}")]
    NotConfigured(String),
}

impl EngineError {
    pub(crate) fn cancelled() -> Self {
        Self::Cancelled {
            completed_steps: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    fn with_progress(self, history: &RunHistory, current: Option<&ExecutionPlan>) -> Self {
        match self {
            Self::Cancelled { .. } => Self::Cancelled {
                completed_steps: history.completed_with(current),
            },
            other => other,
        }
    }
}

/// Race `future` against cancellation.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::cancelled()),
        value = future => Ok(value),
    }
}

type StepReport = (StepId, Duration, Result<String, StepError>);

/// Plans, executes, replans and synthesizes.
///
/// # Architecture
/// - Planning: model response → `parse_plan`, with reprompt and direct-answer fallbacks
/// - Execution: `JoinSet` fan-out bounded by an optional semaphore
/// - Resilience: per-tool circuit breakers shared across runs, optional retries
/// - Guardrails: input before planning, tool around each call, output on model text
pub struct PlanEngine {
    runner: Arc<StepRunner>,
    config: EngineConfig,
    observers: Vec<Arc<dyn EngineObserver>>,
}

impl PlanEngine {
    pub fn builder() -> PlanEngineBuilder {
        PlanEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State of the breaker for `tool`, if one has been created.
    pub fn circuit_state(&self, tool: &str) -> Option<CircuitState> {
        self.runner.breakers.state(tool)
    }

    fn emit(&self, event: EngineEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    /// Run `goal` to completion and return the final answer.
    pub async fn run(&self, goal: &str) -> Result<String, EngineError> {
        Ok(self.run_with_report(goal).await?.answer)
    }

    pub async fn run_with_report(&self, goal: &str) -> Result<RunReport, EngineError> {
        self.run_cancellable(goal, CancellationToken::new()).await
    }

    /// Run `goal` until done or until `cancel` fires.
    ///
    /// On cancellation in-flight steps are aborted and the error carries the
    /// steps that had already completed.
    pub async fn run_cancellable(&self, goal: &str, cancel: CancellationToken) -> Result<RunReport, EngineError> {
        let context = GuardrailContext::for_goal(goal);
        let goal = cancellable(
            &cancel,
            GuardrailRunner::run_input(&self.runner.guardrails.input, goal, &context),
        )
        .await??;

        let mut history = RunHistory::default();
        let mut plan = self.initial_plan(&goal, &cancel).await?;
        let mut budget_exhausted = false;
        let mut replan_abandoned = false;

        loop {
            let revision = plan.revision();
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled().with_progress(&history, Some(&plan)));
            }

            if let Err(e) = self.execute_revision(&goal, &mut plan, &history, &cancel).await {
                return Err(e.with_progress(&history, Some(&plan)));
            }

            let unresolved = report::unresolved_steps(&plan);
            let completed = plan.completed_steps().count();
            history.archive(plan);

            if unresolved.is_empty() {
                tracing::info!(revision, completed, "Revision succeeded");
                break;
            }
            if revision >= self.config.planning.max_revisions {
                tracing::warn!(
                    revision,
                    unresolved = unresolved.len(),
                    "Revision budget exhausted, synthesizing from completed steps"
                );
                budget_exhausted = true;
                break;
            }

            tracing::info!(revision, unresolved = unresolved.len(), completed, "Replanning");
            self.emit(EngineEvent::ReplanTriggered {
                revision,
                failed_steps: unresolved.len(),
                completed_steps: completed,
            });

            let next = self
                .replan(&goal, &history, revision + 1, &cancel)
                .await
                .map_err(|e| e.with_progress(&history, None))?;
            match next {
                Some(next) => plan = next,
                None => {
                    replan_abandoned = true;
                    break;
                }
            }
        }

        let completed_steps = history.completed();
        let answer = self
            .synthesize(&goal, &completed_steps, &cancel)
            .await
            .map_err(|e| e.with_progress(&history, None))?;

        let plans = history.into_plans();
        let revisions = plans.len() as u32;
        let context = GuardrailContext::for_goal(goal.as_str()).at_revision(revisions.saturating_sub(1));
        let answer = GuardrailRunner::run_output(&self.runner.guardrails.output, answer, "synthesis", &context).await?;

        tracing::info!(revisions, completed = completed_steps.len(), budget_exhausted, "Run finished");
        Ok(RunReport {
            answer,
            plans,
            revisions,
            budget_exhausted,
            replan_abandoned,
            completed_steps,
        })
    }

    /// Execute one revision until no step is eligible and none is running.
    async fn execute_revision(
        &self,
        goal: &str,
        plan: &mut ExecutionPlan,
        history: &RunHistory,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let revision = plan.revision();
        let earlier = history.completed();
        let semaphore = self
            .config
            .execution
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))));
        let mut tasks: JoinSet<StepReport> = JoinSet::new();

        loop {
            for id in plan.eligible_steps() {
                let permit = match &semaphore {
                    Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                plan.start_step(id)?;
                let step = plan.step(id).cloned().ok_or(PlanStateError::UnknownStep(id))?;
                let mut dependencies = earlier.clone();
                dependencies.extend(
                    step.depends_on()
                        .iter()
                        .filter_map(|dep| plan.step(*dep))
                        .filter_map(|dep| StepOutcome::from_step(revision, dep)),
                );

                tracing::debug!(revision, step = %step.label(), "Step started");
                self.emit(EngineEvent::StepStarted {
                    revision,
                    step_id: id,
                    step_number: step.step_number,
                    tool_name: step.tool_name.clone(),
                });

                let job = StepJob {
                    goal: goal.to_string(),
                    context: GuardrailContext::for_goal(goal)
                        .at_revision(revision)
                        .at_step(step.step_number),
                    step,
                    dependencies,
                };
                let runner = Arc::clone(&self.runner);
                let token = cancel.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let result = runner.run(&job, &token).await;
                    (job.step.id, started.elapsed(), result)
                });
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    tracing::info!(revision, running = tasks.len(), "Cancelled, aborting running steps");
                    return Err(EngineError::cancelled());
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok((id, elapsed, result))) => self.record_outcome(plan, id, elapsed, result)?,
                Some(Err(e)) => tracing::error!(revision, error = %e, "Step task ended abnormally"),
                None => break,
            }
        }

        let orphaned: Vec<StepId> = plan
            .steps()
            .iter()
            .filter(|step| step.status() == StepStatus::Running)
            .map(|step| step.id)
            .collect();
        for id in orphaned {
            self.record_outcome(plan, id, Duration::ZERO, Err(StepError::Lost))?;
        }

        Ok(())
    }

    fn record_outcome(
        &self,
        plan: &mut ExecutionPlan,
        id: StepId,
        elapsed: Duration,
        result: Result<String, StepError>,
    ) -> Result<(), EngineError> {
        let revision = plan.revision();
        let (step_number, label) = match plan.step(id) {
            Some(step) => (step.step_number, step.label()),
            None => return Err(PlanStateError::UnknownStep(id).into()),
        };

        match result {
            Ok(output) => {
                plan.complete_step(id, output)?;
                let duration_ms = elapsed.as_millis() as u64;
                tracing::info!(revision, step = %label, duration_ms, "Step completed");
                self.emit(EngineEvent::StepCompleted {
                    revision,
                    step_id: id,
                    step_number,
                    duration_ms,
                });
            }
            Err(StepError::Guardrail(e)) => {
                let error = format!("{}: {}", label, e);
                tracing::warn!(revision, step = %label, error = %e, "Step tripped guardrail");
                plan.fail_step(id, error.clone())?;
                self.emit(EngineEvent::StepFailed {
                    revision,
                    step_id: id,
                    step_number,
                    error,
                });
                return Err(EngineError::Guardrail(e));
            }
            Err(StepError::Cancelled) => return Err(EngineError::cancelled()),
            Err(e) => {
                let error = format!("{}: {}", label, e);
                tracing::warn!(revision, step = %label, error = %e, "Step failed");
                plan.fail_step(id, error.clone())?;
                self.emit(EngineEvent::StepFailed {
                    revision,
                    step_id: id,
                    step_number,
                    error,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PlanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanEngine")
            .field("model", &self.runner.model.name())
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Builder for [`PlanEngine`].
pub struct PlanEngineBuilder {
    model: Option<Arc<dyn ModelService>>,
    tools: Option<Arc<dyn ToolService>>,
    config: EngineConfig,
    guardrails: GuardrailSet,
    observers: Vec<Arc<dyn EngineObserver>>,
}

impl PlanEngineBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            tools: None,
            config: EngineConfig::default(),
            guardrails: GuardrailSet::default(),
            observers: Vec::new(),
        }
    }

    /// Set the model used for planning, model steps and synthesis.
    pub fn model(mut self, model: Arc<dyn ModelService>) -> Self {
        self.model = Some(model);
        self
    }

    /// Set the tool backend. Defaults to an empty [`ToolRegistry`].
    pub fn tools(mut self, tools: Arc<dyn ToolService>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace all guardrails.
    pub fn guardrails(mut self, guardrails: GuardrailSet) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.guardrails.input.push(guardrail);
        self
    }

    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.guardrails.output.push(guardrail);
        self
    }

    pub fn tool_guardrail(mut self, guardrail: ToolGuardrail) -> Self {
        self.guardrails.tool.push(guardrail);
        self
    }

    /// Register an observer for engine events.
    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<PlanEngine, EngineError> {
        let model = self
            .model
            .ok_or_else(|| EngineError::NotConfigured("No model service set".to_string()))?;
        self.config.validate()?;

        let tools = self
            .tools
            .unwrap_or_else(|| Arc::new(ToolRegistry::new()) as Arc<dyn ToolService>);
        let runner = StepRunner {
            model,
            tools,
            guardrails: self.guardrails,
            execution: self.config.execution.clone(),
            generation: self.config.generation.clone(),
            summary_chars: self.config.planning.result_summary_chars,
            breakers: BreakerRegistry::new(self.config.execution.circuit_breaker.clone()),
        };

        Ok(PlanEngine {
            runner: Arc::new(runner),
            config: self.config,
            observers: self.observers,
        })
    }
}

impl Default for PlanEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};

    use stepwise_core::{PlanSpec, StepSpec};

    use crate::config::{PlanFailurePolicy, SynthesisMode};
    use crate::guardrails::{MaxLengthGuardrail, PatternGuardrail, ToolAllowlistGuardrail};
    use crate::providers::{FnTool, GenerationOptions, TextStream, ToolError};
    use crate::resilience::{Backoff, CircuitBreakerConfig, RetryPolicy};

    /// Answers by prompt section: plans, reprompts, replans, steps, synthesis.
    #[derive(Default)]
    struct ScriptedModel {
        plans: Mutex<VecDeque<String>>,
        reprompts: Mutex<VecDeque<String>>,
        replans: Mutex<VecDeque<String>>,
        fragments: Vec<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn with_plan(plan: impl Into<String>) -> Self {
            let model = Self::default();
            model.plans.lock().push_back(plan.into());
            model
        }

        fn replan(self, plan: impl Into<String>) -> Self {
            self.replans.lock().push_back(plan.into());
            self
        }

        fn reprompt(self, response: impl Into<String>) -> Self {
            self.reprompts.lock().push_back(response.into());
            self
        }

        fn prompts_containing(&self, needle: &str) -> Vec<String> {
            self.prompts.lock().iter().filter(|p| p.contains(needle)).cloned().collect()
        }
    }

    #[async_trait]
    impl ModelService for ScriptedModel {
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<String, ModelError> {
            self.prompts.lock().push(prompt.to_string());

            let scripted = if prompt.contains("## Previous Response Rejected") {
                self.reprompts.lock().pop_front()
            } else if prompt.contains("## Failed Steps") {
                self.replans.lock().pop_front()
            } else if prompt.contains("## Available Tools") {
                self.plans.lock().pop_front()
            } else if prompt.contains("## Step Results") {
                Some(format!("answer from {} results", prompt.matches("### Step ").count()))
            } else {
                Some("model step result".to_string())
            };
            scripted.ok_or_else(|| ModelError::Rejected("nothing scripted".to_string()))
        }

        async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<TextStream, ModelError> {
            if self.fragments.is_empty() || !prompt.contains("## Step Results") {
                let text = self.generate(prompt, options).await?;
                return Ok(futures::stream::once(async move { Ok(text) }).boxed());
            }
            let fragments: Vec<Result<String, ModelError>> = self.fragments.iter().cloned().map(Ok).collect();
            Ok(futures::stream::iter(fragments).boxed())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn tool_step(number: u32, tool: &str) -> StepSpec {
        StepSpec::new(number, format!("run {}", tool)).with_tool(tool, Map::new())
    }

    fn plan_json(steps: Vec<StepSpec>) -> String {
        PlanSpec::new(steps).to_json()
    }

    fn constant_tool(name: &str, output: &'static str) -> Arc<FnTool> {
        Arc::new(FnTool::new(name, "test tool", move |_args: Map<String, Value>| async move {
            Ok(output.to_string())
        }))
    }

    fn counting_tool(name: &'static str, calls: Arc<AtomicUsize>, succeed_after: usize) -> Arc<FnTool> {
        Arc::new(FnTool::new(name, "test tool", move |_args: Map<String, Value>| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call > succeed_after {
                    Ok(format!("{} ok", name))
                } else {
                    Err(ToolError::failed(name, "upstream unavailable"))
                }
            }
        }))
    }

    fn sleeping_tool(name: &str, delay: Duration) -> Arc<FnTool> {
        Arc::new(FnTool::new(name, "test tool", move |_args: Map<String, Value>| async move {
            tokio::time::sleep(delay).await;
            Ok("slept".to_string())
        }))
    }

    fn recorder() -> (Arc<Mutex<Vec<EngineEvent>>>, Arc<dyn EngineObserver>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: Arc<dyn EngineObserver> = Arc::new(move |event: &EngineEvent| sink.lock().push(event.clone()));
        (events, observer)
    }

    fn plan_sources(events: &[EngineEvent]) -> Vec<PlanSource> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::PlanGenerated { source, .. } => Some(*source),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_executes_plan_and_synthesizes() {
        let plan = plan_json(vec![
            tool_step(1, "search"),
            StepSpec::new(2, "Summarize the findings").depends_on([1]),
        ]);
        let model = Arc::new(ScriptedModel::with_plan(plan));
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "rust 1.80 released"));
        let (events, observer) = recorder();

        let engine = PlanEngine::builder()
            .model(model.clone())
            .tools(Arc::new(tools))
            .observer(observer)
            .build()
            .unwrap();
        let report = engine.run_with_report("What is new in Rust?").await.unwrap();

        assert_eq!(report.answer, "answer from 2 results");
        assert_eq!(report.revisions, 1);
        assert!(!report.budget_exhausted);
        assert_eq!(report.completed_steps.len(), 2);
        assert!(report.unresolved_steps().is_empty());

        let step_prompts = model.prompts_containing("## Current Step");
        assert_eq!(step_prompts.len(), 1);
        assert!(step_prompts[0].contains("rust 1.80 released"));

        let events = events.lock();
        assert_eq!(plan_sources(&events), vec![PlanSource::Model]);
        assert!(matches!(events.last(), Some(EngineEvent::SynthesisCompleted { .. })));
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::ReplanTriggered { .. })));
    }

    #[tokio::test]
    async fn test_unparseable_plan_falls_back_to_direct_answer() {
        let model = Arc::new(ScriptedModel::with_plan("I would search the web.").reprompt("still prose"));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model.clone())
            .observer(observer)
            .build()
            .unwrap();

        let report = engine.run_with_report("Explain ownership").await.unwrap();

        assert_eq!(plan_sources(&events.lock()), vec![PlanSource::DirectAnswer]);
        let plan = report.final_plan().unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert!(!plan.steps()[0].is_tool_step());
        assert_eq!(report.answer, "answer from 1 results");
        assert_eq!(model.prompts_containing("## Previous Response Rejected").len(), 1);
    }

    #[tokio::test]
    async fn test_reprompt_recovers_plan() {
        let plan = plan_json(vec![tool_step(1, "search")]);
        let model = Arc::new(ScriptedModel::with_plan("Sure! Here is my plan.").reprompt(plan));
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "found"));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .observer(observer)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert_eq!(plan_sources(&events.lock()), vec![PlanSource::Reprompt]);
        assert_eq!(report.completed_steps[0].result, "found");
    }

    #[tokio::test]
    async fn test_abort_policy_fails_without_plan() {
        let mut config = EngineConfig::default();
        config.planning.failure_policy = PlanFailurePolicy::Abort;
        config.planning.reprompt_on_parse_failure = false;
        let model = Arc::new(ScriptedModel::with_plan("no json here"));
        let engine = PlanEngine::builder().model(model).config(config).build().unwrap();

        match engine.run("goal").await {
            Err(EngineError::Planning(e)) => {
                assert_eq!(e.failures.len(), 1);
                assert_eq!(e.failures[0].step_name, "parse_response");
                assert!(e.failures[0].message.contains("No JSON object"));
            }
            other => panic!("Expected planning error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_still_synthesizes() {
        let mut config = EngineConfig::default();
        config.planning.max_revisions = 1;
        let failing = plan_json(vec![tool_step(1, "flaky")]);
        let model = Arc::new(ScriptedModel::with_plan(failing.clone()).replan(failing));
        let calls = Arc::new(AtomicUsize::new(0));
        let tools = ToolRegistry::new().with_tool(counting_tool("flaky", calls.clone(), usize::MAX));
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .config(config)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert!(report.budget_exhausted);
        assert_eq!(report.revisions, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.answer, "answer from 0 results");

        let unresolved = report.unresolved_steps();
        assert_eq!(unresolved.len(), 1);
        assert!(unresolved[0].error.contains("step 1 (tool flaky)"));
        assert!(unresolved[0].error.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_zero_revisions_disables_replanning() {
        let mut config = EngineConfig::default();
        config.planning.max_revisions = 0;
        let model = Arc::new(ScriptedModel::with_plan(plan_json(vec![tool_step(1, "missing")])));
        let engine = PlanEngine::builder().model(model.clone()).config(config).build().unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert!(report.budget_exhausted);
        assert_eq!(report.revisions, 1);
        assert!(model.prompts_containing("## Failed Steps").is_empty());
    }

    #[tokio::test]
    async fn test_blocked_dependents_are_unresolved() {
        let plan = plan_json(vec![
            tool_step(1, "missing"),
            StepSpec::new(2, "use it").depends_on([1]),
        ]);
        let mut config = EngineConfig::default();
        config.planning.max_revisions = 0;
        let engine = PlanEngine::builder()
            .model(Arc::new(ScriptedModel::with_plan(plan)))
            .config(config)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();
        let unresolved = report.unresolved_steps();

        assert_eq!(unresolved.len(), 2);
        assert_eq!(unresolved[1].step_number, 2);
        assert_eq!(report.final_plan().unwrap().steps()[1].status(), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_unusable_replan_moves_on_to_synthesis() {
        let plan = plan_json(vec![tool_step(1, "search"), tool_step(2, "missing")]);
        let model = Arc::new(ScriptedModel::with_plan(plan).replan("cannot help"));
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "found"));
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert!(report.replan_abandoned);
        assert!(!report.budget_exhausted);
        assert_eq!(report.revisions, 1);
        assert_eq!(report.answer, "answer from 1 results");
    }

    #[tokio::test]
    async fn test_unusable_replan_under_abort_policy_fails() {
        let mut config = EngineConfig::default();
        config.planning.failure_policy = PlanFailurePolicy::Abort;
        let plan = plan_json(vec![tool_step(1, "missing")]);
        let model = Arc::new(ScriptedModel::with_plan(plan).replan("cannot help"));
        let engine = PlanEngine::builder().model(model).config(config).build().unwrap();

        let err = engine.run("goal").await.unwrap_err();
        assert!(matches!(err, EngineError::Planning(_)));
    }

    #[tokio::test]
    async fn test_input_guardrail_blocks_before_planning() {
        let model = Arc::new(ScriptedModel::default());
        let engine = PlanEngine::builder()
            .model(model.clone())
            .input_guardrail(Arc::new(PatternGuardrail::pii()))
            .build()
            .unwrap();

        let err = engine.run("Look up SSN 123-45-6789").await.unwrap_err();

        match err {
            EngineError::Guardrail(e) => assert!(e.is_tripwire()),
            other => panic!("Expected guardrail error, got {:?}", other),
        }
        assert!(model.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tool_guardrail_aborts_run() {
        let model = Arc::new(ScriptedModel::with_plan(plan_json(vec![tool_step(1, "delete_all")])));
        let calls = Arc::new(AtomicUsize::new(0));
        let tools = ToolRegistry::new().with_tool(counting_tool("delete_all", calls.clone(), 0));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .tool_guardrail(Arc::new(ToolAllowlistGuardrail::new(["search"])))
            .observer(observer)
            .build()
            .unwrap();

        let err = engine.run("goal").await.unwrap_err();

        match err {
            EngineError::Guardrail(e) => assert_eq!(e.guardrail(), "tool_allowlist"),
            other => panic!("Expected guardrail error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let events = events.lock();
        let failed: Vec<&EngineEvent> = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::StepFailed { step_number: 1, .. }))
            .collect();
        assert_eq!(failed.len(), 1);
        match failed[0] {
            EngineEvent::StepFailed { error, .. } => assert!(error.contains("step 1 (tool delete_all)")),
            other => panic!("Expected step failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_output_guardrail_checks_synthesis() {
        let model = Arc::new(ScriptedModel::with_plan(plan_json(vec![tool_step(1, "search")])));
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "found"));
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .output_guardrail(Arc::new(MaxLengthGuardrail::new(5)))
            .build()
            .unwrap();

        let err = engine.run("goal").await.unwrap_err();

        match err {
            EngineError::Guardrail(e) => assert_eq!(e.guardrail(), "max_length"),
            other => panic!("Expected guardrail error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_retry_avoids_replan() {
        let mut config = EngineConfig::default();
        config.execution.tool_retry = Some(RetryPolicy::new(3, Backoff::Immediate));
        let model = Arc::new(ScriptedModel::with_plan(plan_json(vec![tool_step(1, "flaky")])));
        let calls = Arc::new(AtomicUsize::new(0));
        let tools = ToolRegistry::new().with_tool(counting_tool("flaky", calls.clone(), 1));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .config(config)
            .observer(observer)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.revisions, 1);
        assert_eq!(report.completed_steps[0].result, "flaky ok");
        assert!(!events.lock().iter().any(|e| matches!(e, EngineEvent::ReplanTriggered { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_serializes_steps() {
        for (limit, expected) in [(Some(1), Duration::from_secs(3)), (None, Duration::from_secs(1))] {
            let mut config = EngineConfig::default();
            config.execution.max_concurrency = limit;
            let plan = plan_json(vec![tool_step(1, "slow"), tool_step(2, "slow"), tool_step(3, "slow")]);
            let tools = ToolRegistry::new().with_tool(sleeping_tool("slow", Duration::from_secs(1)));
            let engine = PlanEngine::builder()
                .model(Arc::new(ScriptedModel::with_plan(plan)))
                .tools(Arc::new(tools))
                .config(config)
                .build()
                .unwrap();

            let start = Instant::now();
            let report = engine.run_with_report("goal").await.unwrap();

            assert_eq!(report.completed_steps.len(), 3);
            let elapsed = start.elapsed();
            assert!(elapsed >= expected, "limit {:?} took {:?}", limit, elapsed);
            assert!(elapsed < expected + Duration::from_secs(1), "limit {:?} took {:?}", limit, elapsed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_completed_steps() {
        let plan = plan_json(vec![tool_step(1, "fast"), tool_step(2, "slow").depends_on([1])]);
        let tools = ToolRegistry::new()
            .with_tool(constant_tool("fast", "quick result"))
            .with_tool(sleeping_tool("slow", Duration::from_secs(60)));
        let engine = PlanEngine::builder()
            .model(Arc::new(ScriptedModel::with_plan(plan)))
            .tools(Arc::new(tools))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        match engine.run_cancellable("goal", cancel).await {
            Err(EngineError::Cancelled { completed_steps }) => {
                assert_eq!(completed_steps.len(), 1);
                assert_eq!(completed_steps[0].result, "quick result");
            }
            other => panic!("Expected cancellation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = PlanEngine::builder()
            .model(Arc::new(ScriptedModel::default()))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.run_cancellable("goal", cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_streamed_synthesis_emits_fragments() {
        let mut config = EngineConfig::default();
        config.synthesis.mode = SynthesisMode::Streamed;
        let mut model = ScriptedModel::with_plan(plan_json(vec![tool_step(1, "search")]));
        model.fragments = vec!["Hello".into(), ", ".into(), "world".into()];
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "found"));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(Arc::new(model))
            .tools(Arc::new(tools))
            .config(config)
            .observer(observer)
            .build()
            .unwrap();

        let answer = engine.run("goal").await.unwrap();

        assert_eq!(answer, "Hello, world");
        let fragments: Vec<String> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::SynthesisFragment { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec!["Hello", ", ", "world"]);
    }

    #[tokio::test]
    async fn test_circuit_breaker_is_shared_across_revisions() {
        let mut config = EngineConfig::default();
        config.planning.max_revisions = 1;
        config.execution.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let plan = plan_json(vec![tool_step(1, "flaky")]);
        let model = Arc::new(ScriptedModel::with_plan(plan.clone()).replan(plan));
        let calls = Arc::new(AtomicUsize::new(0));
        let tools = ToolRegistry::new().with_tool(counting_tool("flaky", calls.clone(), usize::MAX));
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .config(config)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.unresolved_steps()[0].error.contains("open"));
        assert!(matches!(engine.circuit_state("flaky"), Some(CircuitState::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_step_and_replans() {
        let mut config = EngineConfig::default();
        config.execution.step_timeout = Duration::from_secs(5);
        let model = Arc::new(
            ScriptedModel::with_plan(plan_json(vec![tool_step(1, "slow")]))
                .replan(plan_json(vec![tool_step(1, "fast")])),
        );
        let tools = ToolRegistry::new()
            .with_tool(sleeping_tool("slow", Duration::from_secs(60)))
            .with_tool(constant_tool("fast", "quick result"));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model)
            .tools(Arc::new(tools))
            .config(config)
            .observer(observer)
            .build()
            .unwrap();

        let start = Instant::now();
        let report = engine.run_with_report("goal").await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(5), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(60), "took {:?}", elapsed);
        assert_eq!(report.revisions, 2);
        let timed_out = report.plans[0].step_by_number(1).unwrap();
        assert_eq!(timed_out.status(), StepStatus::Failed);
        assert!(timed_out.error().unwrap().contains("timed out"));
        assert_eq!(report.completed_steps.len(), 1);
        assert_eq!(report.completed_steps[0].result, "quick result");
        assert!(events.lock().iter().any(|e| matches!(
            e,
            EngineEvent::ReplanTriggered { revision: 0, failed_steps: 1, .. }
        )));
    }

    /// Fails every other call with a transient error, answering in between.
    struct FlakyModel {
        inner: ScriptedModel,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelService for FlakyModel {
        async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ModelError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(ModelError::Request("connection reset".to_string()));
            }
            self.inner.generate(prompt, options).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_retry_covers_planning_steps_and_synthesis() {
        let plan = plan_json(vec![StepSpec::new(1, "Think it over")]);
        let mut config = EngineConfig::default();
        config.execution.model_retry = Some(RetryPolicy::new(
            2,
            Backoff::Fixed {
                delay: Duration::from_millis(100),
            },
        ));
        let model = Arc::new(FlakyModel {
            inner: ScriptedModel::with_plan(plan.clone()),
            calls: AtomicUsize::new(0),
        });
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(model.clone())
            .config(config)
            .observer(observer)
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();

        // planning, the model step and synthesis each fail once then succeed
        assert_eq!(model.calls.load(Ordering::SeqCst), 6);
        assert_eq!(report.revisions, 1);
        assert_eq!(report.completed_steps[0].result, "model step result");
        assert_eq!(report.answer, "answer from 1 results");
        assert_eq!(plan_sources(&events.lock()), vec![PlanSource::Model]);

        let unretried = PlanEngine::builder()
            .model(Arc::new(FlakyModel {
                inner: ScriptedModel::with_plan(plan),
                calls: AtomicUsize::new(0),
            }))
            .build()
            .unwrap();
        let err = unretried.run("goal").await.unwrap_err();
        assert!(matches!(err, EngineError::Model(ModelError::Request(_))), "{:?}", err);
    }

    /// Streams one fragment of the answer and then never yields again.
    struct StallingModel {
        inner: ScriptedModel,
    }

    #[async_trait]
    impl ModelService for StallingModel {
        async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ModelError> {
            self.inner.generate(prompt, options).await
        }

        async fn stream(&self, _prompt: &str, _options: &GenerationOptions) -> Result<TextStream, ModelError> {
            let first = futures::stream::iter(vec![Ok::<_, ModelError>("Partial".to_string())]);
            Ok(first.chain(futures::stream::pending()).boxed())
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_synthesis_stream_times_out() {
        let mut config = EngineConfig::default();
        config.synthesis.mode = SynthesisMode::Streamed;
        config.generation.timeout = Duration::from_secs(5);
        let model = StallingModel {
            inner: ScriptedModel::with_plan(plan_json(vec![tool_step(1, "search")])),
        };
        let tools = ToolRegistry::new().with_tool(constant_tool("search", "found"));
        let (events, observer) = recorder();
        let engine = PlanEngine::builder()
            .model(Arc::new(model))
            .tools(Arc::new(tools))
            .config(config)
            .observer(observer)
            .build()
            .unwrap();

        let start = Instant::now();
        let err = engine.run("goal").await.unwrap_err();

        match err {
            EngineError::Model(ModelError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_secs(5)),
            other => panic!("Expected model timeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(5));
        let events = events.lock();
        assert!(events.contains(&EngineEvent::SynthesisFragment {
            text: "Partial".to_string()
        }));
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::SynthesisCompleted { .. })));
    }

    #[test]
    fn test_builder_requires_model() {
        let err = PlanEngine::builder().build().unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured(_)));
    }

    #[test]
    fn test_builder_validates_config() {
        let mut config = EngineConfig::default();
        config.execution.max_concurrency = Some(0);
        let err = PlanEngine::builder()
            .model(Arc::new(ScriptedModel::default()))
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_tool_arguments_reach_tool() {
        let mut arguments = Map::new();
        arguments.insert("query".into(), json!("rust"));
        let plan = plan_json(vec![StepSpec::new(1, "search").with_tool("search", arguments)]);
        let tool = FnTool::new("search", "Web search", |args: Map<String, Value>| async move {
            Ok(format!("results for {}", args["query"].as_str().unwrap_or_default()))
        });
        let engine = PlanEngine::builder()
            .model(Arc::new(ScriptedModel::with_plan(plan)))
            .tools(Arc::new(ToolRegistry::new().with_tool(Arc::new(tool))))
            .build()
            .unwrap();

        let report = engine.run_with_report("goal").await.unwrap();
        assert_eq!(report.completed_steps[0].result, "results for rust");
    }
}
