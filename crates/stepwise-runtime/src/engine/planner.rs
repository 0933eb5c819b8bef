//! Plan acquisition for the initial revision and for replans.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use stepwise_core::{parse_plan, ExecutionPlan};

use crate::config::PlanFailurePolicy;
use crate::events::EngineEvent;
use crate::prompts;
use crate::resilience::FallbackChain;

use super::report::RunHistory;
use super::{EngineError, PlanEngine};

const PARSE_RESPONSE: &str = "parse_response";
const REPROMPT: &str = "reprompt";
const DIRECT_ANSWER: &str = "direct_answer";

/// Which path produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    /// The first model response parsed.
    Model,
    /// The response to a JSON-only follow-up parsed.
    Reprompt,
    /// No response parsed; a single model step answers the goal.
    DirectAnswer,
}

impl PlanSource {
    fn from_chain_step(name: &str) -> Self {
        match name {
            REPROMPT => Self::Reprompt,
            DIRECT_ANSWER => Self::DirectAnswer,
            _ => Self::Model,
        }
    }
}

impl PlanEngine {
    pub(super) async fn initial_plan(
        &self,
        goal: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        let tools = self.runner.tools.describe_tools();
        let prompt = prompts::planning_prompt(goal, &tools);
        self.acquire_plan(goal, &prompt, 0, cancel).await
    }

    /// `None` when the replan produced no usable plan and the failure policy
    /// allows synthesizing from what already completed.
    pub(super) async fn replan(
        &self,
        goal: &str,
        history: &RunHistory,
        revision: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutionPlan>, EngineError> {
        let tools = self.runner.tools.describe_tools();
        let prompt = prompts::replan_prompt(
            goal,
            &tools,
            &history.completed(),
            &history.latest_failures(),
            self.config.planning.result_summary_chars,
        );

        match self.acquire_plan(goal, &prompt, revision, cancel).await {
            Ok(plan) => Ok(Some(plan)),
            Err(EngineError::Planning(e))
                if self.config.planning.failure_policy == PlanFailurePolicy::DirectAnswer =>
            {
                tracing::warn!(revision, error = %e, "Replan unusable, synthesizing from completed steps");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_plan(
        &self,
        goal: &str,
        prompt: &str,
        revision: u32,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        let response = super::cancellable(cancel, self.runner.generate(prompt)).await??;
        let parsed = parse_plan(&response);
        let rejection = parsed.as_ref().err().cloned();
        let reprompt_enabled = self.config.planning.reprompt_on_parse_failure;

        let mut chain = FallbackChain::new(format!("plan revision {}", revision))
            .attempt(PARSE_RESPONSE, move || async move {
                Ok::<_, anyhow::Error>(ExecutionPlan::from_spec(goal, parsed?, revision))
            })
            .attempt_if(
                REPROMPT,
                move || reprompt_enabled,
                move || async move {
                    let rejection =
                        rejection.ok_or_else(|| anyhow::anyhow!("previous response was accepted"))?;
                    let follow_up = prompts::reprompt(prompt, &rejection);
                    let response = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(anyhow::anyhow!("planning cancelled")),
                        result = self.runner.generate(&follow_up) => result.map_err(anyhow::Error::from),
                    }?;
                    Ok::<_, anyhow::Error>(ExecutionPlan::from_spec(goal, parse_plan(&response)?, revision))
                },
            )
            .on_failure(move |step, error| {
                tracing::warn!(revision, step = %step, error = %error, "Plan acquisition step failed");
            });

        if revision == 0 && self.config.planning.failure_policy == PlanFailurePolicy::DirectAnswer {
            chain = chain.fallback_value(DIRECT_ANSWER, ExecutionPlan::direct_answer(goal, revision));
        }

        let outcome = match chain.execute_with_result().await {
            Ok(outcome) => outcome,
            Err(_) if cancel.is_cancelled() => return Err(EngineError::cancelled()),
            Err(e) => return Err(EngineError::Planning(e)),
        };
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled());
        }

        let source = PlanSource::from_chain_step(&outcome.step_name);
        let plan = outcome.value;
        tracing::info!(
            revision,
            steps = plan.steps().len(),
            source = ?source,
            attempts = outcome.attempts,
            "Plan generated"
        );
        self.emit(EngineEvent::PlanGenerated {
            revision,
            steps: plan.steps().len(),
            source,
        });
        Ok(plan)
    }
}
