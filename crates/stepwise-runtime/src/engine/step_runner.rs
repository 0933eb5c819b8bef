//! Execution of a single step inside a spawned task.
//!
//! Tool steps: tool guardrails (pre) → retry → circuit breaker → timeout →
//! tool call → tool guardrails (post). Model steps: prompt with dependency
//! results → generate → output guardrails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use stepwise_core::PlanStep;

use crate::config::ExecutionConfig;
use crate::guardrails::{GuardrailContext, GuardrailError, GuardrailRunner, GuardrailSet, ToolPayload};
use crate::prompts;
use crate::providers::{GenerationOptions, ModelError, ModelService, ToolError, ToolService};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};

use super::StepOutcome;

/// Why a step did not produce a result.
#[derive(Error, Debug)]
pub(crate) enum StepError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Circuit for tool '{tool}' is open, retry after {retry_after:?}")]
    CircuitOpen { tool: String, retry_after: Duration },

    #[error(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error("Step cancelled")]
    Cancelled,

    #[error("Step task ended without a result")]
    Lost,
}

impl StepError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Tool(e) => e.is_retryable(),
            Self::Model(e) => e.is_transient(),
            Self::CircuitOpen { .. } | Self::Guardrail(_) | Self::Cancelled | Self::Lost => false,
        }
    }
}

/// Everything a step task needs, owned so the task can be spawned.
pub(crate) struct StepJob {
    pub goal: String,
    pub step: PlanStep,
    pub dependencies: Vec<StepOutcome>,
    pub context: GuardrailContext,
}

/// One breaker per tool name, created on first use.
pub(crate) struct BreakerRegistry {
    config: Option<CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: Option<CircuitBreakerConfig>) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when circuit breaking is disabled.
    pub fn get(&self, tool: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.config.as_ref()?;
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(tool, config.clone())));
        Some(Arc::clone(breaker))
    }

    pub fn state(&self, tool: &str) -> Option<CircuitState> {
        self.breakers.lock().get(tool).map(|b| b.state())
    }
}

/// Shared by the engine and every step task of every run.
pub(crate) struct StepRunner {
    pub model: Arc<dyn ModelService>,
    pub tools: Arc<dyn ToolService>,
    pub guardrails: GuardrailSet,
    pub execution: ExecutionConfig,
    pub generation: GenerationOptions,
    pub summary_chars: usize,
    pub breakers: BreakerRegistry,
}

impl StepRunner {
    pub async fn run(&self, job: &StepJob, cancel: &CancellationToken) -> Result<String, StepError> {
        let work = async {
            match &job.step.tool_name {
                Some(tool) => self.run_tool(tool, job).await,
                None => self.run_model(job).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = work => result,
        }
    }

    async fn run_tool(&self, tool: &str, job: &StepJob) -> Result<String, StepError> {
        let payload = ToolPayload::call(tool, job.step.tool_arguments.clone());
        let payload = GuardrailRunner::run_tool(&self.guardrails.tool, payload, &job.context).await?;

        let output = match &self.execution.tool_retry {
            Some(policy) => {
                policy
                    .execute_when(|| self.call_tool(tool, &payload.arguments), StepError::is_retryable)
                    .await?
            }
            None => self.call_tool(tool, &payload.arguments).await?,
        };

        let payload =
            GuardrailRunner::run_tool(&self.guardrails.tool, payload.with_output(output), &job.context).await?;
        Ok(payload.output.unwrap_or_default())
    }

    async fn call_tool(&self, tool: &str, arguments: &Map<String, Value>) -> Result<String, StepError> {
        let timeout = self.execution.step_timeout;
        let invoke = || async move {
            match tokio::time::timeout(timeout, self.tools.execute(tool, arguments)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    timeout,
                }),
            }
        };

        match self.breakers.get(tool) {
            Some(breaker) => breaker.execute(invoke).await.map_err(|e| match e {
                CircuitError::Open { retry_after, .. } => StepError::CircuitOpen {
                    tool: tool.to_string(),
                    retry_after,
                },
                CircuitError::Operation(e) => StepError::Tool(e),
            }),
            None => invoke().await.map_err(StepError::Tool),
        }
    }

    async fn run_model(&self, job: &StepJob) -> Result<String, StepError> {
        let prompt = prompts::step_prompt(&job.goal, &job.step, &job.dependencies, self.summary_chars);
        let output = self.generate(&prompt).await?;

        let producer = format!("step {}", job.step.step_number);
        Ok(GuardrailRunner::run_output(&self.guardrails.output, output, producer, &job.context).await?)
    }

    /// `generate` with the per-call timeout and the model retry policy.
    pub async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let options = &self.generation;
        let call = || async move {
            match tokio::time::timeout(options.timeout, self.model.generate(prompt, options)).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout(options.timeout)),
            }
        };

        match &self.execution.model_retry {
            Some(policy) => policy.execute_when(call, ModelError::is_transient).await,
            None => call().await,
        }
    }
}
