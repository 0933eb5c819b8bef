//! Concurrent guardrail evaluation with a deterministic verdict.

use std::sync::Arc;

use futures::future::join_all;

use super::{
    Guardrail, GuardrailContext, GuardrailError, InputGuardrail, InputPayload, OutputGuardrail,
    OutputPayload, ToolGuardrail, ToolPayload,
};

/// Runs guardrail lists against payloads.
///
/// All guardrails of a list are evaluated concurrently. The verdict is
/// resolved in declaration order: the first guardrail that tripped or failed
/// decides, regardless of which finished first.
pub struct GuardrailRunner;

impl GuardrailRunner {
    /// Check `payload` against every guardrail and hand it back if all pass.
    pub async fn run<P>(
        guardrails: &[Arc<dyn Guardrail<P>>],
        payload: P,
        context: &GuardrailContext,
    ) -> Result<P, GuardrailError>
    where
        P: Send + Sync,
    {
        if guardrails.is_empty() {
            return Ok(payload);
        }

        let results = join_all(guardrails.iter().map(|g| g.check(&payload, context))).await;

        for (guardrail, result) in guardrails.iter().zip(results) {
            match result {
                Ok(verdict) if verdict.tripwire_triggered => {
                    let message = verdict
                        .message
                        .unwrap_or_else(|| "tripwire triggered".to_string());
                    tracing::warn!(
                        guardrail = %guardrail.name(),
                        step = ?context.step_number,
                        message = %message,
                        "Guardrail tripwire triggered"
                    );
                    return Err(GuardrailError::Tripwire {
                        guardrail: guardrail.name().to_string(),
                        message,
                        metadata: verdict.metadata,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(guardrail = %guardrail.name(), error = %e, "Guardrail failed to run");
                    return Err(GuardrailError::ExecutionFailed {
                        guardrail: guardrail.name().to_string(),
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(payload)
    }

    /// Check text entering the system.
    pub async fn run_input(
        guardrails: &[InputGuardrail],
        text: impl Into<String>,
        context: &GuardrailContext,
    ) -> Result<String, GuardrailError> {
        let payload = InputPayload { text: text.into() };
        Self::run(guardrails, payload, context).await.map(|p| p.text)
    }

    /// Check model output attributed to `producer`.
    pub async fn run_output(
        guardrails: &[OutputGuardrail],
        text: impl Into<String>,
        producer: impl Into<String>,
        context: &GuardrailContext,
    ) -> Result<String, GuardrailError> {
        let payload = OutputPayload {
            text: text.into(),
            producer: producer.into(),
        };
        Self::run(guardrails, payload, context).await.map(|p| p.text)
    }

    /// Check a tool call before or after execution.
    pub async fn run_tool(
        guardrails: &[ToolGuardrail],
        payload: ToolPayload,
        context: &GuardrailContext,
    ) -> Result<ToolPayload, GuardrailError> {
        Self::run(guardrails, payload, context).await
    }
}
