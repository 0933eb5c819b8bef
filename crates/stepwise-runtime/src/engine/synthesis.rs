//! Final answer generation.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::SynthesisMode;
use crate::events::EngineEvent;
use crate::prompts;
use crate::providers::ModelError;

use super::{cancellable, EngineError, PlanEngine, StepOutcome};

impl PlanEngine {
    pub(super) async fn synthesize(
        &self,
        goal: &str,
        results: &[StepOutcome],
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let prompt = prompts::synthesis_prompt(goal, results, self.config.planning.result_summary_chars);
        tracing::info!(results = results.len(), mode = ?self.config.synthesis.mode, "Synthesis started");
        self.emit(EngineEvent::SynthesisStarted { results: results.len() });

        let answer = match self.config.synthesis.mode {
            SynthesisMode::Buffered => cancellable(cancel, self.runner.generate(&prompt)).await??,
            SynthesisMode::Streamed => self.synthesize_streamed(&prompt, cancel).await?,
        };

        self.emit(EngineEvent::SynthesisCompleted {
            length: answer.chars().count(),
        });
        Ok(answer)
    }

    /// The generation timeout bounds opening the stream and each wait for
    /// the next fragment.
    async fn synthesize_streamed(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, EngineError> {
        let options = &self.runner.generation;
        let timeout = options.timeout;

        let opened = cancellable(cancel, tokio::time::timeout(timeout, self.runner.model.stream(prompt, options))).await?;
        let mut stream = opened.map_err(|_| ModelError::Timeout(timeout))??;

        let mut answer = String::new();
        loop {
            let next = cancellable(cancel, tokio::time::timeout(timeout, stream.next())).await?;
            match next {
                Err(_) => return Err(ModelError::Timeout(timeout).into()),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, received = answer.len(), "Synthesis stream failed");
                    return Err(e.into());
                }
                Ok(Some(Ok(fragment))) => {
                    answer.push_str(&fragment);
                    self.emit(EngineEvent::SynthesisFragment { text: fragment });
                }
            }
        }
        Ok(answer)
    }
}
