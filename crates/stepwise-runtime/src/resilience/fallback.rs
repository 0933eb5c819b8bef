//! Ordered fallback chains.
//!
//! A chain tries its steps in declaration order and returns the first
//! success. Conditional steps whose condition is false are skipped and do not
//! count as attempts. A terminal fallback, if configured, cannot fail.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

type Operation<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<T>> + Send + 'a>;
type Terminal<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, T> + Send + 'a>;
type Condition<'a> = Box<dyn FnOnce() -> bool + Send + 'a>;
type FailureCallback<'a> = Box<dyn FnMut(&str, &anyhow::Error) + Send + 'a>;

/// One failed attempt inside a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step_name: String,
    pub step_index: usize,
    pub message: String,
}

/// Every attempted step failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("All fallbacks exhausted in '{chain}': {}", summarize(.failures))]
pub struct FallbackError {
    pub chain: String,
    /// Attempted steps in order; skipped steps are absent.
    pub failures: Vec<StepFailure>,
}

fn summarize(failures: &[StepFailure]) -> String {
    if failures.is_empty() {
        return "no step was attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} ({})", f.step_name, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful result of a chain with the path that produced it.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub step_name: String,
    pub step_index: usize,
    /// Steps actually run, including the successful one.
    pub attempts: usize,
    pub failures: Vec<StepFailure>,
}

struct ChainStep<'a, T> {
    name: String,
    condition: Option<Condition<'a>>,
    operation: Operation<'a, T>,
}

/// Builder and executor for an ordered list of alternatives.
///
/// ```rust
/// use stepwise_runtime::resilience::FallbackChain;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let value = FallbackChain::new("greeting")
///     .attempt("remote", || async { Err(anyhow::anyhow!("unreachable")) })
///     .fallback_value("default", "hello")
///     .execute()
///     .await
///     .unwrap();
/// assert_eq!(value, "hello");
/// # });
/// ```
pub struct FallbackChain<'a, T> {
    name: String,
    steps: Vec<ChainStep<'a, T>>,
    terminal: Option<(String, Terminal<'a, T>)>,
    on_failure: Option<FailureCallback<'a>>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            terminal: None,
            on_failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a fallible step.
    pub fn attempt<F, Fut>(mut self, name: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        self.steps.push(ChainStep {
            name: name.into(),
            condition: None,
            operation: Box::new(move || operation().boxed()),
        });
        self
    }

    /// Add a fallible step that only runs when `condition` holds at execution time.
    pub fn attempt_if<C, F, Fut>(mut self, name: impl Into<String>, condition: C, operation: F) -> Self
    where
        C: FnOnce() -> bool + Send + 'a,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        self.steps.push(ChainStep {
            name: name.into(),
            condition: Some(Box::new(condition)),
            operation: Box::new(move || operation().boxed()),
        });
        self
    }

    /// Set the terminal step, run only when every other step failed or was skipped.
    pub fn fallback<F, Fut>(mut self, name: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = T> + Send + 'a,
    {
        self.terminal = Some((name.into(), Box::new(move || operation().boxed())));
        self
    }

    /// Set a constant terminal value.
    pub fn fallback_value(self, name: impl Into<String>, value: T) -> Self {
        self.fallback(name, move || async move { value })
    }

    /// Called synchronously after each attempted step fails.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str, &anyhow::Error) + Send + 'a,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Run the chain and return the first successful value.
    pub async fn execute(self) -> Result<T, FallbackError> {
        self.execute_with_result().await.map(|outcome| outcome.value)
    }

    /// Run the chain and report which step produced the value.
    pub async fn execute_with_result(self) -> Result<FallbackOutcome<T>, FallbackError> {
        let FallbackChain {
            name,
            steps,
            terminal,
            mut on_failure,
        } = self;

        if steps.is_empty() && terminal.is_none() {
            return Err(FallbackError {
                chain: name,
                failures: vec![StepFailure {
                    step_name: "<none>".to_string(),
                    step_index: 0,
                    message: "no steps configured".to_string(),
                }],
            });
        }

        let terminal_index = steps.len();
        let mut failures = Vec::new();
        let mut attempts = 0;

        for (index, step) in steps.into_iter().enumerate() {
            if let Some(condition) = step.condition {
                if !condition() {
                    tracing::debug!(chain = %name, step = %step.name, "Fallback step skipped");
                    continue;
                }
            }

            attempts += 1;
            match (step.operation)().await {
                Ok(value) => {
                    if !failures.is_empty() {
                        tracing::info!(
                            chain = %name,
                            step = %step.name,
                            failed = failures.len(),
                            "Fallback step succeeded after earlier failures"
                        );
                    }
                    return Ok(FallbackOutcome {
                        value,
                        step_name: step.name,
                        step_index: index,
                        attempts,
                        failures,
                    });
                }
                Err(error) => {
                    tracing::warn!(chain = %name, step = %step.name, error = %error, "Fallback step failed");
                    if let Some(callback) = on_failure.as_mut() {
                        callback(&step.name, &error);
                    }
                    failures.push(StepFailure {
                        step_name: step.name,
                        step_index: index,
                        message: format!("{:#}", error),
                    });
                }
            }
        }

        if let Some((step_name, operation)) = terminal {
            attempts += 1;
            let value = operation().await;
            tracing::info!(chain = %name, step = %step_name, "Using terminal fallback");
            return Ok(FallbackOutcome {
                value,
                step_name,
                step_index: terminal_index,
                attempts,
                failures,
            });
        }

        Err(FallbackError {
            chain: name,
            failures,
        })
    }
}
