//! Engine configuration.
//!
//! Loaded from YAML; durations are human-readable strings (`"30s"`,
//! `"250ms"`, `"2m"`). Every section has defaults, so an empty document is a
//! valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::providers::GenerationOptions;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What the engine does when no plan can be obtained from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFailurePolicy {
    /// Answer the goal with a single model step; after a failed replan,
    /// synthesize from what already completed.
    #[default]
    DirectAnswer,

    /// Fail the run.
    Abort,
}

/// How the final answer is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// One `generate` call.
    #[default]
    Buffered,

    /// `stream`, forwarding each fragment as an event.
    Streamed,
}

/// Planning and replanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Replans allowed after the initial plan; 0 disables replanning
    pub max_revisions: u32,

    pub failure_policy: PlanFailurePolicy,

    /// Ask once more for JSON-only output when a plan cannot be parsed
    pub reprompt_on_parse_failure: bool,

    /// Per-step result length shown to the model in replan and synthesis prompts
    pub result_summary_chars: usize,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_revisions: 3,
            failure_policy: PlanFailurePolicy::DirectAnswer,
            reprompt_on_parse_failure: true,
            result_summary_chars: 2000,
        }
    }
}

/// Step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Steps running at once within a revision; unbounded when absent
    pub max_concurrency: Option<usize>,

    /// Timeout for one tool call
    #[serde(with = "duration")]
    pub step_timeout: Duration,

    pub tool_retry: Option<RetryPolicy>,

    pub model_retry: Option<RetryPolicy>,

    /// One breaker per tool name when present
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            step_timeout: Duration::from_secs(120),
            tool_retry: None,
            model_retry: None,
            circuit_breaker: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub mode: SynthesisMode,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub planning: PlanningConfig,
    pub execution: ExecutionConfig,
    pub synthesis: SynthesisConfig,
    pub generation: GenerationOptions,
}

impl EngineConfig {
    /// Parse a configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Check bounds serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "execution.max_concurrency must be > 0".to_string(),
            ));
        }

        if let Some(limit) = self.execution.max_concurrency {
            if limit > Semaphore::MAX_PERMITS {
                return Err(ConfigError::Invalid(format!(
                    "execution.max_concurrency must be <= {}",
                    Semaphore::MAX_PERMITS
                )));
            }
        }

        if self.execution.step_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "execution.step_timeout must be > 0".to_string(),
            ));
        }

        if self.generation.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "generation.timeout must be > 0".to_string(),
            ));
        }

        for (field, policy) in [
            ("execution.tool_retry", &self.execution.tool_retry),
            ("execution.model_retry", &self.execution.model_retry),
        ] {
            if let Some(policy) = policy {
                if policy.max_attempts == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{}.max_attempts must be >= 1",
                        field
                    )));
                }
            }
        }

        if let Some(breaker) = &self.execution.circuit_breaker {
            if breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "execution.circuit_breaker.failure_threshold must be >= 1".to_string(),
                ));
            }
        }

        if self.planning.result_summary_chars == 0 {
            return Err(ConfigError::Invalid(
                "planning.result_summary_chars must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Serde helpers for `Duration` fields written as humantime strings.
pub(crate) mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
