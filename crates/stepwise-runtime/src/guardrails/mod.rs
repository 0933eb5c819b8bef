//! Guardrails: pluggable checks around model and tool calls.
//!
//! A guardrail inspects a payload and either passes it or trips a tripwire.
//! Guardrails never repair a payload; a tripwire rejects it and aborts the
//! run that produced it.
//!
//! Payloads:
//! - [`InputPayload`]: the goal before planning
//! - [`OutputPayload`]: model output (step results and the final answer)
//! - [`ToolPayload`]: a tool call, before (`output: None`) and after execution

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

mod builtin;
mod runner;

pub use builtin::{
    MaxLengthGuardrail, PatternGuardrail, ToolAllowlistGuardrail, ToolArgumentSchemaGuardrail,
};
pub use runner::GuardrailRunner;

/// Verdict of one guardrail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardrailResult {
    pub tripwire_triggered: bool,

    /// Free-form diagnostic data
    pub output_info: Value,

    /// Reason shown when the tripwire fires
    pub message: Option<String>,

    pub metadata: BTreeMap<String, String>,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn trip(message: impl Into<String>) -> Self {
        Self {
            tripwire_triggered: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.output_info = info;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Where a payload comes from, passed to every check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardrailContext {
    pub goal: Option<String>,
    pub revision: Option<u32>,
    pub step_number: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl GuardrailContext {
    pub fn for_goal(goal: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            ..Self::default()
        }
    }

    pub fn at_revision(mut self, revision: u32) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn at_step(mut self, step_number: u32) -> Self {
        self.step_number = Some(step_number);
        self
    }
}

/// Text entering the system.
#[derive(Debug, Clone, PartialEq)]
pub struct InputPayload {
    pub text: String,
}

/// Text produced by a model.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPayload {
    pub text: String,
    /// `"synthesis"` or `"step <n>"`
    pub producer: String,
}

/// A tool call, with its output once it has run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPayload {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub output: Option<String>,
}

impl ToolPayload {
    /// Pre-call payload.
    pub fn call(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            output: None,
        }
    }

    /// Post-call payload.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// A check over payloads of type `P`.
#[async_trait]
pub trait Guardrail<P: Sync>: Send + Sync {
    fn name(&self) -> &str;

    /// Return `Err` only when the check itself could not run.
    async fn check(&self, payload: &P, context: &GuardrailContext) -> anyhow::Result<GuardrailResult>;
}

pub type InputGuardrail = Arc<dyn Guardrail<InputPayload>>;
pub type OutputGuardrail = Arc<dyn Guardrail<OutputPayload>>;
pub type ToolGuardrail = Arc<dyn Guardrail<ToolPayload>>;

/// Guardrails registered with an engine, by payload kind.
#[derive(Clone, Default)]
pub struct GuardrailSet {
    pub input: Vec<InputGuardrail>,
    pub output: Vec<OutputGuardrail>,
    pub tool: Vec<ToolGuardrail>,
}

impl GuardrailSet {
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.tool.is_empty()
    }
}

impl std::fmt::Debug for GuardrailSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |list: Vec<&str>| list.join(", ");
        f.debug_struct("GuardrailSet")
            .field("input", &names(self.input.iter().map(|g| g.name()).collect()))
            .field("output", &names(self.output.iter().map(|g| g.name()).collect()))
            .field("tool", &names(self.tool.iter().map(|g| g.name()).collect()))
            .finish()
    }
}

/// Rejection by the guardrail runner.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardrailError {
    #[error("Guardrail '{guardrail}' tripped: {message}")]
    Tripwire {
        guardrail: String,
        message: String,
        metadata: BTreeMap<String, String>,
    },

    #[error("Guardrail '{guardrail}' failed to run: {message}")]
    ExecutionFailed { guardrail: String, message: String },
}

impl GuardrailError {
    /// Name of the guardrail that decided the outcome.
    pub fn guardrail(&self) -> &str {
        match self {
            Self::Tripwire { guardrail, .. } | Self::ExecutionFailed { guardrail, .. } => guardrail,
        }
    }

    pub fn is_tripwire(&self) -> bool {
        matches!(self, Self::Tripwire { .. })
    }
}
