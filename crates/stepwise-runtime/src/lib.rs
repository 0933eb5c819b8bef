//! # stepwise-runtime
//!
//! Resilient multi-step execution for Stepwise.
//!
//! This crate turns a goal into an answer by asking a model for a plan,
//! running the plan's steps against tools and the model, replanning around
//! failures and synthesizing the completed results.
//!
//! - [`resilience`]: `RetryPolicy`, `CircuitBreaker`, `FallbackChain`
//! - [`guardrails`]: input, output and tool checks with tripwire semantics
//! - [`engine`]: the plan execution engine
//! - [`providers`]: the model and tool seams the engine calls through
//!
//! Plan parsing and the step state machine live in `stepwise-core`, which
//! never performs I/O.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepwise_runtime::{EngineConfig, PlanEngine, ToolRegistry};
//!
//! let engine = PlanEngine::builder()
//!     .model(Arc::new(my_model))
//!     .tools(Arc::new(ToolRegistry::new().with_tool(Arc::new(search))))
//!     .config(EngineConfig::from_yaml_file("stepwise.yaml")?)
//!     .build()?;
//!
//! let report = engine.run_with_report("Compare the last two Rust releases").await?;
//! println!("{}", report.answer);
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod guardrails;
pub mod prompts;
pub mod providers;
pub mod resilience;

pub use config::{
    ConfigError, EngineConfig, ExecutionConfig, PlanFailurePolicy, PlanningConfig, SynthesisConfig,
    SynthesisMode,
};
pub use engine::{EngineError, FailedStep, PlanEngine, PlanEngineBuilder, PlanSource, RunReport, StepOutcome};
pub use events::{EngineEvent, EngineObserver, EventBus};
pub use guardrails::{
    Guardrail, GuardrailContext, GuardrailError, GuardrailResult, GuardrailRunner, GuardrailSet,
};
pub use providers::{
    FnTool, GenerationOptions, ModelError, ModelService, TextStream, Tool, ToolDescription, ToolError,
    ToolRegistry, ToolService,
};
pub use resilience::{
    Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, FallbackChain, FallbackError,
    RetryPolicy,
};
pub use stepwise_core::{ExecutionPlan, PlanStep, StepId, StepStatus};
