//! # stepwise-core
//!
//! Deterministic plan model for Stepwise.
//!
//! This crate owns everything about a plan that does not need a model, a
//! tool or an async runtime:
//! - The plan wire format the planning model must produce
//! - Extraction of that JSON from free-form model output
//! - Dependency resolution from step numbers to step ids
//! - The step state machine and eligibility rules
//!
//! ## Key Guarantees
//!
//! 1. **Resolved dependencies**: every `depends_on` id exists in the same plan
//! 2. **Forward-only state**: a terminal step is never revisited
//! 3. **Ordered eligibility**: a step cannot start before its dependencies complete
//!
//! ## Example
//!
//! ```rust
//! use stepwise_core::{parse_plan, ExecutionPlan};
//!
//! let response = r#"Here you go: {"steps": [
//!     {"stepNumber": 1, "description": "Fetch", "toolName": "http_get",
//!      "toolArguments": {"url": "https://example.com"}, "dependsOn": []},
//!     {"stepNumber": 2, "description": "Summarize", "toolName": null,
//!      "toolArguments": {}, "dependsOn": [1]}
//! ]}"#;
//!
//! let spec = parse_plan(response).unwrap();
//! let plan = ExecutionPlan::from_spec("Summarize example.com", spec, 0);
//! assert_eq!(plan.eligible_steps().len(), 1);
//! ```

pub mod plan;

pub use plan::{
    extract_json_object, parse_plan, validate_plan_schema, ExecutionPlan, PlanParseError,
    PlanSpec, PlanStateError, PlanStep, StepId, StepSpec, StepStatus,
};
