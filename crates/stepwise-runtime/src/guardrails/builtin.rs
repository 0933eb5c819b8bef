//! Built-in guardrails.
//!
//! Detection patterns are shared between the input, output and tool
//! variants of [`PatternGuardrail`], so a credential is caught whether it
//! appears in the goal, a step result or a tool argument.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::{Guardrail, GuardrailContext, GuardrailResult, InputPayload, OutputPayload, ToolPayload};

lazy_static! {
    /// Email address pattern (RFC 5322 simplified)
    static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// US phone number pattern (with optional country code)
    static ref PHONE_PATTERN: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\([0-9]{3}\)|[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}"
    ).unwrap();

    /// Social Security Number pattern (XXX-XX-XXXX)
    static ref SSN_PATTERN: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();

    /// Payment card number pattern (16 digits with optional separators)
    static ref CARD_NUMBER_PATTERN: Regex = Regex::new(
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"
    ).unwrap();

    /// `api_key=...`, `token: ...`, `Bearer ...` followed by a long secret
    static ref SECRET_ASSIGNMENT_PATTERN: Regex = Regex::new(
        r#"(?i)(api[_-]?key|secret[_-]?key|access[_-]?token|auth[_-]?token|bearer|password|secret|token)[\s:=]+['"]?[a-zA-Z0-9_-]{16,}['"]?"#
    ).unwrap();

    /// AWS access key ids
    static ref AWS_KEY_PATTERN: Regex = Regex::new(
        r"(AKIA|ABIA|ACCA|AGPA|AIDA|AIPA|ANPA|ANVA|AROA|ASCA|ASIA)[A-Z0-9]{16}"
    ).unwrap();
}

/// Trips when any configured regex matches.
///
/// Matched text is never echoed in the verdict; only the category labels.
#[derive(Debug, Clone)]
pub struct PatternGuardrail {
    name: String,
    patterns: Vec<(String, Regex)>,
}

impl PatternGuardrail {
    /// An empty guardrail; add patterns with [`with_pattern`](Self::with_pattern).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
        }
    }

    /// Emails, phone numbers, SSNs and payment card numbers.
    pub fn pii() -> Self {
        Self::new("pii")
            .with_pattern("email", EMAIL_PATTERN.clone())
            .with_pattern("phone", PHONE_PATTERN.clone())
            .with_pattern("ssn", SSN_PATTERN.clone())
            .with_pattern("card_number", CARD_NUMBER_PATTERN.clone())
    }

    /// API keys, tokens, passwords and AWS access keys.
    pub fn credentials() -> Self {
        Self::new("credentials")
            .with_pattern("secret", SECRET_ASSIGNMENT_PATTERN.clone())
            .with_pattern("aws_key", AWS_KEY_PATTERN.clone())
    }

    pub fn with_pattern(mut self, label: impl Into<String>, pattern: Regex) -> Self {
        self.patterns.push((label.into(), pattern));
        self
    }

    /// Labels of every pattern matching any of `texts`, in declaration order.
    fn matches<'t>(&self, texts: impl IntoIterator<Item = &'t str>) -> Vec<&str> {
        let texts: Vec<&str> = texts.into_iter().collect();
        self.patterns
            .iter()
            .filter(|(_, regex)| texts.iter().any(|t| regex.is_match(t)))
            .map(|(label, _)| label.as_str())
            .collect()
    }

    fn verdict(&self, matched: Vec<&str>, location: &str) -> GuardrailResult {
        if matched.is_empty() {
            return GuardrailResult::pass();
        }
        GuardrailResult::trip(format!("Detected {} in {}", matched.join(", "), location))
            .with_info(json!({ "matched": matched }))
            .with_metadata("categories", matched.join(","))
    }
}

/// Every string leaf of a JSON value, depth first.
fn string_leaves<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| string_leaves(v, out)),
        Value::Object(map) => map.values().for_each(|v| string_leaves(v, out)),
        _ => {}
    }
}

#[async_trait]
impl Guardrail<InputPayload> for PatternGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, payload: &InputPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        Ok(self.verdict(self.matches([payload.text.as_str()]), "input"))
    }
}

#[async_trait]
impl Guardrail<OutputPayload> for PatternGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, payload: &OutputPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        Ok(self.verdict(self.matches([payload.text.as_str()]), &payload.producer))
    }
}

#[async_trait]
impl Guardrail<ToolPayload> for PatternGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, payload: &ToolPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        let location = match payload.output {
            Some(_) => format!("output of tool '{}'", payload.tool_name),
            None => format!("arguments of tool '{}'", payload.tool_name),
        };

        let mut texts = Vec::new();
        match &payload.output {
            Some(output) => texts.push(output.as_str()),
            None => payload
                .arguments
                .values()
                .for_each(|v| string_leaves(v, &mut texts)),
        }

        Ok(self.verdict(self.matches(texts), &location))
    }
}

/// Trips when text exceeds a character budget.
#[derive(Debug, Clone)]
pub struct MaxLengthGuardrail {
    max_chars: usize,
}

impl MaxLengthGuardrail {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    fn verdict(&self, text: &str) -> GuardrailResult {
        let chars = text.chars().count();
        if chars <= self.max_chars {
            return GuardrailResult::pass();
        }
        GuardrailResult::trip(format!("{} characters exceeds limit of {}", chars, self.max_chars))
            .with_metadata("chars", chars.to_string())
    }
}

#[async_trait]
impl Guardrail<InputPayload> for MaxLengthGuardrail {
    fn name(&self) -> &str {
        "max_length"
    }

    async fn check(&self, payload: &InputPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        Ok(self.verdict(&payload.text))
    }
}

#[async_trait]
impl Guardrail<OutputPayload> for MaxLengthGuardrail {
    fn name(&self) -> &str {
        "max_length"
    }

    async fn check(&self, payload: &OutputPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        Ok(self.verdict(&payload.text))
    }
}

/// Trips on calls to tools outside an allowlist.
#[derive(Debug, Clone)]
pub struct ToolAllowlistGuardrail {
    allowed: BTreeSet<String>,
}

impl ToolAllowlistGuardrail {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Guardrail<ToolPayload> for ToolAllowlistGuardrail {
    fn name(&self) -> &str {
        "tool_allowlist"
    }

    async fn check(&self, payload: &ToolPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        if self.allowed.contains(&payload.tool_name) {
            return Ok(GuardrailResult::pass());
        }
        Ok(
            GuardrailResult::trip(format!("Tool '{}' is not allowed", payload.tool_name))
                .with_metadata("tool", payload.tool_name.clone()),
        )
    }
}

/// Validates tool arguments against per-tool JSON Schemas before the call.
///
/// Tools without a registered schema pass. Post-call payloads are not checked.
#[derive(Default)]
pub struct ToolArgumentSchemaGuardrail {
    validators: HashMap<String, jsonschema::Validator>,
}

impl ToolArgumentSchemaGuardrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register the schema for `tool`.
    pub fn with_schema(mut self, tool: impl Into<String>, schema: &Value) -> anyhow::Result<Self> {
        let tool = tool.into();
        let validator = jsonschema::options()
            .build(schema)
            .map_err(|e| anyhow::anyhow!("Invalid argument schema for tool '{}': {}", tool, e))?;
        self.validators.insert(tool, validator);
        Ok(self)
    }
}

impl std::fmt::Debug for ToolArgumentSchemaGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tools: Vec<&String> = self.validators.keys().collect();
        tools.sort();
        f.debug_struct("ToolArgumentSchemaGuardrail")
            .field("tools", &tools)
            .finish()
    }
}

#[async_trait]
impl Guardrail<ToolPayload> for ToolArgumentSchemaGuardrail {
    fn name(&self) -> &str {
        "tool_argument_schema"
    }

    async fn check(&self, payload: &ToolPayload, _context: &GuardrailContext) -> anyhow::Result<GuardrailResult> {
        if payload.output.is_some() {
            return Ok(GuardrailResult::pass());
        }
        let Some(validator) = self.validators.get(&payload.tool_name) else {
            return Ok(GuardrailResult::pass());
        };

        let arguments = Value::Object(payload.arguments.clone());
        let errors: Vec<String> = validator
            .iter_errors(&arguments)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();

        if errors.is_empty() {
            return Ok(GuardrailResult::pass());
        }
        Ok(GuardrailResult::trip(format!(
            "Arguments for tool '{}' violate schema: {}",
            payload.tool_name,
            errors.join("; ")
        ))
        .with_info(json!({ "violations": errors })))
    }
}
