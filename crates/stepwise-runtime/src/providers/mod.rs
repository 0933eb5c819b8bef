//! Model and tool service abstractions for stepwise-runtime.
//!
//! The engine never talks to a transport directly. Text generation goes
//! through [`ModelService`] and tool execution through [`ToolService`];
//! [`ToolRegistry`] is the in-process implementation of the latter.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::duration;

mod tools;

pub use tools::{FnTool, Tool, ToolDescription, ToolError, ToolRegistry, ToolService};

/// Stream of generated text fragments.
///
/// `Ok` items are fragments in order, an `Err` item is terminal and the end
/// of the stream means generation completed.
pub type TextStream = BoxStream<'static, Result<String, ModelError>>;

/// Errors from model services.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Model rejected the request: {0}")]
    Rejected(String),

    #[error("Model service not configured: {0}")]
    NotConfigured(String),
}

impl ModelError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::RateLimited { .. } | Self::Timeout(_) | Self::Stream(_)
        )
    }
}

/// Options for a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Model identifier understood by the service; `None` uses its default
    pub model: Option<String>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,

    /// System instruction prepended by the service
    pub system: Option<String>,

    /// Per-call timeout enforced by the engine
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            temperature: 0.0,
            system: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl GenerationOptions {
    /// Copy of these options with a different system instruction.
    pub fn with_system(&self, system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..self.clone()
        }
    }
}

/// Text generation backend.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Generate a complete response.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ModelError>;

    /// Generate a response as a stream of fragments.
    ///
    /// The default yields the whole `generate` result as one fragment.
    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<TextStream, ModelError> {
        let text = self.generate(prompt, options).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }

    /// Service name for logs.
    fn name(&self) -> &str;
}
