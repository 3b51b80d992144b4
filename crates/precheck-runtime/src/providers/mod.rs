//! Model provider abstractions for precheck-runtime.
//!
//! Three narrow capabilities are consumed from model backends: vision
//! extraction over photos, text reasoning for risk scanning and tool
//! selection, and text embedding for retrieval. Each is a separate trait so
//! adapters depend only on what they use; one backend may implement all of
//! them.
//!
//! ## Security
//!
//! All providers use the [`secrets`] module for credential handling. See
//! [`ApiCredential`] for the patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod secrets;

mod openai;

pub use openai::OpenAiProvider;
pub use secrets::{ApiCredential, CredentialSource};

/// Errors from model providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::HttpError(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
        )
    }
}

/// Configuration for one completion request.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Model to use.
    pub model: String,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic).
    pub temperature: f32,

    /// Request timeout.
    pub timeout: Duration,

    /// Ask the backend for a JSON-object response.
    pub json_mode: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
            json_mode: false,
        }
    }
}

/// One part of a chat message: plain text or an image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// A chat message for model completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant".
    pub role: String,

    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            parts: vec![ContentPart::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a text-only user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![ContentPart::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a user message carrying text plus one image reference.
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    url: image_url.into(),
                },
            ],
        }
    }

    /// Create an assistant message (used when replaying a repair turn).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            parts: vec![ContentPart::Text {
                text: content.into(),
            }],
        }
    }

    /// Concatenated text content of this message.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Response from a completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content.
    pub content: String,

    /// Model that produced it.
    pub model: String,
}

/// Text reasoning backend: risk scanning, tool selection, summaries.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Execute a chat completion over text-only messages.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Provider name for logging and ledger entries.
    fn name(&self) -> &str;
}

/// Vision backend: structured extraction from photos.
///
/// Messages may carry [`ContentPart::ImageUrl`] parts.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    fn name(&self) -> &str;
}

/// Embedding backend: text to fixed-dimension vector.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    fn name(&self) -> &str;
}
