//! OpenAI-compatible provider implementation.
//!
//! One backend serves all three capabilities: chat completions for text
//! reasoning, chat completions with image parts for vision, and the
//! embeddings endpoint for retrieval vectors. Transient failures (timeouts,
//! 429s, connection errors) are retried with exponential backoff.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    secrets::ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, ContentPart,
    EmbeddingModel, ProviderError, TextModel, VisionModel,
};

/// Environment variable holding the API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible model provider.
pub struct OpenAiProvider {
    credential: ApiCredential,
    base_url: String,
    embedding_model: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiProvider {
    /// Create a provider with an explicit key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            credential: ApiCredential::new(api_key, "OpenAI API key"),
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: "text-embedding-ada-002".to_string(),
        }
    }

    /// Create from the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_env(OPENAI_API_KEY_ENV, "OpenAI API key")?;
        Ok(Self {
            credential,
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: "text-embedding-ada-002".to_string(),
        })
    }

    /// Point at a compatible endpoint (proxy, local server).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the embedding model.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn client(&self) -> &reqwest::Client {
        static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
        CLIENT.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default()
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let send = || async { self.send_chat(messages, config).await };
        send.retry(ExponentialBuilder::default().with_max_times(2))
            .when(ProviderError::is_transient)
            .await
    }

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let api_messages: Vec<ApiMessage> = messages.iter().map(ApiMessage::from).collect();

        let request = ChatRequest {
            model: config.model.clone(),
            messages: api_messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            response_format: config.json_mode.then(|| ResponseFormat {
                type_: "json_object".to_string(),
            }),
        };

        let response = self
            .client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(config.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(config.timeout)
                } else {
                    ProviderError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|e| e.to_string());
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            model: body.model,
        })
    }
}

/// OpenAI chat request format.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiPart>,
}

impl From<&ChatMessage> for ApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg
                .parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => ApiPart::Text { text: text.clone() },
                    ContentPart::ImageUrl { url } => ApiPart::ImageUrl {
                        image_url: ImageUrl { url: url.clone() },
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

/// OpenAI chat response format.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl TextModel for OpenAiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        self.chat(&messages, config).await
    }

    fn name(&self) -> &str {
        "openai-text"
    }
}

#[async_trait]
impl VisionModel for OpenAiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        self.chat(&messages, config).await
    }

    fn name(&self) -> &str {
        "openai-vision"
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::ParseError(
                "cannot embed empty text".to_string(),
            ));
        }

        let send = || async {
            let request = EmbeddingRequest {
                model: self.embedding_model.clone(),
                input: text.trim().to_string(),
            };

            let response = self
                .client()
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(self.credential.expose())
                .json(&request)
                .send()
                .await
                .map_err(|e| ProviderError::HttpError(e.to_string()))?;

            let status = response.status();
            if status == 429 {
                return Err(ProviderError::RateLimited { retry_after: None });
            }
            if !status.is_success() {
                let message = response
                    .json::<ApiErrorBody>()
                    .await
                    .map(|b| b.error.message)
                    .unwrap_or_else(|e| e.to_string());
                return Err(ProviderError::ApiError {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::ParseError(e.to_string()))?;

            body.data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| ProviderError::ParseError("empty embedding response".to_string()))
        };

        send.retry(ExponentialBuilder::default().with_max_times(2))
            .when(ProviderError::is_transient)
            .await
    }

    fn name(&self) -> &str {
        "openai-embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_debug_redacts_key() {
        let provider = OpenAiProvider::new("sk-very-secret-key");
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-very-secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_message_conversion_preserves_image_parts() {
        let msg = ChatMessage::user_with_image("look", "https://x/p.jpg");
        let api = ApiMessage::from(&msg);
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "https://x/p.jpg");
    }

    #[test]
    fn test_json_mode_sets_response_format() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            max_tokens: 100,
            temperature: 0.0,
            response_format: Some(ResponseFormat {
                type_: "json_object".to_string(),
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_text() {
        let provider = OpenAiProvider::new("sk-test");
        let result = provider.embed("   ").await;
        assert!(matches!(result, Err(ProviderError::ParseError(_))));
    }
}
