//! Text generation capability.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Default Gemini model.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Errors returned by a [`Generator`].
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("GEMINI_API_KEY not set")]
    ApiKeyNotSet,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Backend(String),
}

impl GenerationError {
    /// Whether repeating the call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited
                | GenerationError::Network(_)
                | GenerationError::Api {
                    code: 500..=599,
                    ..
                }
        )
    }
}

/// A language model that turns a prompt into text.
///
/// Implementations only report transport and API failures; the caller is
/// responsible for treating blank output as an error.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Clone)]
struct ApiKey(String);

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Generator backed by the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    http: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    /// Create a generator with an explicit key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: ApiKey(api_key.into()),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: GEMINI_API_BASE.to_string(),
        }
    }

    /// Create a generator from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, GenerationError> {
        let key = std::env::var("GEMINI_API_KEY").map_err(|_| GenerationError::ApiKeyNotSet)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(GenerationError::ApiKeyNotSet);
        }
        Ok(Self::new(key))
    }

    /// Set the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different API base (used for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Model this generator calls.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
                role: None,
            }],
        };

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key.0)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("Gemini API rate limited");
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<body unreadable: {e}>"));
            if let Ok(body) = serde_json::from_str::<GenerateContentResponse>(&text)
                && let Some(err) = &body.error
            {
                return Err(classify_api_error(err));
            }
            let snippet: String = text.chars().take(200).collect();
            return Err(GenerationError::Api {
                code: status.as_u16(),
                message: format!("HTTP {status}: {snippet}"),
            });
        }

        let body: GenerateContentResponse = response.json().await?;
        if let Some(err) = &body.error {
            return Err(classify_api_error(err));
        }

        let text = body.text().ok_or(GenerationError::EmptyResponse)?;
        debug!(model = %self.model, chars = text.len(), "gemini generation complete");
        Ok(text)
    }
}

fn classify_api_error(err: &ApiError) -> GenerationError {
    let message = err
        .message
        .clone()
        .unwrap_or_else(|| "unknown error".to_string());

    match err.code {
        Some(429) => GenerationError::RateLimited,
        Some(code) => GenerationError::Api { code, message },
        None => GenerationError::Api { code: 0, message },
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate, if it has any.
    fn text(&self) -> Option<String> {
        let content = self.candidates.as_ref()?.first()?.content.as_ref()?;
        let text: String = content.parts.iter().map(|p| p.text.as_str()).collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator(server: &MockServer) -> GeminiGenerator {
        GeminiGenerator::new("test-key").with_base_url(server.uri())
    }

    #[test]
    fn test_api_key_is_redacted() {
        let rendered = format!("{:?}", GeminiGenerator::new("secret"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GenerationError::RateLimited.is_transient());
        assert!(
            GenerationError::Api {
                code: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !GenerationError::Api {
                code: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!GenerationError::EmptyResponse.is_transient());
    }

    #[tokio::test]
    async fn test_generate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{DEFAULT_GEMINI_MODEL}:generateContent")))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {
                        "parts": [{"text": "  I feel anxious "}, {"text": "about tomorrow"}],
                        "role": "model"
                    }
                }]
            })))
            .mount(&server)
            .await;

        let text = generator(&server).generate("translate").await.unwrap();
        assert_eq!(text, "I feel anxious about tomorrow");
    }

    #[tokio::test]
    async fn test_generate_empty_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .mount(&server)
            .await;

        let err = generator(&server).generate("x").await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_generate_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = generator(&server).generate("x").await.unwrap_err();
        assert!(matches!(err, GenerationError::RateLimited));
    }

    #[tokio::test]
    async fn test_generate_structured_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": 400, "message": "API key not valid"}
            })))
            .mount(&server)
            .await;

        match generator(&server).generate("x").await.unwrap_err() {
            GenerationError::Api { code, message } => {
                assert_eq!(code, 400);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_unstructured_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        match generator(&server).generate("x").await.unwrap_err() {
            GenerationError::Api { code, message } => {
                assert_eq!(code, 502);
                assert!(message.contains("bad gateway"), "got {message}");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_truncated_error_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Declares a longer body than it sends, then closes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 64\r\n\r\ncut")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let generator = GeminiGenerator::new("test-key").with_base_url(format!("http://{addr}"));
        match generator.generate("x").await.unwrap_err() {
            GenerationError::Api { code, message } => {
                assert_eq!(code, 502);
                assert!(message.contains("<body unreadable: "), "got {message}");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
