//! OpenRouter chat-completions client.

use crate::{check_status, Error, DEFAULT_TIMEOUT};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3-0324:free";
const DEFAULT_REFERER: &str = "https://chat2.app";
const DEFAULT_TITLE: &str = "Interactive Story Chat";

/// OpenRouter API client.
#[derive(Clone)]
pub struct OpenRouter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    referer: String,
    title: String,
    timeout: Duration,
}

impl OpenRouter {
    /// Create a new client with the given API key.
    ///
    /// An empty key is allowed; requests then fail with [`Error::NoApiKey`].
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            title: DEFAULT_TITLE.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a client from the OPENROUTER_API_KEY environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = std::env::var("OPENROUTER_API_KEY").map_err(|_| Error::NoApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Set the model slug.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the site URL and title sent for OpenRouter attribution.
    pub fn with_attribution(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.referer = referer.into();
        self.title = title.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether an API key is present.
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Send a single user prompt and return the first choice's content.
    ///
    /// `Ok(None)` means the provider answered but without any text.
    pub async fn complete(&self, prompt: &str) -> Result<Option<String>, Error> {
        if !self.is_configured() {
            return Err(Error::NoApiKey);
        }

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        tracing::debug!(model = %self.model, "sending OpenRouter request");

        let response = self
            .client
            .post(API_URL)
            .headers(self.build_headers()?)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout))?;

        let response = check_status(response).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(parsed.first_content())
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        headers.insert(
            "HTTP-Referer",
            HeaderValue::from_str(&self.referer)
                .map_err(|e| Error::Config(format!("Invalid referer: {e}")))?,
        );
        headers.insert(
            "X-Title",
            HeaderValue::from_str(&self.title)
                .map_err(|e| Error::Config(format!("Invalid title: {e}")))?,
        );
        Ok(headers)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn first_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|text| !text.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = ChatRequest {
            model: DEFAULT_MODEL,
            messages: vec![ChatMessage {
                role: "user",
                content: "Hello",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_first_content() {
        let raw = r#"{"choices":[{"message":{"content":"The lights flicker."}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_content().as_deref(), Some("The lights flicker."));
    }

    #[test]
    fn test_missing_content() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(parsed.first_content(), None);

        let parsed: ChatResponse = serde_json::from_str(r#"{"error":"nope"}"#).unwrap();
        assert_eq!(parsed.first_content(), None);

        let raw = r#"{"choices":[{"message":{"content":""}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_content(), None);
    }

    #[tokio::test]
    async fn test_unconfigured_client() {
        let client = OpenRouter::new("");
        assert!(!client.is_configured());
        let result = client.complete("hi").await;
        assert!(matches!(result, Err(Error::NoApiKey)));
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test -p genai -- --ignored
    async fn test_live_completion() {
        let _ = dotenvy::dotenv();
        let Ok(client) = OpenRouter::from_env() else {
            eprintln!("Skipping test: OPENROUTER_API_KEY not set");
            return;
        };
        let text = client
            .complete("Hello! Please respond with a short story message under 50 characters.")
            .await
            .expect("request should succeed");
        assert!(text.is_some());
    }
}
