//! Google Gemini `generateContent` client.

use crate::{check_status, Error, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-pro";

/// Gemini API client.
#[derive(Clone)]
pub struct Gemini {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl Gemini {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a client from the GEMINI_API_KEY environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| Error::NoApiKey)?;
        Ok(Self::new(api_key))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Send a single prompt and return the first candidate's first text part.
    pub async fn generate(&self, prompt: &str) -> Result<Option<String>, Error> {
        if !self.is_configured() {
            return Err(Error::NoApiKey);
        }

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        tracing::debug!(model = %self.model, "sending Gemini request");

        let response = self
            .client
            .post(format!("{API_BASE}/{}:generateContent", self.model))
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout))?;

        let response = check_status(response).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(parsed.first_text())
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|text| !text.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "prompt".to_string(),
                }],
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "prompt");
    }

    #[test]
    fn test_first_text() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"A cold wind."},{"text":"ignored"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_text().as_deref(), Some("A cold wind."));
    }

    #[test]
    fn test_blocked_response_has_no_text() {
        let raw = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_text(), None);
    }
}
