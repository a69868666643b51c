//! Hugging Face text-to-image inference client.

use crate::{check_status, Error};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::time::Duration;

const API_BASE: &str = "https://api-inference.huggingface.co/models";
const DEFAULT_MODEL: &str = "runwayml/stable-diffusion-v1-5";
const PROMPT_SUFFIX: &str = "high quality, detailed, digital art";

/// Image generation is slow; give it more room than the text clients.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw image returned by the inference endpoint.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Hugging Face inference client. The public tier works without a token.
#[derive(Clone)]
pub struct HuggingFace {
    client: reqwest::Client,
    api_token: Option<String>,
    model: String,
    timeout: Duration,
}

impl HuggingFace {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_token: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render an image for the prompt.
    pub async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, Error> {
        let body = InferenceRequest {
            inputs: format!("{prompt}, {PROMPT_SUFFIX}"),
            parameters: InferenceParameters {
                guidance_scale: 7.5,
                num_inference_steps: 20,
            },
        };

        let mut request = self
            .client
            .post(format!("{API_BASE}/{}", self.model))
            .timeout(self.timeout)
            .json(&body);
        if let Some(ref token) = self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, self.timeout))?;
        let response = check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        if !content_type.starts_with("image/") {
            return Err(Error::Parse(format!(
                "expected an image, got {content_type}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .to_vec();

        Ok(GeneratedImage {
            bytes,
            content_type,
        })
    }
}

impl Default for HuggingFace {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest {
    inputs: String,
    parameters: InferenceParameters,
}

#[derive(Debug, Serialize)]
struct InferenceParameters {
    guidance_scale: f32,
    num_inference_steps: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = InferenceRequest {
            inputs: format!("abandoned lab, {PROMPT_SUFFIX}"),
            parameters: InferenceParameters {
                guidance_scale: 7.5,
                num_inference_steps: 20,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json["inputs"],
            "abandoned lab, high quality, detailed, digital art"
        );
        assert_eq!(json["parameters"]["num_inference_steps"], 20);
    }
}
