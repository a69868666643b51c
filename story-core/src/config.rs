//! Engine configuration.

use crate::images::ImageProvider;
use crate::provider::{ProviderKind, TextGenerator};
use crate::storage::{FileStorage, Storage};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default pause between a choice and the character's reply.
pub const DEFAULT_RESPONSE_DELAY: Duration = Duration::from_millis(1500);

/// Configuration for building a [`crate::StoryService`].
#[derive(Debug, Clone)]
pub struct StoryConfig {
    /// Which text provider narrates.
    pub provider: ProviderKind,

    pub openrouter_api_key: Option<String>,

    /// OpenRouter model; the client default is used when unset.
    pub openrouter_model: Option<String>,

    pub gemini_api_key: Option<String>,

    /// Directory for the save file.
    pub save_dir: PathBuf,

    /// How long the typing indicator shows before the reply is generated.
    pub response_delay: Duration,

    /// Upper bound on a single provider call.
    pub request_timeout: Duration,

    /// Try Hugging Face before falling back to placeholder images.
    pub generate_images: bool,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StoryConfig {
    pub fn new() -> Self {
        Self {
            provider: ProviderKind::default(),
            openrouter_api_key: None,
            openrouter_model: None,
            gemini_api_key: None,
            save_dir: PathBuf::from("./saves"),
            response_delay: DEFAULT_RESPONSE_DELAY,
            request_timeout: genai::DEFAULT_TIMEOUT,
            generate_images: false,
        }
    }

    /// Read settings from the environment.
    ///
    /// Unparseable values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        config.openrouter_api_key = non_empty_var("OPENROUTER_API_KEY");
        config.openrouter_model = non_empty_var("OPENROUTER_MODEL");
        config.gemini_api_key = non_empty_var("GEMINI_API_KEY");

        if let Some(provider) = parsed_var::<ProviderKind>("STORY_PROVIDER") {
            config.provider = provider;
        }
        if let Some(dir) = non_empty_var("STORY_SAVE_DIR") {
            config.save_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parsed_var::<u64>("STORY_RESPONSE_DELAY_MS") {
            config.response_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed_var::<u64>("STORY_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_openrouter_key(mut self, key: impl Into<String>) -> Self {
        self.openrouter_api_key = Some(key.into());
        self
    }

    pub fn with_openrouter_model(mut self, model: impl Into<String>) -> Self {
        self.openrouter_model = Some(model.into());
        self
    }

    pub fn with_gemini_key(mut self, key: impl Into<String>) -> Self {
        self.gemini_api_key = Some(key.into());
        self
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_image_generation(mut self, enabled: bool) -> Self {
        self.generate_images = enabled;
        self
    }

    /// Build the configured text provider. A missing key yields a provider
    /// that reports itself as not ready.
    pub fn build_generator(&self) -> Arc<dyn TextGenerator> {
        match self.provider {
            ProviderKind::OpenRouter => {
                let key = self.openrouter_api_key.clone().unwrap_or_default();
                let mut client = genai::OpenRouter::new(key).with_timeout(self.request_timeout);
                if let Some(model) = &self.openrouter_model {
                    client = client.with_model(model.clone());
                }
                Arc::new(client)
            }
            ProviderKind::Gemini => {
                let key = self.gemini_api_key.clone().unwrap_or_default();
                Arc::new(genai::Gemini::new(key).with_timeout(self.request_timeout))
            }
        }
    }

    pub fn build_storage(&self) -> Arc<dyn Storage> {
        Arc::new(FileStorage::new(self.save_dir.clone()))
    }

    /// Hugging Face when enabled; otherwise Gemini games use stock photos
    /// and everything else themed placeholders.
    pub fn build_images(&self) -> ImageProvider {
        if self.generate_images {
            return ImageProvider::with_generator(genai::HuggingFace::new());
        }
        match self.provider {
            ProviderKind::Gemini => ImageProvider::stock(),
            ProviderKind::OpenRouter => ImageProvider::placeholder(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = non_empty_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}
