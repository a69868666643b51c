//! Text generation providers.
//!
//! The narrator only needs "prompt in, text out". Both HTTP clients from
//! `genai` implement [`TextGenerator`], and tests substitute
//! [`crate::testing::ScriptedGenerator`].

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Core trait for text providers.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Send a prompt. `Ok(None)` means the provider answered with no text.
    async fn generate(&self, prompt: &str) -> Result<Option<String>, genai::Error>;

    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Whether the provider has the credentials it needs.
    fn is_ready(&self) -> bool;
}

#[async_trait]
impl TextGenerator for genai::OpenRouter {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, genai::Error> {
        self.complete(prompt).await
    }

    fn name(&self) -> &str {
        "openrouter"
    }

    fn is_ready(&self) -> bool {
        self.is_configured()
    }
}

#[async_trait]
impl TextGenerator for genai::Gemini {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, genai::Error> {
        genai::Gemini::generate(self, prompt).await
    }

    fn name(&self) -> &str {
        "gemini"
    }

    fn is_ready(&self) -> bool {
        self.is_configured()
    }
}

/// Which text provider backs the narrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    OpenRouter,
    Gemini,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" | "deepseek" => Ok(ProviderKind::OpenRouter),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}
