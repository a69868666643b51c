//! Testing utilities for the story engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedGenerator` for deterministic testing without API calls
//! - `TestHarness` wiring a service over in-memory storage with no typing delay
//! - Assertion helpers for verifying conversation state

use crate::images::ImageProvider;
use crate::model::{ConversationPhase, ConversationState};
use crate::narrator::Narrator;
use crate::provider::TextGenerator;
use crate::service::StoryService;
use crate::storage::MemoryStorage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A scripted provider reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text.
    Text(String),
    /// Answer with no text.
    Empty,
    /// Fail with a network error.
    Failure(String),
    /// Never answer.
    Hang,
    /// Panic inside the provider call.
    Panic,
}

/// A text provider that returns queued replies in order.
///
/// When the queue is empty every call fails, so the engine falls back to
/// static content.
#[derive(Debug)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
    ready: bool,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            ready: true,
        }
    }

    /// A provider that reports a missing API key.
    pub fn unconfigured() -> Self {
        Self {
            ready: false,
            ..Self::new()
        }
    }

    pub fn push(&self, reply: ScriptedReply) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(ScriptedReply::Text(text.into()))
    }

    pub fn push_empty(&self) -> &Self {
        self.push(ScriptedReply::Empty)
    }

    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        self.push(ScriptedReply::Failure(message.into()))
    }

    pub fn push_hang(&self) -> &Self {
        self.push(ScriptedReply::Hang)
    }

    pub fn push_panic(&self) -> &Self {
        self.push(ScriptedReply::Panic)
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Replies not consumed yet.
    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, genai::Error> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match reply {
            Some(ScriptedReply::Text(text)) => Ok(Some(text)),
            Some(ScriptedReply::Empty) => Ok(None),
            Some(ScriptedReply::Failure(message)) => Err(genai::Error::Network(message)),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            Some(ScriptedReply::Panic) => panic!("scripted provider panic"),
            None => Err(genai::Error::Network("no scripted reply".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Test harness for running story scenarios.
pub struct TestHarness {
    pub service: StoryService,
    /// The provider behind the service's narrator.
    pub generator: Arc<ScriptedGenerator>,
    pub storage: Arc<MemoryStorage>,
}

impl TestHarness {
    /// Harness whose provider has nothing scripted.
    pub fn new() -> Self {
        Self::with_generator(ScriptedGenerator::new())
    }

    pub fn with_generator(generator: ScriptedGenerator) -> Self {
        Self::with_storage(generator, Arc::new(MemoryStorage::new()))
    }

    /// Harness over existing storage, e.g. to simulate a restart.
    pub fn with_storage(generator: ScriptedGenerator, storage: Arc<MemoryStorage>) -> Self {
        let generator = Arc::new(generator);
        let narrator = Narrator::new(generator.clone());
        let service = StoryService::build(
            narrator,
            storage.clone(),
            ImageProvider::placeholder(),
            Duration::ZERO,
        );
        Self {
            service,
            generator,
            storage,
        }
    }

    /// Pick the choice at `index`, wait for the reply, return the conversation.
    pub async fn choose(&self, character_id: &str, index: usize) -> ConversationState {
        let conversation = self
            .service
            .conversation(character_id)
            .await
            .unwrap_or_else(|| panic!("no conversation with {character_id}"));
        let choice = conversation
            .available_choices
            .get(index)
            .unwrap_or_else(|| panic!("no choice {index} for {character_id}"));

        self.service
            .make_choice(character_id, &choice.id)
            .await
            .unwrap_or_else(|e| panic!("choice failed: {e}"));
        self.service.wait_for_pending(character_id).await;

        self.service
            .conversation(character_id)
            .await
            .unwrap_or_else(|| panic!("conversation with {character_id} vanished"))
    }

    /// Texts of the choices currently on offer.
    pub async fn choice_texts(&self, character_id: &str) -> Vec<String> {
        self.service
            .conversation(character_id)
            .await
            .map(|c| c.available_choices.into_iter().map(|c| c.text).collect())
            .unwrap_or_default()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert a conversation is in the given phase.
#[track_caller]
pub fn assert_phase(conversation: &ConversationState, phase: ConversationPhase) {
    assert_eq!(
        conversation.phase, phase,
        "Expected conversation with '{}' to be {:?}",
        conversation.character_id, phase
    );
}

/// Assert the newest real message has the given text.
#[track_caller]
pub fn assert_last_message(conversation: &ConversationState, text: &str) {
    let last = conversation.last_message().map(|m| m.text.as_str());
    assert_eq!(
        last,
        Some(text),
        "Expected last message '{text}', got {last:?}"
    );
}

/// Assert a choice with the given text is on offer.
#[track_caller]
pub fn assert_choice_offered(conversation: &ConversationState, text: &str) {
    assert!(
        conversation.available_choices.iter().any(|c| c.text == text),
        "Expected choice '{text}' to be offered"
    );
}

/// Assert no typing placeholder is left.
#[track_caller]
pub fn assert_not_typing(conversation: &ConversationState) {
    assert!(
        !conversation.is_typing(),
        "Expected no typing indicator in conversation with '{}'",
        conversation.character_id
    );
}
