//! AI narration.
//!
//! The [`Narrator`] turns a [`StoryContext`] into character text and reply
//! choices. It never fails: every provider problem is mapped to a sentinel
//! string or to static choices from [`crate::fallback`].

mod parse;
mod prompts;

pub use parse::{clean_story_text, parse_choices};
pub use prompts::{choices_prompt, continuation_instruction, opening_instruction, story_prompt};

use crate::fallback;
use crate::model::{Character, Choice, ConversationState, GameState, Message};
use crate::progress::{RelationshipTier, StoryStage};
use crate::provider::TextGenerator;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Number of recent messages included in prompts.
pub const HISTORY_WINDOW: usize = 5;

/// A choice as produced by the narrator, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceDraft {
    pub text: String,
    pub consequence: String,
    pub relationship_effect: HashMap<String, i32>,
}

impl ChoiceDraft {
    pub fn new(text: impl Into<String>, consequence: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            consequence: consequence.into(),
            relationship_effect: HashMap::new(),
        }
    }

    pub fn with_effect(mut self, character_id: impl Into<String>, delta: i32) -> Self {
        self.relationship_effect.insert(character_id.into(), delta);
        self
    }

    /// Assign an id. An empty effect map becomes `{character_id: 0}`.
    pub fn into_choice(self, character_id: &str) -> Choice {
        let mut choice = Choice::new(self.text, self.consequence);
        choice.relationship_effect = self.relationship_effect;
        if choice.relationship_effect.is_empty() {
            choice.relationship_effect.insert(character_id.to_string(), 0);
        }
        choice
    }
}

/// One line of conversation history as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryLine {
    pub sender: String,
    pub message: String,
}

/// Everything the model is told about the current moment in the story.
#[derive(Debug, Clone, Serialize)]
pub struct StoryContext {
    pub character: Character,
    pub player_name: String,
    pub chapter: u32,
    pub relationship_level: i32,
    pub relationship_tier: RelationshipTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice_consequence: Option<String>,
    pub conversation_history: Vec<HistoryLine>,
    pub total_messages: usize,
    pub game_flags: HashMap<String, bool>,
    pub story_stage: StoryStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ai_response: Option<String>,
}

impl StoryContext {
    /// Context for a character's first message.
    pub fn opening(state: &GameState, character: &Character) -> Self {
        Self {
            character: character.clone(),
            player_name: state.player_name.clone(),
            chapter: state.current_chapter,
            relationship_level: character.relationship_level,
            relationship_tier: RelationshipTier::from_level(character.relationship_level),
            choice_consequence: None,
            conversation_history: Vec::new(),
            total_messages: 0,
            game_flags: state.global_flags.clone(),
            story_stage: StoryStage::Beginning,
            last_ai_response: None,
        }
    }

    /// Context for a reply to the choice whose consequence is given.
    pub fn for_response(
        state: &GameState,
        conversation: &ConversationState,
        character: &Character,
        consequence: &str,
    ) -> Self {
        let messages: Vec<&Message> = conversation
            .messages
            .iter()
            .filter(|m| !m.is_typing)
            .collect();

        let conversation_history = messages
            .iter()
            .skip(messages.len().saturating_sub(HISTORY_WINDOW))
            .map(|m| HistoryLine {
                sender: if m.is_from_player() {
                    "Player".to_string()
                } else {
                    character.name.clone()
                },
                message: m.text.clone(),
            })
            .collect();

        let last_ai_response = messages
            .iter()
            .rev()
            .find(|m| !m.is_from_player())
            .map(|m| m.text.clone());

        Self {
            character: character.clone(),
            player_name: state.player_name.clone(),
            chapter: state.current_chapter,
            relationship_level: character.relationship_level,
            relationship_tier: RelationshipTier::from_level(character.relationship_level),
            choice_consequence: Some(consequence.to_string()),
            conversation_history,
            total_messages: conversation.messages.len(),
            game_flags: state.global_flags.clone(),
            story_stage: StoryStage::from_message_count(messages.len()),
            last_ai_response,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Story text and choice generation backed by a [`TextGenerator`].
#[derive(Clone)]
pub struct Narrator {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl Narrator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            timeout: genai::DEFAULT_TIMEOUT,
        }
    }

    /// Upper bound on a single provider call, including retries the provider may do.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.generator.name()
    }

    pub fn is_ready(&self) -> bool {
        self.generator.is_ready()
    }

    async fn request(&self, prompt: &str) -> Result<Option<String>, genai::Error> {
        match tokio::time::timeout(self.timeout, self.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(genai::Error::Timeout(self.timeout)),
        }
    }

    /// Generate narrative for `instruction`, or a sentinel string on failure.
    pub async fn generate_story_content(&self, instruction: &str, context: &StoryContext) -> String {
        if !self.generator.is_ready() {
            warn!(provider = self.generator.name(), "text provider is not configured");
            return fallback::CONFIG_ERROR.to_string();
        }

        let prompt = story_prompt(instruction, context);
        let raw = match self.request(&prompt).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return fallback::EMPTY_RESPONSE.to_string(),
            Err(e) => {
                warn!(provider = self.generator.name(), error = %e, "story generation failed");
                return fallback::CONNECTION_LOST.to_string();
            }
        };

        let text = clean_story_text(&raw);
        if text.chars().count() < 5 {
            debug!(raw = %raw, "story text too short after cleanup");
            return fallback::SIGNAL_FADES.to_string();
        }
        text
    }

    /// First message from the context's character.
    pub async fn generate_opening(&self, context: &StoryContext) -> String {
        let instruction = opening_instruction(&context.character.name);
        self.generate_story_content(&instruction, context).await
    }

    /// Reply to the consequence recorded in the context.
    pub async fn generate_response(&self, context: &StoryContext) -> String {
        let consequence = context
            .choice_consequence
            .as_deref()
            .unwrap_or("neutral response");
        let instruction = continuation_instruction(&context.character.name, consequence);
        self.generate_story_content(&instruction, context).await
    }

    /// Generate reply choices, falling back to the stage set on any failure.
    pub async fn generate_choices(&self, context: &StoryContext, character_id: &str) -> Vec<ChoiceDraft> {
        let fallback = || fallback::stage_choices(context.story_stage, character_id);

        if !self.generator.is_ready() {
            return fallback();
        }

        let prompt = choices_prompt(context, character_id);
        match self.request(&prompt).await {
            Ok(Some(raw)) => parse_choices(&raw, character_id).unwrap_or_else(fallback),
            Ok(None) => fallback(),
            Err(e) => {
                warn!(provider = self.generator.name(), error = %e, "choice generation failed");
                fallback()
            }
        }
    }
}

impl std::fmt::Debug for Narrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Narrator")
            .field("provider", &self.generator.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
