//! Game state model.
//!
//! Everything in here is plain data that round-trips through serde; the
//! whole [`GameState`] is persisted as a single blob after every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Sender id used for messages written by the player.
pub const PLAYER_ID: &str = "player";

/// Text of the transient typing placeholder.
pub const TYPING_TEXT: &str = "...";

/// Global flag that unlocks paywalled choices.
pub const PREMIUM_FLAG: &str = "premium";

// ============================================================================
// Messages and choices
// ============================================================================

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    System,
}

/// A single chat bubble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    /// Either [`PLAYER_ID`] or a character id.
    pub sender_id: String,

    pub text: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default)]
    pub is_read: bool,

    /// Transient "character is typing" placeholder.
    #[serde(default)]
    pub is_typing: bool,
}

impl Message {
    /// A text message from a character. Starts unread.
    pub fn from_character(character_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: character_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            image_url: None,
            is_read: false,
            is_typing: false,
        }
    }

    /// A text message from the player. Starts read.
    pub fn from_player(text: impl Into<String>) -> Self {
        Self {
            is_read: true,
            ..Self::from_character(PLAYER_ID, text)
        }
    }

    /// The typing placeholder shown while a character "writes".
    pub fn typing(character_id: impl Into<String>) -> Self {
        Self {
            id: format!("typing_{}", Uuid::new_v4()),
            is_typing: true,
            ..Self::from_character(character_id, TYPING_TEXT)
        }
    }

    /// An image message from a character.
    pub fn image(
        character_id: impl Into<String>,
        caption: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Image,
            image_url: Some(url.into()),
            ..Self::from_character(character_id, caption)
        }
    }

    pub fn is_from_player(&self) -> bool {
        self.sender_id == PLAYER_ID
    }
}

/// A player-selectable reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,

    /// Text shown on the button and echoed as the player's message.
    pub text: String,

    /// Narrative consequence fed back to the AI.
    pub consequence: String,

    /// Relationship deltas keyed by character id.
    #[serde(default)]
    pub relationship_effect: HashMap<String, i32>,

    /// Characters made visible when this choice is taken.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unlock_characters: Vec<String>,

    /// Global flag raised when this choice is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,

    /// Only selectable by premium players.
    #[serde(default)]
    pub is_paywall_locked: bool,
}

impl Choice {
    pub fn new(text: impl Into<String>, consequence: impl Into<String>) -> Self {
        Self {
            id: format!("choice_{}", Uuid::new_v4()),
            text: text.into(),
            consequence: consequence.into(),
            relationship_effect: HashMap::new(),
            unlock_characters: Vec::new(),
            trigger_event: None,
            is_paywall_locked: false,
        }
    }

    pub fn with_effect(mut self, character_id: impl Into<String>, delta: i32) -> Self {
        self.relationship_effect.insert(character_id.into(), delta);
        self
    }

    pub fn with_unlock(mut self, character_id: impl Into<String>) -> Self {
        self.unlock_characters.push(character_id.into());
        self
    }

    pub fn with_trigger(mut self, event: impl Into<String>) -> Self {
        self.trigger_event = Some(event.into());
        self
    }

    pub fn paywalled(mut self) -> Self {
        self.is_paywall_locked = true;
        self
    }
}

// ============================================================================
// Characters
// ============================================================================

/// Narrative role of a character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Friend,
    RomanticInterest,
    Antagonist,
    Mystery,
}

impl CharacterRole {
    pub fn name(&self) -> &'static str {
        match self {
            CharacterRole::Friend => "friend",
            CharacterRole::RomanticInterest => "romantic interest",
            CharacterRole::Antagonist => "antagonist",
            CharacterRole::Mystery => "mystery",
        }
    }
}

/// A contact the player can chat with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,

    /// Avatar image URL.
    pub avatar: String,

    pub is_unlocked: bool,

    /// Running relationship score, mirrored in [`GameState::relationship_scores`].
    pub relationship_level: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    pub is_online: bool,
    pub description: String,
    pub role: CharacterRole,
}

impl Character {
    fn seed(
        id: &str,
        name: &str,
        avatar: &str,
        description: &str,
        role: CharacterRole,
        unlocked: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            avatar: avatar.to_string(),
            is_unlocked: unlocked,
            relationship_level: 0,
            last_seen: None,
            is_online: unlocked,
            description: description.to_string(),
            role,
        }
    }
}

/// The starting roster: Alex is reachable, everyone else is locked.
pub fn initial_characters() -> HashMap<String, Character> {
    [
        Character::seed(
            "alex",
            "Alex Chen",
            "https://images.pexels.com/photos/2379004/pexels-photo-2379004.jpeg",
            "Your best friend since college. Tech-savvy and always curious about the strange happenings in town.",
            CharacterRole::Friend,
            true,
        ),
        Character::seed(
            "maya",
            "Dr. Maya Rodriguez",
            "https://images.pexels.com/photos/3796217/pexels-photo-3796217.jpeg",
            "A quantum physicist studying temporal anomalies. Brilliant but secretive.",
            CharacterRole::RomanticInterest,
            false,
        ),
        Character::seed(
            "unknown",
            "???",
            "https://images.pexels.com/photos/1624438/pexels-photo-1624438.jpeg",
            "Strange messages from an unknown sender...",
            CharacterRole::Mystery,
            false,
        ),
    ]
    .into_iter()
    .map(|c| (c.id.clone(), c))
    .collect()
}

// ============================================================================
// Conversations
// ============================================================================

/// Lifecycle of a single conversation.
///
/// `NotStarted` is never stored; it is what [`GameState::phase`] reports for
/// characters without a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    NotStarted,
    AwaitingChoice,
    ChoiceApplied,
    GeneratingResponse,
}

/// One chat thread with one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub character_id: String,
    pub messages: Vec<Message>,
    pub current_scene_id: String,
    pub available_choices: Vec<Choice>,
    pub phase: ConversationPhase,

    /// Token of the reply being generated; cleared once choices are back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reply: Option<String>,
}

impl ConversationState {
    /// True while choices are on screen and the player is expected to pick.
    pub fn is_waiting_for_response(&self) -> bool {
        self.phase == ConversationPhase::AwaitingChoice
    }

    pub fn find_choice(&self, choice_id: &str) -> Option<&Choice> {
        self.available_choices.iter().find(|c| c.id == choice_id)
    }

    pub fn remove_typing(&mut self) {
        self.messages.retain(|m| !m.is_typing);
    }

    pub fn is_typing(&self) -> bool {
        self.messages.iter().any(|m| m.is_typing)
    }

    pub fn player_has_replied(&self) -> bool {
        self.messages.iter().any(Message::is_from_player)
    }

    /// Character messages the player has not seen yet.
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_from_player() && !m.is_read && !m.is_typing)
            .count()
    }

    /// Most recent real message, for contact list previews.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| !m.is_typing)
    }

    /// Mark every character message as read. Returns whether anything changed.
    pub fn mark_read(&mut self) -> bool {
        let mut changed = false;
        for message in self.messages.iter_mut() {
            if !message.is_from_player() && !message.is_read {
                message.is_read = true;
                changed = true;
            }
        }
        changed
    }
}

// ============================================================================
// Authored scenes
// ============================================================================

/// Full-screen emotional beat shown over the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionOverlay {
    pub text: String,
    pub duration_ms: u64,
    pub character: String,
}

/// A scripted message in an authored scene; ids and timestamps are assigned on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMessage {
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// An authored scene with fixed messages and choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryScene {
    pub id: String,
    pub character_id: String,
    pub trigger: String,
    pub messages: Vec<SceneMessage>,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub unlock_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_overlay: Option<EmotionOverlay>,
}

impl StoryScene {
    /// Whether every unlock condition is a raised global flag.
    pub fn is_available(&self, state: &GameState) -> bool {
        self.unlock_conditions.iter().all(|flag| state.flag(flag))
    }
}

// ============================================================================
// Game state
// ============================================================================

/// The single serialized blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub player_id: String,
    pub player_name: String,
    pub current_chapter: u32,
    pub completed_scenes: Vec<String>,
    pub characters: HashMap<String, Character>,
    pub conversations: HashMap<String, ConversationState>,
    pub global_flags: HashMap<String, bool>,
    pub relationship_scores: HashMap<String, i32>,
    pub unlocked_endings: Vec<String>,
    pub game_started: DateTime<Utc>,
    pub last_played: DateTime<Utc>,
}

impl GameState {
    /// A fresh game with the starting roster.
    pub fn new(player_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            player_id: PLAYER_ID.to_string(),
            player_name: player_name.into(),
            current_chapter: 1,
            completed_scenes: Vec::new(),
            characters: initial_characters(),
            conversations: HashMap::new(),
            global_flags: HashMap::new(),
            relationship_scores: HashMap::new(),
            unlocked_endings: Vec::new(),
            game_started: now,
            last_played: now,
        }
    }

    pub fn phase(&self, character_id: &str) -> ConversationPhase {
        self.conversations
            .get(character_id)
            .map(|c| c.phase)
            .unwrap_or(ConversationPhase::NotStarted)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.global_flags.get(key).copied().unwrap_or(false)
    }

    pub fn is_premium(&self) -> bool {
        self.flag(PREMIUM_FLAG)
    }

    pub fn relationship_score(&self, character_id: &str) -> i32 {
        self.relationship_scores
            .get(character_id)
            .copied()
            .unwrap_or(0)
    }

    /// Add `delta` to a character's level and running score.
    ///
    /// Unknown character ids are ignored.
    pub fn adjust_relationship(&mut self, character_id: &str, delta: i32) -> bool {
        let Some(character) = self.characters.get_mut(character_id) else {
            return false;
        };
        character.relationship_level += delta;
        *self
            .relationship_scores
            .entry(character_id.to_string())
            .or_insert(0) += delta;
        true
    }

    /// Make a character visible and online. Unknown ids are ignored.
    pub fn unlock(&mut self, character_id: &str) -> bool {
        match self.characters.get_mut(character_id) {
            Some(character) => {
                character.is_unlocked = true;
                character.is_online = true;
                true
            }
            None => false,
        }
    }

    pub fn unlocked_characters(&self) -> Vec<&Character> {
        let mut unlocked: Vec<_> = self.characters.values().filter(|c| c.is_unlocked).collect();
        unlocked.sort_by(|a, b| a.id.cmp(&b.id));
        unlocked
    }

    /// Messages across every conversation, typing placeholders excluded.
    pub fn total_messages(&self) -> usize {
        self.conversations
            .values()
            .map(|c| c.messages.iter().filter(|m| !m.is_typing).count())
            .sum()
    }

    pub fn play_time(&self) -> chrono::Duration {
        self.last_played - self.game_started
    }

    pub fn touch(&mut self) {
        self.last_played = Utc::now();
    }
}
