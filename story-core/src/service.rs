//! StoryService - the public API for playing the chat story.
//!
//! The service owns the single [`GameState`] and drives each conversation
//! through its phases:
//!
//! ```text
//! NotStarted -> AwaitingChoice -> ChoiceApplied -> GeneratingResponse -> AwaitingChoice
//! ```
//!
//! Every mutation is persisted right away. Character replies are produced by
//! a background task after the configured typing delay; watchers learn about
//! changes through [`StoryService::subscribe`].

use crate::config::{StoryConfig, DEFAULT_RESPONSE_DELAY};
use crate::fallback;
use crate::images::ImageProvider;
use crate::model::{
    ConversationPhase, ConversationState, EmotionOverlay, GameState, Message, StoryScene,
    PREMIUM_FLAG,
};
use crate::narrator::{Narrator, StoryContext};
use crate::progress::{
    chapter_for_messages, format_play_time, relationship_meter, RelationshipStatus,
    RelationshipTier, StoryStage,
};
use crate::storage::{self, Storage, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Character whose conversation opens with a new game.
pub const STARTING_CHARACTER: &str = "alex";

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Errors from StoryService operations.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("No game in progress")]
    NotInitialized,

    #[error("Character '{0}' is missing or locked")]
    CharacterUnavailable(String),

    #[error("No conversation with '{0}'")]
    ConversationNotFound(String),

    #[error("Choice '{0}' is not on offer")]
    ChoiceNotFound(String),

    #[error("Choice '{0}' requires premium")]
    ChoiceLocked(String),

    #[error("Scene '{0}' is not available")]
    SceneUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What changed in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A conversation was created with its opening message.
    Opened,
    /// Background generation replaced the opening message or choices.
    OpeningEnhanced,
    /// The player's choice was applied and the character is typing.
    ChoiceApplied,
    /// The character replied and new choices are on offer.
    ResponseReady,
    /// Reply generation failed; a retry choice is on offer.
    ResponseFailed,
    /// An authored scene was delivered.
    SceneDelivered,
    /// An image message was appended.
    ImageShared,
    /// The conversation was replaced or marked read.
    Updated,
}

/// Notification sent to subscribers after a conversation changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub character_id: String,
    pub kind: UpdateKind,
}

/// One line of the progress summary.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSummary {
    pub character_id: String,
    pub name: String,
    pub score: i32,
    pub status: RelationshipStatus,
    /// Meter fill in percent.
    pub meter: f32,
}

/// Snapshot for the progress screen.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub player_name: String,
    pub chapter: u32,
    pub play_time: String,
    pub contacts_unlocked: usize,
    pub contacts_total: usize,
    pub scenes_completed: usize,
    pub total_messages: usize,
    pub relationships: Vec<RelationshipSummary>,
}

struct Inner {
    state: Mutex<Option<GameState>>,
    narrator: Narrator,
    images: ImageProvider,
    storage: Arc<dyn Storage>,
    updates: broadcast::Sender<ConversationUpdate>,
    pending: std::sync::Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    response_delay: Duration,
}

/// Story orchestration service. Cheap to clone; clones share one game.
#[derive(Clone)]
pub struct StoryService {
    inner: Arc<Inner>,
}

impl StoryService {
    /// Service with the default typing delay and placeholder images.
    pub fn new(narrator: Narrator, storage: Arc<dyn Storage>) -> Self {
        Self::build(
            narrator,
            storage,
            ImageProvider::placeholder(),
            DEFAULT_RESPONSE_DELAY,
        )
    }

    /// Service wired from configuration.
    pub fn from_config(config: &StoryConfig) -> Self {
        let narrator = Narrator::new(config.build_generator()).with_timeout(config.request_timeout);
        Self::build(
            narrator,
            config.build_storage(),
            config.build_images(),
            config.response_delay,
        )
    }

    pub fn build(
        narrator: Narrator,
        storage: Arc<dyn Storage>,
        images: ImageProvider,
        response_delay: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                narrator,
                images,
                storage,
                updates,
                pending: std::sync::Mutex::new(HashMap::new()),
                response_delay,
            }),
        }
    }

    pub fn narrator(&self) -> &Narrator {
        &self.inner.narrator
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a fresh game and open the first conversation.
    pub async fn initialize_game(
        &self,
        player_name: impl Into<String>,
    ) -> Result<GameState, StoryError> {
        self.abort_pending();

        let state = GameState::new(player_name);
        info!(player = %state.player_name, "starting new game");
        {
            let mut guard = self.inner.state.lock().await;
            self.persist(&state).await;
            *guard = Some(state);
        }

        self.start_conversation(STARTING_CHARACTER).await?;
        self.game_state().await.ok_or(StoryError::NotInitialized)
    }

    /// Load the saved game. Any failure is logged and reported as `None`.
    ///
    /// Conversations saved mid-reply are put back on a retry choice.
    pub async fn load_game(&self) -> Option<GameState> {
        let mut state = match storage::load_game(self.inner.storage.as_ref()).await {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "failed to load game");
                return None;
            }
        };

        let mut recovered = false;
        for conversation in state.conversations.values_mut() {
            if matches!(
                conversation.phase,
                ConversationPhase::ChoiceApplied | ConversationPhase::GeneratingResponse
            ) {
                warn!(character = %conversation.character_id, "recovering interrupted reply");
                install_retry(conversation);
                recovered = true;
            }
        }

        self.abort_pending();
        let mut guard = self.inner.state.lock().await;
        if recovered {
            self.persist(&state).await;
        }
        info!(player = %state.player_name, "loaded game");
        *guard = Some(state.clone());
        Some(state)
    }

    /// Persist the current game. Failures are logged, not returned.
    pub async fn save_game(&self) {
        let mut guard = self.inner.state.lock().await;
        if let Some(state) = guard.as_mut() {
            state.touch();
            self.persist(state).await;
        }
    }

    /// Drop the game and its save.
    pub async fn reset_game(&self) -> Result<(), StoryError> {
        self.abort_pending();
        let mut guard = self.inner.state.lock().await;
        storage::clear_game(self.inner.storage.as_ref()).await?;
        *guard = None;
        info!("game reset");
        Ok(())
    }

    async fn persist(&self, state: &GameState) {
        if let Err(e) = storage::save_game(self.inner.storage.as_ref(), state).await {
            error!(error = %e, "failed to save game");
        }
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Open (or return) the conversation with a character.
    ///
    /// A new conversation gets the static opening right away; the provider
    /// may replace it in the background until the player first replies.
    pub async fn start_conversation(
        &self,
        character_id: &str,
    ) -> Result<ConversationState, StoryError> {
        let (conversation, context) = {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;

            let character = state
                .characters
                .get(character_id)
                .filter(|c| c.is_unlocked)
                .cloned()
                .ok_or_else(|| StoryError::CharacterUnavailable(character_id.to_string()))?;

            if let Some(existing) = state.conversations.get(character_id) {
                return Ok(existing.clone());
            }

            let opening = fallback::opening_message(character_id, &state.player_name);
            let conversation = ConversationState {
                character_id: character_id.to_string(),
                messages: vec![Message::from_character(character_id, opening)],
                current_scene_id: "opening".to_string(),
                available_choices: fallback::opening_choices(character_id)
                    .into_iter()
                    .map(|draft| draft.into_choice(character_id))
                    .collect(),
                phase: ConversationPhase::AwaitingChoice,
                pending_reply: None,
            };

            let context = StoryContext::opening(state, &character);
            state
                .conversations
                .insert(character_id.to_string(), conversation.clone());
            state.touch();
            self.persist(state).await;
            (conversation, context)
        };

        debug!(character = character_id, "conversation opened");
        self.notify(character_id, UpdateKind::Opened);

        if self.inner.narrator.is_ready() {
            let service = self.clone();
            let id = character_id.to_string();
            let handle = tokio::spawn(async move {
                service.enhance_opening(&id, context).await;
            });
            self.track(character_id, handle);
        }

        Ok(conversation)
    }

    async fn enhance_opening(&self, character_id: &str, context: StoryContext) {
        let text = self.inner.narrator.generate_opening(&context).await;
        let choices = self
            .inner
            .narrator
            .generate_choices(&context, character_id)
            .await;

        let mut guard = self.inner.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return;
        };
        let Some(conversation) = state.conversations.get_mut(character_id) else {
            return;
        };
        if conversation.player_has_replied()
            || conversation.phase != ConversationPhase::AwaitingChoice
        {
            debug!(character = character_id, "player already replied, keeping opening");
            return;
        }

        let mut updated = false;
        if fallback::is_usable_opening(&text) {
            if let Some(first) = conversation
                .messages
                .iter_mut()
                .find(|m| !m.is_from_player())
            {
                first.text = text;
                updated = true;
            }
        }
        if !choices.is_empty() {
            conversation.available_choices = choices
                .into_iter()
                .map(|draft| draft.into_choice(character_id))
                .collect();
            updated = true;
        }

        if updated {
            self.persist(state).await;
            drop(guard);
            info!(character = character_id, "opening enhanced");
            self.notify(character_id, UpdateKind::OpeningEnhanced);
        }
    }

    /// Apply a player choice and schedule the character's reply.
    pub async fn make_choice(
        &self,
        character_id: &str,
        choice_id: &str,
    ) -> Result<ConversationState, StoryError> {
        let (conversation, consequence, token) = {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
            let premium = state.is_premium();

            let conversation = state
                .conversations
                .get_mut(character_id)
                .ok_or_else(|| StoryError::ConversationNotFound(character_id.to_string()))?;
            let choice = conversation
                .find_choice(choice_id)
                .cloned()
                .ok_or_else(|| StoryError::ChoiceNotFound(choice_id.to_string()))?;
            if choice.is_paywall_locked && !premium {
                return Err(StoryError::ChoiceLocked(choice_id.to_string()));
            }

            conversation.messages.push(Message::from_player(&choice.text));
            conversation.available_choices.clear();
            let typing = Message::typing(character_id);
            let token = typing.id.clone();
            conversation.messages.push(typing);
            conversation.phase = ConversationPhase::ChoiceApplied;
            conversation.pending_reply = Some(token.clone());
            let snapshot = conversation.clone();

            for (id, delta) in &choice.relationship_effect {
                if !state.adjust_relationship(id, *delta) {
                    debug!(character = %id, "ignoring effect on unknown character");
                }
            }
            for id in &choice.unlock_characters {
                if state.unlock(id) {
                    info!(character = %id, "character unlocked");
                }
            }
            if let Some(event) = &choice.trigger_event {
                state.global_flags.insert(event.clone(), true);
            }

            state.touch();
            self.persist(state).await;
            (snapshot, choice.consequence, token)
        };

        info!(character = character_id, choice = choice_id, "choice applied");
        self.notify(character_id, UpdateKind::ChoiceApplied);
        self.schedule_response(character_id.to_string(), consequence, token);
        Ok(conversation)
    }

    fn schedule_response(&self, character_id: String, consequence: String, token: String) {
        let service = self.clone();
        let id = character_id.clone();
        let handle = tokio::spawn(async move {
            let delay = service.inner.response_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let worker = service.clone();
            let worker_id = id.clone();
            let worker_token = token.clone();
            let mut task = AbortOnDrop(tokio::spawn(async move {
                worker
                    .generate_response(&worker_id, &consequence, &worker_token)
                    .await
            }));

            match (&mut task.0).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(character = %id, error = %e, "error generating response");
                    service.fail_response(&id, &token).await;
                }
                Err(e) => {
                    error!(character = %id, error = %e, "response task aborted");
                    service.fail_response(&id, &token).await;
                }
            }
        });
        self.track(&character_id, handle);
    }

    /// Each lock section re-checks that the conversation still waits on
    /// `token`; a new game, a reload or a replaced conversation drops the reply.
    async fn generate_response(
        &self,
        character_id: &str,
        consequence: &str,
        token: &str,
    ) -> Result<(), StoryError> {
        let context = {
            let mut guard = self.inner.state.lock().await;
            let Some(state) = guard.as_mut() else {
                return Ok(());
            };
            let character = state
                .characters
                .get(character_id)
                .cloned()
                .ok_or_else(|| StoryError::CharacterUnavailable(character_id.to_string()))?;
            let Some(conversation) =
                awaiting_reply(state, character_id, token, ConversationPhase::ChoiceApplied)
            else {
                debug!(character = character_id, "stale response task");
                return Ok(());
            };
            conversation.phase = ConversationPhase::GeneratingResponse;

            let conversation = &state.conversations[character_id];
            StoryContext::for_response(state, conversation, &character, consequence)
        };

        let generated = self.inner.narrator.generate_response(&context).await;

        let choice_context = {
            let mut guard = self.inner.state.lock().await;
            let Some(state) = guard.as_mut() else {
                return Ok(());
            };
            let character = state
                .characters
                .get(character_id)
                .cloned()
                .ok_or_else(|| StoryError::CharacterUnavailable(character_id.to_string()))?;
            let Some(conversation) =
                awaiting_reply(state, character_id, token, ConversationPhase::GeneratingResponse)
            else {
                debug!(character = character_id, "dropping reply for a replaced conversation");
                return Ok(());
            };

            conversation.remove_typing();
            let text = if fallback::is_unusable_response(&generated) {
                warn!(character = character_id, response = %generated, "invalid response, using fallback");
                fallback::response_text(character_id).to_string()
            } else {
                generated.clone()
            };
            conversation
                .messages
                .push(Message::from_character(character_id, text));

            let conversation = &state.conversations[character_id];
            let mut context = StoryContext::for_response(state, conversation, &character, consequence);
            context.last_ai_response = Some(generated);
            context
        };

        let drafts = self
            .inner
            .narrator
            .generate_choices(&choice_context, character_id)
            .await;

        let mut guard = self.inner.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        let Some(conversation) =
            awaiting_reply(state, character_id, token, ConversationPhase::GeneratingResponse)
        else {
            debug!(character = character_id, "dropping choices for a replaced conversation");
            return Ok(());
        };
        conversation.available_choices = drafts
            .into_iter()
            .map(|draft| draft.into_choice(character_id))
            .collect();
        conversation.phase = ConversationPhase::AwaitingChoice;
        conversation.pending_reply = None;

        let chapter = chapter_for_messages(state.total_messages());
        if chapter > state.current_chapter {
            info!(chapter, "chapter advanced");
            state.current_chapter = chapter;
        }
        state.touch();
        self.persist(state).await;
        drop(guard);

        self.notify(character_id, UpdateKind::ResponseReady);
        Ok(())
    }

    async fn fail_response(&self, character_id: &str, token: &str) {
        let mut guard = self.inner.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return;
        };
        let Some(conversation) = state
            .conversations
            .get_mut(character_id)
            .filter(|c| c.pending_reply.as_deref() == Some(token))
        else {
            return;
        };
        install_retry(conversation);
        self.persist(state).await;
        drop(guard);
        self.notify(character_id, UpdateKind::ResponseFailed);
    }

    /// Replace a conversation wholesale.
    pub async fn update_conversation(
        &self,
        character_id: &str,
        conversation: ConversationState,
    ) -> Result<(), StoryError> {
        {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
            state
                .conversations
                .insert(character_id.to_string(), conversation);
            state.touch();
            self.persist(state).await;
        }
        self.notify(character_id, UpdateKind::Updated);
        Ok(())
    }

    /// Mark every character message in a conversation as read.
    pub async fn mark_messages_read(&self, character_id: &str) -> Result<(), StoryError> {
        let changed = {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
            let conversation = state
                .conversations
                .get_mut(character_id)
                .ok_or_else(|| StoryError::ConversationNotFound(character_id.to_string()))?;
            let changed = conversation.mark_read();
            if changed {
                self.persist(state).await;
            }
            changed
        };
        if changed {
            self.notify(character_id, UpdateKind::Updated);
        }
        Ok(())
    }

    /// Deliver an authored scene into its character's conversation.
    ///
    /// Returns the scene's emotion overlay, if any.
    pub async fn play_scene(&self, scene: &StoryScene) -> Result<Option<EmotionOverlay>, StoryError> {
        {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;

            let unlocked = state
                .characters
                .get(&scene.character_id)
                .map(|c| c.is_unlocked)
                .unwrap_or(false);
            if !unlocked {
                return Err(StoryError::CharacterUnavailable(scene.character_id.clone()));
            }
            if !scene.is_available(state) || state.completed_scenes.contains(&scene.id) {
                return Err(StoryError::SceneUnavailable(scene.id.clone()));
            }
            if matches!(
                state.phase(&scene.character_id),
                ConversationPhase::ChoiceApplied | ConversationPhase::GeneratingResponse
            ) {
                return Err(StoryError::SceneUnavailable(scene.id.clone()));
            }

            let conversation = state
                .conversations
                .entry(scene.character_id.clone())
                .or_insert_with(|| ConversationState {
                    character_id: scene.character_id.clone(),
                    messages: Vec::new(),
                    current_scene_id: scene.id.clone(),
                    available_choices: Vec::new(),
                    phase: ConversationPhase::AwaitingChoice,
                    pending_reply: None,
                });

            for line in &scene.messages {
                let mut message = Message::from_character(&line.sender_id, &line.text);
                message.kind = line.kind;
                message.image_url = line.image_url.clone();
                message.is_read = message.is_from_player();
                conversation.messages.push(message);
            }
            conversation.available_choices = scene.choices.clone();
            conversation.current_scene_id = scene.id.clone();
            conversation.phase = ConversationPhase::AwaitingChoice;

            state.completed_scenes.push(scene.id.clone());
            state.touch();
            self.persist(state).await;
        }

        info!(scene = %scene.id, character = %scene.character_id, "scene delivered");
        self.notify(&scene.character_id, UpdateKind::SceneDelivered);
        Ok(scene.emotion_overlay.clone())
    }

    /// Append an image message from a character.
    pub async fn share_image(
        &self,
        character_id: &str,
        caption: &str,
        prompt: &str,
    ) -> Result<Message, StoryError> {
        {
            let guard = self.inner.state.lock().await;
            let state = guard.as_ref().ok_or(StoryError::NotInitialized)?;
            if !state.conversations.contains_key(character_id) {
                return Err(StoryError::ConversationNotFound(character_id.to_string()));
            }
        }

        let url = self.inner.images.generate_image(prompt).await;
        let message = Message::image(character_id, caption, url);

        {
            let mut guard = self.inner.state.lock().await;
            let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
            let conversation = state
                .conversations
                .get_mut(character_id)
                .ok_or_else(|| StoryError::ConversationNotFound(character_id.to_string()))?;
            conversation.messages.push(message.clone());
            self.persist(state).await;
        }

        self.notify(character_id, UpdateKind::ImageShared);
        Ok(message)
    }

    // ========================================================================
    // Characters and flags
    // ========================================================================

    /// Make a character reachable. Unknown ids are ignored.
    pub async fn unlock_character(&self, character_id: &str) -> Result<(), StoryError> {
        let mut guard = self.inner.state.lock().await;
        let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
        if state.unlock(character_id) {
            info!(character = character_id, "character unlocked");
            self.persist(state).await;
        }
        Ok(())
    }

    /// Grant or revoke access to paywalled choices.
    pub async fn set_premium(&self, premium: bool) -> Result<(), StoryError> {
        let mut guard = self.inner.state.lock().await;
        let state = guard.as_mut().ok_or(StoryError::NotInitialized)?;
        state.global_flags.insert(PREMIUM_FLAG.to_string(), premium);
        self.persist(state).await;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of the whole game.
    pub async fn game_state(&self) -> Option<GameState> {
        self.inner.state.lock().await.clone()
    }

    pub async fn conversation(&self, character_id: &str) -> Option<ConversationState> {
        self.inner
            .state
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.conversations.get(character_id).cloned())
    }

    /// Phase of a conversation; `NotStarted` when there is none.
    pub async fn phase(&self, character_id: &str) -> ConversationPhase {
        self.inner
            .state
            .lock()
            .await
            .as_ref()
            .map(|s| s.phase(character_id))
            .unwrap_or(ConversationPhase::NotStarted)
    }

    /// Story stage of a conversation by its message count.
    pub async fn story_stage(&self, character_id: &str) -> StoryStage {
        let count = self
            .conversation(character_id)
            .await
            .map(|c| c.messages.iter().filter(|m| !m.is_typing).count())
            .unwrap_or(0);
        StoryStage::from_message_count(count)
    }

    pub fn relationship_tier(level: i32) -> RelationshipTier {
        RelationshipTier::from_level(level)
    }

    pub async fn progress_summary(&self) -> Option<ProgressSummary> {
        let guard = self.inner.state.lock().await;
        let state = guard.as_ref()?;

        let relationships = state
            .unlocked_characters()
            .into_iter()
            .map(|character| {
                let score = state.relationship_score(&character.id);
                RelationshipSummary {
                    character_id: character.id.clone(),
                    name: character.name.clone(),
                    score,
                    status: RelationshipStatus::from_score(score),
                    meter: relationship_meter(score),
                }
            })
            .collect();

        Some(ProgressSummary {
            player_name: state.player_name.clone(),
            chapter: state.current_chapter,
            play_time: format_play_time(state.play_time()),
            contacts_unlocked: state.unlocked_characters().len(),
            contacts_total: state.characters.len(),
            scenes_completed: state.completed_scenes.len(),
            total_messages: state.total_messages(),
            relationships,
        })
    }

    // ========================================================================
    // Notifications and background work
    // ========================================================================

    /// Receive an update after every conversation change. Drop to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.inner.updates.subscribe()
    }

    fn notify(&self, character_id: &str, kind: UpdateKind) {
        // No receivers is fine.
        let _ = self.inner.updates.send(ConversationUpdate {
            character_id: character_id.to_string(),
            kind,
        });
    }

    fn track(&self, character_id: &str, handle: JoinHandle<()>) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handles = pending.entry(character_id.to_string()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn take_pending(&self, character_id: Option<&str>) -> Vec<JoinHandle<()>> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match character_id {
            Some(id) => pending.remove(id).unwrap_or_default(),
            None => pending.drain().flat_map(|(_, handles)| handles).collect(),
        }
    }

    fn abort_pending(&self) {
        for handle in self.take_pending(None) {
            handle.abort();
        }
    }

    /// Wait for background work on a conversation to finish.
    pub async fn wait_for_pending(&self, character_id: &str) {
        loop {
            let handles = self.take_pending(Some(character_id));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    debug!(character = character_id, error = %e, "background task ended early");
                }
            }
        }
    }

    /// Wait for all background work.
    pub async fn wait_for_all_pending(&self) {
        loop {
            let handles = self.take_pending(None);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    debug!(error = %e, "background task ended early");
                }
            }
        }
    }
}

impl std::fmt::Debug for StoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryService")
            .field("narrator", &self.inner.narrator)
            .field("images", &self.inner.images)
            .field("response_delay", &self.inner.response_delay)
            .finish()
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The conversation, if it is in `phase` and still waiting on `token`.
fn awaiting_reply<'a>(
    state: &'a mut GameState,
    character_id: &str,
    token: &str,
    phase: ConversationPhase,
) -> Option<&'a mut ConversationState> {
    state
        .conversations
        .get_mut(character_id)
        .filter(|c| c.phase == phase && c.pending_reply.as_deref() == Some(token))
}

/// Error message plus the single retry choice.
fn install_retry(conversation: &mut ConversationState) {
    let character_id = conversation.character_id.clone();
    conversation.remove_typing();
    conversation
        .messages
        .push(Message::from_character(&character_id, fallback::ERROR_MESSAGE));
    conversation.available_choices = vec![fallback::retry_choice(&character_id)];
    conversation.phase = ConversationPhase::AwaitingChoice;
    conversation.pending_reply = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Choice, SceneMessage};
    use crate::provider::TextGenerator;
    use crate::storage::MemoryStorage;
    use crate::testing::{ScriptedGenerator, TestHarness};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Fails until armed; once armed, holds each call until the gate opens.
    #[derive(Default)]
    struct GatedGenerator {
        armed: AtomicBool,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl TextGenerator for GatedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<Option<String>, genai::Error> {
            if !self.armed.load(Ordering::SeqCst) {
                return Err(genai::Error::Network("gate closed".to_string()));
            }
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(Some("A reply for a conversation that is gone".to_string()))
        }

        fn name(&self) -> &str {
            "gated"
        }

        fn is_ready(&self) -> bool {
            true
        }
    }

    fn gated_service(generator: Arc<GatedGenerator>) -> StoryService {
        StoryService::build(
            Narrator::new(generator),
            Arc::new(MemoryStorage::new()),
            ImageProvider::placeholder(),
            Duration::ZERO,
        )
    }

    /// Choose the first reply and wait until its generation is blocked on the gate.
    async fn choose_and_block(service: &StoryService, generator: &GatedGenerator) {
        service.wait_for_pending("alex").await;
        generator.armed.store(true, Ordering::SeqCst);
        let choice = service.conversation("alex").await.unwrap().available_choices[0]
            .id
            .clone();
        service.make_choice("alex", &choice).await.unwrap();
        generator.entered.notified().await;
        generator.armed.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_operations_require_game() {
        let harness = TestHarness::new();
        let service = &harness.service;

        assert!(matches!(
            service.start_conversation("alex").await,
            Err(StoryError::NotInitialized)
        ));
        assert!(matches!(
            service.make_choice("alex", "x").await,
            Err(StoryError::NotInitialized)
        ));
        assert_eq!(service.phase("alex").await, ConversationPhase::NotStarted);
        assert!(service.progress_summary().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_opens_alex() {
        let harness = TestHarness::new();
        let state = harness.service.initialize_game("Sam").await.unwrap();

        let alex = &state.conversations["alex"];
        assert_eq!(alex.phase, ConversationPhase::AwaitingChoice);
        assert_eq!(
            alex.messages[0].text,
            "Hey Sam! Something strange is happening in town..."
        );
        assert_eq!(alex.available_choices.len(), 4);
        assert_eq!(alex.available_choices[3].text, "What's going on?");
    }

    #[tokio::test]
    async fn test_locked_character_rejected() {
        let harness = TestHarness::new();
        harness.service.initialize_game("Sam").await.unwrap();

        assert!(matches!(
            harness.service.start_conversation("maya").await,
            Err(StoryError::CharacterUnavailable(id)) if id == "maya"
        ));
        assert!(matches!(
            harness.service.start_conversation("nobody").await,
            Err(StoryError::CharacterUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_choice_rejected() {
        let harness = TestHarness::new();
        harness.service.initialize_game("Sam").await.unwrap();

        assert!(matches!(
            harness.service.make_choice("alex", "choice_missing").await,
            Err(StoryError::ChoiceNotFound(_))
        ));
        assert!(matches!(
            harness.service.make_choice("maya", "choice_missing").await,
            Err(StoryError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paywalled_choice_requires_premium() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        let mut conversation = service.conversation("alex").await.unwrap();
        let locked = Choice::new("Read her diary", "learns a secret")
            .with_effect("alex", 1)
            .paywalled();
        let locked_id = locked.id.clone();
        conversation.available_choices = vec![locked];
        service.update_conversation("alex", conversation).await.unwrap();

        assert!(matches!(
            service.make_choice("alex", &locked_id).await,
            Err(StoryError::ChoiceLocked(_))
        ));

        service.set_premium(true).await.unwrap();
        service.make_choice("alex", &locked_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_flow_applies_effects() {
        let harness = TestHarness::with_generator(ScriptedGenerator::new());
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        harness.generator.push_text("Meet me at the old diner. Come alone.");
        harness.generator.push_text(
            r#"[{"text": "On my way", "consequence": "agrees to meet", "relationshipEffect": {"alex": 2}}]"#,
        );

        let choice = service.conversation("alex").await.unwrap().available_choices[2].clone();
        assert_eq!(choice.text, "I'm here to help");

        let after = service.make_choice("alex", &choice.id).await.unwrap();
        assert_eq!(after.phase, ConversationPhase::ChoiceApplied);
        assert!(after.is_typing());
        assert!(after.available_choices.is_empty());

        service.wait_for_pending("alex").await;
        let conversation = service.conversation("alex").await.unwrap();
        assert_eq!(conversation.phase, ConversationPhase::AwaitingChoice);
        assert!(!conversation.is_typing());
        assert_eq!(
            conversation.last_message().unwrap().text,
            "Meet me at the old diner. Come alone."
        );
        assert_eq!(conversation.available_choices[0].text, "On my way");

        let state = service.game_state().await.unwrap();
        assert_eq!(state.relationship_score("alex"), 2);
        assert_eq!(state.characters["alex"].relationship_level, 2);
    }

    #[tokio::test]
    async fn test_unlock_and_trigger() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        let mut conversation = service.conversation("alex").await.unwrap();
        let choice = Choice::new("Call Maya", "brings in the physicist")
            .with_effect("maya", 1)
            .with_effect("ghost", 5)
            .with_unlock("maya")
            .with_trigger("called_maya");
        let choice_id = choice.id.clone();
        conversation.available_choices = vec![choice];
        service.update_conversation("alex", conversation).await.unwrap();

        service.make_choice("alex", &choice_id).await.unwrap();
        let state = service.game_state().await.unwrap();
        assert!(state.characters["maya"].is_unlocked);
        assert!(state.characters["maya"].is_online);
        assert_eq!(state.relationship_score("maya"), 1);
        assert!(!state.relationship_scores.contains_key("ghost"));
        assert!(state.flag("called_maya"));

        service.start_conversation("maya").await.unwrap();
    }

    #[tokio::test]
    async fn test_enhancement_ignored_after_reply() {
        let harness = TestHarness::new();
        let service = &harness.service;
        let state = service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        let choice_id = service.conversation("alex").await.unwrap().available_choices[0]
            .id
            .clone();
        service.make_choice("alex", &choice_id).await.unwrap();
        service.wait_for_pending("alex").await;
        let before = service.conversation("alex").await.unwrap();

        harness
            .generator
            .push_text("A much better opening line than the static one.");
        let context = StoryContext::opening(&state, &state.characters["alex"]);
        service.enhance_opening("alex", context).await;

        assert_eq!(service.conversation("alex").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_generation_offers_retry() {
        let harness = TestHarness::with_generator(ScriptedGenerator::new());
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        harness.generator.push_panic();
        let choice_id = service.conversation("alex").await.unwrap().available_choices[0]
            .id
            .clone();
        service.make_choice("alex", &choice_id).await.unwrap();
        service.wait_for_pending("alex").await;

        let conversation = service.conversation("alex").await.unwrap();
        assert_eq!(conversation.phase, ConversationPhase::AwaitingChoice);
        assert!(!conversation.is_typing());
        assert_eq!(
            conversation.last_message().unwrap().text,
            fallback::ERROR_MESSAGE
        );
        assert_eq!(conversation.available_choices.len(), 1);
        assert_eq!(conversation.available_choices[0].text, "Try again");
    }

    #[tokio::test]
    async fn test_play_scene_once() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        let scene = StoryScene {
            id: "static_call".to_string(),
            character_id: "alex".to_string(),
            trigger: "radio".to_string(),
            messages: vec![SceneMessage {
                sender_id: "alex".to_string(),
                text: "Do you hear that static?".to_string(),
                kind: Default::default(),
                image_url: None,
            }],
            choices: vec![Choice::new("Yes", "hears it").with_effect("alex", 1)],
            unlock_conditions: vec![],
            emotion_overlay: Some(EmotionOverlay {
                text: "Dread".to_string(),
                duration_ms: 1200,
                character: "alex".to_string(),
            }),
        };

        let overlay = service.play_scene(&scene).await.unwrap();
        assert_eq!(overlay.unwrap().text, "Dread");

        let conversation = service.conversation("alex").await.unwrap();
        assert_eq!(conversation.current_scene_id, "static_call");
        assert_eq!(conversation.available_choices[0].text, "Yes");

        assert!(matches!(
            service.play_scene(&scene).await,
            Err(StoryError::SceneUnavailable(_))
        ));
        let summary = service.progress_summary().await.unwrap();
        assert_eq!(summary.scenes_completed, 1);
    }

    #[tokio::test]
    async fn test_share_image_appends_placeholder() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;
        let mut updates = service.subscribe();

        let message = service
            .share_image("alex", "Look at this", "a ghost in the window")
            .await
            .unwrap();
        assert_eq!(message.kind, crate::model::MessageKind::Image);
        assert!(message
            .image_url
            .as_deref()
            .unwrap()
            .starts_with("https://picsum.photos/400/600?random=6"));

        let conversation = service.conversation("alex").await.unwrap();
        assert_eq!(conversation.last_message().unwrap().id, message.id);
        assert_eq!(updates.recv().await.unwrap().kind, UpdateKind::ImageShared);

        assert!(matches!(
            service.share_image("maya", "x", "y").await,
            Err(StoryError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_and_summary() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;

        assert_eq!(service.conversation("alex").await.unwrap().unread_count(), 1);
        service.mark_messages_read("alex").await.unwrap();
        assert_eq!(service.conversation("alex").await.unwrap().unread_count(), 0);

        let summary = service.progress_summary().await.unwrap();
        assert_eq!(summary.player_name, "Sam");
        assert_eq!(summary.contacts_unlocked, 1);
        assert_eq!(summary.contacts_total, 3);
        assert_eq!(summary.relationships[0].status, RelationshipStatus::Neutral);
        assert_eq!(summary.relationships[0].meter, 50.0);
    }

    #[tokio::test]
    async fn test_reset_clears_save() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        assert!(!harness.storage.is_empty().await);

        service.reset_game().await.unwrap();
        assert!(service.game_state().await.is_none());
        assert!(harness.storage.is_empty().await);
        assert!(service.load_game().await.is_none());
    }

    #[test]
    fn test_relationship_tier() {
        assert_eq!(StoryService::relationship_tier(-11), RelationshipTier::Hostile);
        assert_eq!(StoryService::relationship_tier(30), RelationshipTier::Intimate);
    }

    #[tokio::test]
    async fn test_new_game_drops_reply_from_previous_game() {
        let generator = Arc::new(GatedGenerator::default());
        let service = gated_service(generator.clone());
        service.initialize_game("Old").await.unwrap();
        choose_and_block(&service, &generator).await;

        service.initialize_game("New").await.unwrap();
        service.wait_for_pending("alex").await;
        generator.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.wait_for_all_pending().await;

        let alex = service.conversation("alex").await.unwrap();
        let texts: Vec<&str> = alex.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["Hey New! Something strange is happening in town..."]);
        assert_eq!(alex.phase, ConversationPhase::AwaitingChoice);
        assert!(alex.pending_reply.is_none());
        assert!(!alex.available_choices.is_empty());
    }

    #[tokio::test]
    async fn test_replaced_conversation_drops_reply() {
        let generator = Arc::new(GatedGenerator::default());
        let service = gated_service(generator.clone());
        service.initialize_game("Sam").await.unwrap();
        choose_and_block(&service, &generator).await;

        let replacement = ConversationState {
            character_id: "alex".to_string(),
            messages: vec![Message::from_character("alex", "Let's start over.")],
            current_scene_id: "opening".to_string(),
            available_choices: vec![Choice::new("Okay", "restarts")],
            phase: ConversationPhase::AwaitingChoice,
            pending_reply: None,
        };
        service
            .update_conversation("alex", replacement.clone())
            .await
            .unwrap();

        generator.gate.notify_one();
        service.wait_for_pending("alex").await;

        assert_eq!(service.conversation("alex").await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn test_reply_with_unknown_token_is_ignored() {
        let harness = TestHarness::new();
        let service = &harness.service;
        service.initialize_game("Sam").await.unwrap();
        service.wait_for_pending("alex").await;
        harness.generator.push_text("This reply belongs to an older game.");

        service
            .generate_response("alex", "builds trust", "typing_old")
            .await
            .unwrap();
        service.fail_response("alex", "typing_old").await;

        let alex = service.conversation("alex").await.unwrap();
        assert_eq!(alex.messages.len(), 1);
        assert_eq!(alex.phase, ConversationPhase::AwaitingChoice);
        assert_eq!(harness.generator.remaining(), 1);
    }
}
