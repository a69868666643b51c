//! Save/load tests.
//!
//! These verify that the game blob survives restarts, both through
//! in-memory storage and through save files on disk.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use story_core::images::ImageProvider;
use story_core::model::{ConversationPhase, Message};
use story_core::storage::{self, peek_metadata, GAME_STATE_KEY};
use story_core::testing::{
    assert_choice_offered, assert_last_message, assert_phase, ScriptedGenerator, TestHarness,
};
use story_core::{FileStorage, MemoryStorage, Narrator, Storage, StorageError, StoryService};
use tempfile::TempDir;

fn file_service(dir: &std::path::Path) -> StoryService {
    let narrator = Narrator::new(Arc::new(ScriptedGenerator::new()));
    StoryService::build(
        narrator,
        Arc::new(FileStorage::new(dir)),
        ImageProvider::placeholder(),
        Duration::ZERO,
    )
}

#[tokio::test]
async fn test_restart_restores_conversations() {
    let storage = Arc::new(MemoryStorage::new());

    let harness = TestHarness::with_storage(ScriptedGenerator::new(), storage.clone());
    harness.service.initialize_game("Sam").await.unwrap();
    harness.service.wait_for_pending("alex").await;
    harness.generator.push_text("Don't trust the mayor.");
    let before = harness.choose("alex", 2).await;

    let restarted = TestHarness::with_storage(ScriptedGenerator::new(), storage);
    let state = restarted.service.load_game().await.expect("save should load");

    assert_eq!(state.player_name, "Sam");
    assert_eq!(state.conversations["alex"], before);
    assert_eq!(state.relationship_score("alex"), 2);
    assert_eq!(
        restarted.service.conversation("alex").await.unwrap().messages[2].text,
        "Don't trust the mayor."
    );
}

#[tokio::test]
async fn test_file_save_survives_new_service() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let save_dir = temp_dir.path().join("saves");

    let service = file_service(&save_dir);
    service.initialize_game("Riley").await.unwrap();
    service.wait_for_pending("alex").await;
    service.unlock_character("maya").await.unwrap();
    service.set_premium(true).await.unwrap();

    assert!(save_dir.join("STORY_GAME_STATE.json").exists());

    let reloaded = file_service(&save_dir);
    let state = reloaded.load_game().await.expect("save should load");
    assert_eq!(state.player_name, "Riley");
    assert!(state.characters["maya"].is_unlocked);
    assert!(state.is_premium());

    let metadata = peek_metadata(&FileStorage::new(&save_dir))
        .await
        .unwrap()
        .expect("metadata");
    assert_eq!(metadata.unlocked_contacts, 2);
    assert_eq!(metadata.total_messages, 1);
}

#[tokio::test]
async fn test_interrupted_reply_recovers_with_retry() {
    let storage = Arc::new(MemoryStorage::new());
    let harness = TestHarness::with_storage(ScriptedGenerator::new(), storage.clone());
    let mut state = harness.service.initialize_game("Sam").await.unwrap();
    harness.service.wait_for_pending("alex").await;

    // Simulate a crash between the choice and the reply.
    let alex = state.conversations.get_mut("alex").unwrap();
    alex.messages.push(Message::from_player("I'm here to help"));
    alex.messages.push(Message::typing("alex"));
    alex.available_choices.clear();
    alex.phase = ConversationPhase::GeneratingResponse;
    storage::save_game(storage.as_ref(), &state).await.unwrap();

    let restarted = TestHarness::with_storage(ScriptedGenerator::new(), storage);
    restarted.service.load_game().await.expect("save should load");

    let alex = restarted.service.conversation("alex").await.unwrap();
    assert_phase(&alex, ConversationPhase::AwaitingChoice);
    assert!(!alex.is_typing());
    assert_choice_offered(&alex, "Try again");

    let alex = restarted.choose("alex", 0).await;
    assert_phase(&alex, ConversationPhase::AwaitingChoice);
    assert_eq!(alex.available_choices.len(), 4);
}

#[tokio::test]
async fn test_corrupt_save_loads_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(GAME_STATE_KEY, "{\"version\": 1").await.unwrap();

    let harness = TestHarness::with_storage(ScriptedGenerator::new(), storage);
    assert!(harness.service.load_game().await.is_none());
    assert!(harness.service.game_state().await.is_none());
}

#[tokio::test]
async fn test_save_game_stamps_last_played() {
    let harness = TestHarness::new();
    let state = harness.service.initialize_game("Sam").await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.service.save_game().await;

    let saved = storage::load_game(harness.storage.as_ref())
        .await
        .unwrap()
        .expect("state stored");
    assert!(saved.last_played > state.last_played);
}

/// Storage where every write fails.
struct ReadOnlyStorage;

#[async_trait]
impl Storage for ReadOnlyStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(std::io::Error::other("read-only file system").into())
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(std::io::Error::other("read-only file system").into())
    }
}

#[tokio::test]
async fn test_failed_writes_do_not_interrupt_play() {
    let generator = Arc::new(ScriptedGenerator::new());
    let service = StoryService::build(
        Narrator::new(generator.clone()),
        Arc::new(ReadOnlyStorage),
        ImageProvider::placeholder(),
        Duration::ZERO,
    );

    let state = service.initialize_game("Sam").await.unwrap();
    assert_phase(&state.conversations["alex"], ConversationPhase::AwaitingChoice);
    service.wait_for_pending("alex").await;

    generator.push_text("The lights just went out across the whole town.");
    let choice = service.conversation("alex").await.unwrap().available_choices[0]
        .id
        .clone();
    let applied = service.make_choice("alex", &choice).await.unwrap();
    assert_phase(&applied, ConversationPhase::ChoiceApplied);

    service.wait_for_pending("alex").await;
    let alex = service.conversation("alex").await.unwrap();
    assert_phase(&alex, ConversationPhase::AwaitingChoice);
    assert_last_message(&alex, "The lights just went out across the whole town.");
    assert!(!alex.available_choices.is_empty());

    service.save_game().await;
    service.mark_messages_read("alex").await.unwrap();
    assert!(service.game_state().await.is_some());
}
