//! Chat story engine with AI-driven characters.
//!
//! This crate provides:
//! - The game model (characters, conversations, choices, scenes)
//! - A conversation state machine with relationship and unlock effects
//! - AI narration with cleanup and static fallbacks
//! - Versioned persistence of the whole game
//!
//! # Quick Start
//!
//! ```ignore
//! use story_core::{StoryConfig, StoryService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = StoryService::from_config(&StoryConfig::from_env());
//!
//!     if service.load_game().await.is_none() {
//!         service.initialize_game("Sam").await?;
//!     }
//!
//!     let alex = service.conversation("alex").await.expect("opened on start");
//!     service.make_choice("alex", &alex.available_choices[0].id).await?;
//!     service.wait_for_pending("alex").await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod fallback;
pub mod images;
pub mod model;
pub mod narrator;
pub mod progress;
pub mod provider;
pub mod service;
pub mod storage;
pub mod testing;

// Primary public API
pub use config::StoryConfig;
pub use model::{
    Character, CharacterRole, Choice, ConversationPhase, ConversationState, GameState, Message,
    MessageKind, StoryScene,
};
pub use narrator::{ChoiceDraft, Narrator, StoryContext};
pub use progress::{RelationshipStatus, RelationshipTier, StoryStage};
pub use provider::{ProviderKind, TextGenerator};
pub use service::{
    ConversationUpdate, ProgressSummary, StoryError, StoryService, UpdateKind,
};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use testing::{ScriptedGenerator, TestHarness};
