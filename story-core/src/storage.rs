//! Key-value persistence for the game-state blob.
//!
//! The engine only ever stores one value: a versioned [`SavedGame`] under
//! [`GAME_STATE_KEY`]. [`FileStorage`] keeps one JSON file per key in a
//! directory; [`MemoryStorage`] keeps everything in process.

use crate::model::GameState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

/// Key under which the game is stored.
pub const GAME_STATE_KEY: &str = "STORY_GAME_STATE";

/// Current save format version.
const SAVE_VERSION: u32 = 1;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Asynchronous string key-value store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

// ============================================================================
// Backends
// ============================================================================

/// Directory-backed storage: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        // Write to a sibling temp file, then rename into place.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// ============================================================================
// Saved game envelope
// ============================================================================

/// A saved game with everything needed to resume play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedGame {
    /// Save format version for compatibility checking.
    pub version: u32,

    pub saved_at: DateTime<Utc>,

    /// Summary readable without deserializing the whole state.
    pub metadata: SaveMetadata,

    pub state: GameState,
}

/// Quick-access summary of a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub player_name: String,
    pub current_chapter: u32,
    pub unlocked_contacts: usize,
    pub total_messages: usize,
    pub play_time_minutes: i64,
}

impl SavedGame {
    pub fn new(state: GameState) -> Self {
        let metadata = SaveMetadata {
            player_name: state.player_name.clone(),
            current_chapter: state.current_chapter,
            unlocked_contacts: state.unlocked_characters().len(),
            total_messages: state.total_messages(),
            play_time_minutes: state.play_time().num_minutes(),
        };

        Self {
            version: SAVE_VERSION,
            saved_at: Utc::now(),
            metadata,
            state,
        }
    }

    fn check_version(found: u32) -> Result<(), StorageError> {
        if found != SAVE_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: SAVE_VERSION,
                found,
            });
        }
        Ok(())
    }
}

/// Serialize and store the game.
pub async fn save_game(storage: &dyn Storage, state: &GameState) -> Result<(), StorageError> {
    let saved = SavedGame::new(state.clone());
    let content = serde_json::to_string_pretty(&saved)?;
    storage.set(GAME_STATE_KEY, &content).await
}

/// Load the stored game, if any.
pub async fn load_game(storage: &dyn Storage) -> Result<Option<GameState>, StorageError> {
    let Some(content) = storage.get(GAME_STATE_KEY).await? else {
        return Ok(None);
    };
    let saved: SavedGame = serde_json::from_str(&content)?;
    SavedGame::check_version(saved.version)?;
    Ok(Some(saved.state))
}

/// Read only the save summary.
pub async fn peek_metadata(storage: &dyn Storage) -> Result<Option<SaveMetadata>, StorageError> {
    #[derive(Deserialize)]
    struct Partial {
        version: u32,
        metadata: SaveMetadata,
    }

    let Some(content) = storage.get(GAME_STATE_KEY).await? else {
        return Ok(None);
    };
    let partial: Partial = serde_json::from_str(&content)?;
    SavedGame::check_version(partial.version)?;
    Ok(Some(partial.metadata))
}

/// Delete the stored game.
pub async fn clear_game(storage: &dyn Storage) -> Result<(), StorageError> {
    storage.remove(GAME_STATE_KEY).await
}
