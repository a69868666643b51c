//! Heuristic progression buckets.
//!
//! None of these are enforced; they only bias fallback content, prompts and
//! the progress summary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Messages per chapter for the chapter heuristic.
const MESSAGES_PER_CHAPTER: usize = 30;

/// How far a single conversation has gone, by message count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStage {
    Beginning,
    Developing,
    Climax,
    Resolution,
}

impl StoryStage {
    pub fn from_message_count(count: usize) -> Self {
        match count {
            0..=5 => StoryStage::Beginning,
            6..=14 => StoryStage::Developing,
            15..=24 => StoryStage::Climax,
            _ => StoryStage::Resolution,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoryStage::Beginning => "beginning",
            StoryStage::Developing => "developing",
            StoryStage::Climax => "climax",
            StoryStage::Resolution => "resolution",
        }
    }
}

impl fmt::Display for StoryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relationship bucket used to bias AI prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipTier {
    Hostile,
    Unfriendly,
    Neutral,
    Friendly,
    Close,
    Intimate,
}

impl RelationshipTier {
    pub fn from_level(level: i32) -> Self {
        if level < -10 {
            RelationshipTier::Hostile
        } else if level < 0 {
            RelationshipTier::Unfriendly
        } else if level < 5 {
            RelationshipTier::Neutral
        } else if level < 15 {
            RelationshipTier::Friendly
        } else if level < 25 {
            RelationshipTier::Close
        } else {
            RelationshipTier::Intimate
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelationshipTier::Hostile => "hostile",
            RelationshipTier::Unfriendly => "unfriendly",
            RelationshipTier::Neutral => "neutral",
            RelationshipTier::Friendly => "friendly",
            RelationshipTier::Close => "close",
            RelationshipTier::Intimate => "intimate",
        }
    }
}

impl fmt::Display for RelationshipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Player-facing relationship label on the progress summary.
///
/// Uses different cut points than [`RelationshipTier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipStatus {
    Hostile,
    Distant,
    Neutral,
    Friendly,
    Close,
    VeryClose,
}

impl RelationshipStatus {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 15 => RelationshipStatus::VeryClose,
            s if s >= 10 => RelationshipStatus::Close,
            s if s >= 5 => RelationshipStatus::Friendly,
            s if s >= 0 => RelationshipStatus::Neutral,
            s if s >= -5 => RelationshipStatus::Distant,
            _ => RelationshipStatus::Hostile,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelationshipStatus::Hostile => "Hostile",
            RelationshipStatus::Distant => "Distant",
            RelationshipStatus::Neutral => "Neutral",
            RelationshipStatus::Friendly => "Friendly",
            RelationshipStatus::Close => "Close",
            RelationshipStatus::VeryClose => "Very Close",
        }
    }
}

impl fmt::Display for RelationshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Relationship meter fill in percent: -20 is empty, +20 is full.
pub fn relationship_meter(score: i32) -> f32 {
    ((score as f32 + 20.0) * 2.5).clamp(0.0, 100.0)
}

/// Chapter implied by the total number of messages exchanged.
pub fn chapter_for_messages(total_messages: usize) -> u32 {
    1 + (total_messages / MESSAGES_PER_CHAPTER) as u32
}

/// Format a play time as `1h 5m` or `12m`.
pub fn format_play_time(duration: chrono::Duration) -> String {
    let minutes_total = duration.num_minutes().max(0);
    let hours = minutes_total / 60;
    let minutes = minutes_total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
