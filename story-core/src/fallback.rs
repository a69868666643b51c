//! Static fallback content.
//!
//! Whenever a provider call fails, times out or returns garbage, the story
//! keeps moving with content from here. All of it is deterministic in its
//! inputs (character id, stage, player name).

use crate::model::Choice;
use crate::narrator::ChoiceDraft;
use crate::progress::StoryStage;

/// Returned when no provider key is configured.
pub const CONFIG_ERROR: &str = "Configuration error... check your API key.";

/// Returned on HTTP failure or timeout.
pub const CONNECTION_LOST: &str = "Connection lost... try again later.";

/// Returned when the provider answered without any text.
pub const EMPTY_RESPONSE: &str = "Something mysterious happened...";

/// Returned when cleanup left almost nothing.
pub const SIGNAL_FADES: &str = "The signal fades... strange...";

/// Chat message shown when response generation fails outright.
pub const ERROR_MESSAGE: &str = "Something went wrong... let me try again.";

type ChoiceRow = (&'static str, &'static str, i32);

const OPENING: [ChoiceRow; 4] = [
    ("Tell me more about this", "shows interest in character's story", 1),
    ("That sounds suspicious...", "character becomes more defensive", -1),
    ("I'm here to help", "builds trust with character", 2),
    ("What's going on?", "asks for more information", 0),
];

const BEGINNING: [ChoiceRow; 4] = [
    ("Tell me more about this", "shows interest in character's story", 1),
    ("That sounds suspicious...", "character becomes more defensive", -1),
    ("I'm here to help", "builds trust with character", 2),
    ("Why should I trust you?", "challenges character's motives", 0),
];

const DEVELOPING: [ChoiceRow; 4] = [
    ("What aren't you telling me?", "pushes for deeper truth", 0),
    ("I believe you", "strengthens bond", 2),
    ("This is getting dangerous", "shows concern", 1),
    ("Let's investigate together", "commits to shared adventure", 2),
];

const CLIMAX: [ChoiceRow; 4] = [
    ("We need to stop this now!", "takes decisive action", 1),
    ("I won't let anything happen to you", "protective declaration", 3),
    ("Maybe we should run...", "suggests retreat", -1),
    ("Trust me, I have a plan", "leads with confidence", 2),
];

const RESOLUTION: [ChoiceRow; 4] = [
    ("What happens now?", "seeks closure", 0),
    ("I'm glad we're safe", "expresses relief", 1),
    ("This isn't over, is it?", "hints at continuation", 0),
    ("Thank you for everything", "shows gratitude", 2),
];

fn drafts(rows: &[ChoiceRow], character_id: &str) -> Vec<ChoiceDraft> {
    rows.iter()
        .map(|(text, consequence, delta)| {
            ChoiceDraft::new(*text, *consequence).with_effect(character_id, *delta)
        })
        .collect()
}

/// First message a character sends when a conversation opens.
pub fn opening_message(character_id: &str, player_name: &str) -> String {
    match character_id {
        "alex" => format!("Hey {player_name}! Something strange is happening in town..."),
        _ => "Hello... I need to tell you something important.".to_string(),
    }
}

/// Choices offered alongside the opening message.
pub fn opening_choices(character_id: &str) -> Vec<ChoiceDraft> {
    drafts(&OPENING, character_id)
}

/// Stage-keyed choices used when AI choice generation fails.
pub fn stage_choices(stage: StoryStage, character_id: &str) -> Vec<ChoiceDraft> {
    let rows = match stage {
        StoryStage::Beginning => &BEGINNING,
        StoryStage::Developing => &DEVELOPING,
        StoryStage::Climax => &CLIMAX,
        StoryStage::Resolution => &RESOLUTION,
    };
    drafts(rows, character_id)
}

/// Character reply used when the AI narrative is unusable.
pub fn response_text(character_id: &str) -> &'static str {
    match character_id {
        "alex" => "That's... not what I expected. Let me think about this.",
        "maya" => "Interesting choice. The data suggests this could work.",
        _ => "Your choice has consequences... we'll see what happens.",
    }
}

/// The single choice offered after a failed response.
pub fn retry_choice(character_id: &str) -> Choice {
    Choice::new("Try again", "retry the conversation").with_effect(character_id, 0)
}

/// Whether generated narrative should be replaced by [`response_text`].
pub fn is_unusable_response(text: &str) -> bool {
    text.chars().count() < 5 || text.contains("Something went wrong")
}

/// Whether text is one of the narrator's failure sentinels.
pub fn is_sentinel(text: &str) -> bool {
    [CONFIG_ERROR, CONNECTION_LOST, EMPTY_RESPONSE, SIGNAL_FADES].contains(&text)
}

/// Whether generated opening text is good enough to replace the fallback opener.
pub fn is_usable_opening(text: &str) -> bool {
    text.chars().count() > 10 && !text.contains("Connection lost") && !is_sentinel(text)
}
