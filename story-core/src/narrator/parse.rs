//! Cleanup of free-form provider output.

use super::ChoiceDraft;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Largest relationship swing a single generated choice may carry.
const MAX_EFFECT: i32 = 3;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[^`]*```").expect("invalid fenced block regex"));
static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*").expect("invalid json fence regex"));
static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```\s*").expect("invalid fence regex"));
static EDGE_QUOTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^["']|["']$"#).expect("invalid quote regex"));
static JSON_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("invalid array regex"));

/// Strip code fences and wrapping quotes from narrative text.
pub fn clean_story_text(raw: &str) -> String {
    let text = raw.trim();
    let text = FENCED_BLOCK.replace_all(text, "");
    let text = text.replace("```", "");
    let text = EDGE_QUOTES.replace_all(&text, "");
    text.trim().to_string()
}

/// Pull a choice list out of a provider reply.
///
/// Returns `None` when nothing usable is found; the caller falls back.
pub fn parse_choices(raw: &str, character_id: &str) -> Option<Vec<ChoiceDraft>> {
    let text = raw.trim();
    let text = JSON_FENCE.replace_all(text, "");
    let text = ANY_FENCE.replace_all(&text, "");
    let json = JSON_ARRAY
        .find(&text)
        .map(|m| m.as_str())
        .unwrap_or(&text[..]);

    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, raw = %raw, "failed to parse choices JSON");
            return None;
        }
    };

    let drafts: Vec<ChoiceDraft> = value
        .as_array()?
        .iter()
        .filter_map(|item| draft_from_value(item, character_id))
        .collect();

    if drafts.is_empty() {
        None
    } else {
        Some(drafts)
    }
}

fn draft_from_value(item: &Value, character_id: &str) -> Option<ChoiceDraft> {
    let object = item.as_object()?;

    let text = non_empty_str(object.get("text")).unwrap_or("Continue...");
    let consequence = non_empty_str(object.get("consequence")).unwrap_or("neutral response");

    let mut draft = ChoiceDraft::new(text, consequence);
    let effects = object
        .get("relationshipEffect")
        .or_else(|| object.get("relationship_effect"))
        .and_then(Value::as_object);

    if let Some(effects) = effects {
        for (id, delta) in effects {
            if let Some(delta) = delta.as_f64() {
                let delta = (delta.round() as i32).clamp(-MAX_EFFECT, MAX_EFFECT);
                draft = draft.with_effect(id.as_str(), delta);
            }
        }
    }

    if draft.relationship_effect.is_empty() {
        draft = draft.with_effect(character_id, 0);
    }

    Some(draft)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
