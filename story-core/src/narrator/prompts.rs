//! Prompt assembly for narrative and choice generation.

use super::StoryContext;

/// Full narrative prompt: setting, serialized context, the specific ask, rules.
pub fn story_prompt(instruction: &str, context: &StoryContext) -> String {
    let mut prompt = String::new();
    prompt.push_str(include_str!("prompts/story_base.txt"));
    prompt.push_str("\nContext: ");
    prompt.push_str(&context.to_json());
    prompt.push_str("\n\nPrompt: ");
    prompt.push_str(instruction.trim());
    prompt.push_str("\n\n");
    prompt.push_str(include_str!("prompts/story_rules.txt"));
    prompt
}

/// Instruction for a character's first message.
pub fn opening_instruction(character_name: &str) -> String {
    format!(
        "Generate an opening message from {character_name} to start the story. \
         This is their first contact with the player."
    )
}

/// Instruction for a character's reply to a player choice.
pub fn continuation_instruction(character_name: &str, consequence: &str) -> String {
    format!(
        "Continue the interactive horror/romance story. {character_name} is responding to the player's choice. \
         Consequence: {consequence}. \
         Make the response engaging and advance the story. Reference previous conversation context. \
         Keep it under 120 characters for mobile chat."
    )
}

/// Prompt asking for a JSON array of choices.
pub fn choices_prompt(context: &StoryContext, character_id: &str) -> String {
    let history = serde_json::to_string(&context.conversation_history)
        .unwrap_or_else(|_| "[]".to_string());
    let last_response = context
        .last_ai_response
        .as_deref()
        .unwrap_or("No previous response");

    let mut prompt = String::new();
    prompt.push_str(
        "Generate 3-4 smart, contextual chat response choices for this interactive horror/romance story:\n\n",
    );
    prompt.push_str(&format!("Character: {}\n", context.character.name));
    prompt.push_str(&format!("Player: {}\n", context.player_name));
    prompt.push_str(&format!(
        "Relationship Level: {} ({})\n",
        context.relationship_level, context.relationship_tier
    ));
    prompt.push_str(&format!("Story Stage: {}\n", context.story_stage));
    prompt.push_str(&format!("Chapter: {}\n", context.chapter));
    prompt.push_str(&format!("Messages Exchanged: {}\n\n", context.total_messages));
    prompt.push_str(&format!("Last AI Response: \"{last_response}\"\n\n"));
    prompt.push_str(&format!("Conversation History: {history}\n\n"));
    prompt.push_str(include_str!("prompts/choice_rules.txt"));
    prompt.push_str("\nReturn as JSON array with format:\n");
    prompt.push_str(&format!(
        "[{{\n  \"text\": \"choice text (max 50 chars)\",\n  \"consequence\": \"specific story outcome description\",\n  \"relationshipEffect\": {{\"{character_id}\": number between -3 and 3}}\n}}]\n\n"
    ));
    prompt.push_str("Make each choice distinct and story-relevant.\n");
    prompt
}
