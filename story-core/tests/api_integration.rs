//! Integration tests that call the real text providers.
//!
//! These tests require OPENROUTER_API_KEY or GEMINI_API_KEY to be set (via .env
//! file or environment).
//! Run with: `cargo test -p story-core --test api_integration -- --ignored`
//!
//! These are marked #[ignore] by default to avoid API costs in CI and failures
//! when no key is available.

use std::sync::Arc;
use story_core::fallback;
use story_core::model::GameState;
use story_core::narrator::{Narrator, StoryContext};
use story_core::{ProviderKind, StoryConfig};

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

fn has_key(var: &str) -> bool {
    std::env::var(var).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn narrator_for(provider: ProviderKind) -> Narrator {
    let config = StoryConfig::from_env().with_provider(provider);
    Narrator::new(config.build_generator()).with_timeout(config.request_timeout)
}

async fn check_opening_and_choices(narrator: &Narrator) {
    let state = GameState::new("Sam");
    let context = StoryContext::opening(&state, &state.characters["alex"]);

    let opening = narrator.generate_opening(&context).await;
    println!("Opening: {opening}");
    assert!(!fallback::is_sentinel(&opening), "provider returned a sentinel");

    let choices = narrator.generate_choices(&context, "alex").await;
    for choice in &choices {
        println!("Choice: {} -> {} {:?}", choice.text, choice.consequence, choice.relationship_effect);
        for delta in choice.relationship_effect.values() {
            assert!((-3..=3).contains(delta));
        }
    }
    assert!(!choices.is_empty());
}

#[tokio::test]
#[ignore] // Run with: cargo test -p story-core --test api_integration -- --ignored
async fn test_openrouter_narration() {
    setup();
    if !has_key("OPENROUTER_API_KEY") {
        eprintln!("Skipping test: OPENROUTER_API_KEY not set");
        return;
    }

    check_opening_and_choices(&narrator_for(ProviderKind::OpenRouter)).await;
}

#[tokio::test]
#[ignore]
async fn test_gemini_narration() {
    setup();
    if !has_key("GEMINI_API_KEY") {
        eprintln!("Skipping test: GEMINI_API_KEY not set");
        return;
    }

    check_opening_and_choices(&narrator_for(ProviderKind::Gemini)).await;
}

#[tokio::test]
#[ignore]
async fn test_invalid_key_degrades_to_sentinel() {
    setup();
    let generator = Arc::new(genai::OpenRouter::new("sk-or-invalid"));
    let narrator = Narrator::new(generator);
    let state = GameState::new("Sam");
    let context = StoryContext::opening(&state, &state.characters["alex"]);

    assert_eq!(
        narrator.generate_opening(&context).await,
        fallback::CONNECTION_LOST
    );
}
