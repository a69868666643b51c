//! Chat story in the terminal.

mod headless;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use story_core::{ProviderKind, StoryConfig, StoryService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "story", version, about = "Interactive horror/romance chat story")]
struct Args {
    /// Player name for a new game.
    #[arg(long)]
    name: Option<String>,

    /// Directory holding the save file.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Text provider: openrouter or gemini.
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Unlock premium choices.
    #[arg(long)]
    premium: bool,

    /// Typing delay before each reply, in milliseconds.
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Ignore any existing save and start over.
    #[arg(long)]
    new_game: bool,

    /// Generate images with Hugging Face instead of placeholders.
    #[arg(long)]
    images: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,story_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = StoryConfig::from_env().with_image_generation(args.images);
    if let Some(provider) = args.provider {
        config = config.with_provider(provider);
    }
    if let Some(dir) = args.save_dir {
        config = config.with_save_dir(dir);
    }
    if let Some(ms) = args.delay_ms {
        config = config.with_response_delay(Duration::from_millis(ms));
    }

    info!(provider = %config.provider, save_dir = %config.save_dir.display(), "starting");
    let service = StoryService::from_config(&config);
    if !service.narrator().is_ready() {
        warn!(provider = %config.provider, "no API key configured, characters will improvise");
    }

    let loaded = if args.new_game {
        None
    } else {
        service.load_game().await
    };
    if loaded.is_none() {
        let name = args.name.unwrap_or_else(|| "Player".to_string());
        service.initialize_game(name).await?;
    }
    if args.premium {
        service.set_premium(true).await?;
    }

    headless::run_headless(service).await?;
    Ok(())
}
