//! Line-oriented front end.
//!
//! Protocol:
//! - A number picks that choice in the open conversation
//! - Lines starting with `#` are commands (contacts, open, status, premium, reset, quit)
//! - Everything printed is either chat transcript or a `[TAG]` status line

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use story_core::model::{MessageKind, PLAYER_ID};
use story_core::service::STARTING_CHARACTER;
use story_core::{ConversationUpdate, StoryError, StoryService, UpdateKind};
use tokio::sync::broadcast::{self, error::TryRecvError};

const HELP: &[&str] = &[
    "  <number>       - Pick a reply",
    "  #contacts      - List unlocked contacts",
    "  #open <id>     - Switch to a conversation",
    "  #status        - Show story progress",
    "  #premium on|off - Toggle premium choices",
    "  #reset         - Erase the save and start over",
    "  #help          - Show this help",
    "  #quit          - Exit",
];

struct Terminal {
    service: StoryService,
    current: String,
    /// Messages already printed, per conversation.
    shown: HashMap<String, usize>,
    updates: broadcast::Receiver<ConversationUpdate>,
}

/// Run the story on stdin/stdout until `#quit` or end of input.
pub async fn run_headless(service: StoryService) -> Result<(), StoryError> {
    let updates = service.subscribe();
    let mut terminal = Terminal {
        service,
        current: STARTING_CHARACTER.to_string(),
        shown: HashMap::new(),
        updates,
    };

    println!("=== Chat Story ===");
    println!("Commands:");
    for line in HELP {
        println!("{line}");
    }
    println!();

    terminal.open(STARTING_CHARACTER).await;

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('#') {
            let parts: Vec<&str> = command.split_whitespace().collect();
            match parts.first().copied() {
                Some("quit") | Some("exit") => {
                    terminal.service.save_game().await;
                    println!("Goodbye!");
                    break;
                }
                Some("contacts") => terminal.contacts().await,
                Some("open") => match parts.get(1) {
                    Some(id) => terminal.open(id).await,
                    None => println!("[ERROR] Usage: #open <id>"),
                },
                Some("status") => terminal.status().await,
                Some("premium") => match parts.get(1).copied() {
                    Some("on") => terminal.premium(true).await,
                    Some("off") => terminal.premium(false).await,
                    _ => println!("[ERROR] Usage: #premium on|off"),
                },
                Some("reset") => terminal.reset().await?,
                Some("help") => {
                    println!("[HELP]");
                    for line in HELP {
                        println!("{line}");
                    }
                }
                _ => println!("[ERROR] Unknown command. Type #help for help."),
            }
        } else {
            match line.parse::<usize>() {
                Ok(number) => terminal.choose(number).await,
                Err(_) => println!("[ERROR] Pick a reply by its number, or type #help."),
            }
        }

        terminal.notices();
        stdout.flush().ok();
    }

    Ok(())
}

impl Terminal {
    async fn name_of(&self, character_id: &str) -> String {
        self.service
            .game_state()
            .await
            .and_then(|s| s.characters.get(character_id).map(|c| c.name.clone()))
            .unwrap_or_else(|| character_id.to_string())
    }

    async fn open(&mut self, character_id: &str) {
        match self.service.start_conversation(character_id).await {
            Ok(_) => {
                self.current = character_id.to_string();
                let name = self.name_of(character_id).await;
                println!("[CHAT] {name}");
                self.service.wait_for_pending(character_id).await;
                self.print_new().await;
            }
            Err(e) => println!("[ERROR] {e}"),
        }
    }

    async fn choose(&mut self, number: usize) {
        let Some(conversation) = self.service.conversation(&self.current).await else {
            println!("[ERROR] No conversation open.");
            return;
        };
        let Some(choice) = number
            .checked_sub(1)
            .and_then(|i| conversation.available_choices.get(i))
        else {
            println!("[ERROR] No reply number {number}.");
            return;
        };

        if let Err(e) = self.service.make_choice(&self.current, &choice.id).await {
            println!("[ERROR] {e}");
            return;
        }
        self.print_new().await;

        let name = self.name_of(&self.current).await;
        println!("[TYPING] {name} is typing...");
        self.service.wait_for_pending(&self.current).await;
        self.print_new().await;
    }

    /// Print unseen messages and the current choices, then mark them read.
    async fn print_new(&mut self) {
        let Some(state) = self.service.game_state().await else {
            return;
        };
        let Some(conversation) = state.conversations.get(&self.current) else {
            return;
        };

        let shown = self.shown.entry(self.current.clone()).or_insert(0);
        for message in conversation.messages.iter().skip(*shown) {
            if message.is_typing {
                continue;
            }
            let sender = if message.sender_id == PLAYER_ID {
                "YOU".to_string()
            } else {
                state
                    .characters
                    .get(&message.sender_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| message.sender_id.clone())
            };
            match (message.kind, &message.image_url) {
                (MessageKind::Image, Some(url)) => println!("[{sender}] {} ({url})", message.text),
                _ => println!("[{sender}] {}", message.text),
            }
        }
        *shown = conversation
            .messages
            .iter()
            .filter(|m| !m.is_typing)
            .count();

        if conversation.is_waiting_for_response() {
            for (i, choice) in conversation.available_choices.iter().enumerate() {
                let lock = if choice.is_paywall_locked && !state.is_premium() {
                    " [PREMIUM]"
                } else {
                    ""
                };
                println!("  {}. {}{lock}", i + 1, choice.text);
            }
        }

        if let Err(e) = self.service.mark_messages_read(&self.current).await {
            println!("[ERROR] {e}");
        }
    }

    async fn contacts(&self) {
        let Some(state) = self.service.game_state().await else {
            return;
        };
        println!("[CONTACTS]");
        for character in state.unlocked_characters() {
            let conversation = state.conversations.get(&character.id);
            let unread = conversation.map(|c| c.unread_count()).unwrap_or(0);
            let preview = conversation
                .and_then(|c| c.last_message())
                .map(|m| m.text.as_str())
                .unwrap_or("(no messages)");
            let marker = if character.id == self.current { "*" } else { " " };
            println!(
                " {marker} {:<8} {} ({}), {unread} unread: {preview}",
                character.id,
                character.name,
                character.role.name()
            );
        }
    }

    async fn status(&self) {
        let Some(summary) = self.service.progress_summary().await else {
            println!("[ERROR] No game in progress.");
            return;
        };
        println!("[STATUS]");
        println!("  Player: {}", summary.player_name);
        println!("  Chapter: {}", summary.chapter);
        println!("  Play time: {}", summary.play_time);
        println!(
            "  Contacts: {}/{}",
            summary.contacts_unlocked, summary.contacts_total
        );
        println!("  Scenes completed: {}", summary.scenes_completed);
        println!("  Messages: {}", summary.total_messages);
        for relationship in &summary.relationships {
            println!(
                "  {}: {} ({}, {:.0}%)",
                relationship.name, relationship.status, relationship.score, relationship.meter
            );
        }
    }

    async fn premium(&self, enabled: bool) {
        match self.service.set_premium(enabled).await {
            Ok(()) => println!("[PREMIUM] {}", if enabled { "on" } else { "off" }),
            Err(e) => println!("[ERROR] {e}"),
        }
    }

    async fn reset(&mut self) -> Result<(), StoryError> {
        let player_name = self
            .service
            .game_state()
            .await
            .map(|s| s.player_name)
            .unwrap_or_else(|| "Player".to_string());

        self.service.reset_game().await?;
        self.shown.clear();
        println!("[RESET] Starting over.");

        self.service.initialize_game(player_name).await?;
        self.open(STARTING_CHARACTER).await;
        Ok(())
    }

    /// Mention activity in conversations other than the open one.
    fn notices(&mut self) {
        loop {
            match self.updates.try_recv() {
                Ok(update) => {
                    if update.character_id == self.current {
                        continue;
                    }
                    if matches!(
                        update.kind,
                        UpdateKind::ResponseReady | UpdateKind::SceneDelivered | UpdateKind::ImageShared
                    ) {
                        println!("[NOTICE] New message from {}", update.character_id);
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}
