//! Discord gateway for a CLI coding agent.
//!
//! Watches one channel, gives every conversation its own thread, and maps
//! each thread onto a persistent worker session (`claude -p`). One worker
//! at a time per thread; replies stream into the thread as they arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub mod commands;
pub mod config;
pub mod discord;
pub mod gateway;
pub mod retrieval;
pub mod session;
pub mod stream;
pub mod worker;

use commands::{command_help, parse_command};
use config::{Config, paths};
use discord::{ACK_EMOJI, Delivery, DiscordClient, DiscordSettings, Message};
use gateway::Gateway;
use retrieval::Retriever;
use session::SessionStore;

/// Loads configuration and state, connects to Discord, and polls until
/// interrupted.
///
/// # Errors
/// Fails on unusable configuration, a corrupt session map, or a Discord
/// rejection of the startup announcement. Per-message failures after
/// startup are logged and survived.
pub async fn run() -> Result<()> {
    let config = Config::load()?;
    let settings = DiscordSettings::from_config(&config)?;

    let store = SessionStore::load(paths::session_map_path())?;
    info!("loaded {} session(s)", store.len());

    let retriever = Retriever::from_config(&config.retrieval, paths::transcripts_dir());
    let client = DiscordClient::new(settings.bot_token.clone());

    // Resume watching every thread that already has a session.
    let mut watched: Vec<WatchedChannel> = store
        .all()
        .into_iter()
        .map(|record| WatchedChannel::thread(record.thread_id))
        .collect();
    watched.push(WatchedChannel::root(settings.channel_id.to_string()));

    let gateway = Arc::new(Gateway::new(config.clone(), store, retriever, client.clone()));

    let channel_id = settings.channel_id.to_string();
    client
        .send(
            &channel_id,
            &format!("\u{1f7e2} dgate online.\n{}", command_help()),
        )
        .await
        .context("Failed to announce startup; check the bot token and channel id")?;

    info!(
        %channel_id,
        admin = settings.admin_user_id,
        "polling for messages"
    );

    let poll_interval = config.poll_interval();
    let mut names: HashMap<String, String> = HashMap::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            () = tokio::time::sleep(poll_interval) => {
                poll_tick(
                    &client,
                    &gateway,
                    &settings,
                    &mut watched,
                    &mut names,
                )
                .await;
            }
        }
    }

    Ok(())
}

/// A polled channel: the watched root channel or one session thread.
struct WatchedChannel {
    id: String,
    is_root: bool,
    /// Last seen message id; `None` until the first poll establishes it.
    cursor: Option<String>,
}

impl WatchedChannel {
    fn root(id: String) -> Self {
        Self { id, is_root: true, cursor: None }
    }

    fn thread(id: String) -> Self {
        Self { id, is_root: false, cursor: None }
    }
}

/// Polls every watched channel once and dispatches what arrived.
async fn poll_tick(
    client: &DiscordClient,
    gateway: &Arc<Gateway<DiscordClient>>,
    settings: &DiscordSettings,
    watched: &mut Vec<WatchedChannel>,
    names: &mut HashMap<String, String>,
) {
    let mut new_threads = Vec::new();

    for channel in watched.iter_mut() {
        let messages = match client
            .messages_after(&channel.id, channel.cursor.as_deref())
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(channel_id = %channel.id, "poll failed: {:#}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let had_cursor = channel.cursor.is_some();
        for message in messages {
            channel.cursor = Some(message.id.clone());
            // The first poll only establishes the cursor; history is not
            // replayed.
            if !had_cursor {
                continue;
            }
            if message.author.bot || message.author.id != settings.admin_user_id.to_string() {
                continue;
            }
            if message.content.trim().is_empty() {
                continue;
            }

            if channel.is_root {
                if let Some(thread_id) =
                    handle_root_message(client, gateway, &channel.id, &message, names).await
                {
                    new_threads.push(thread_id);
                }
            } else {
                handle_thread_message(client, gateway, &channel.id, &message, names).await;
            }
        }
    }

    for thread_id in new_threads {
        if watched.iter().any(|channel| channel.id == thread_id) {
            continue;
        }
        watched.push(WatchedChannel {
            // Thread ids equal their starter message's id, so an empty
            // cursor would refetch the starter; seed it instead.
            cursor: Some(thread_id.clone()),
            id: thread_id,
            is_root: false,
        });
    }
}

/// A message in the root channel starts a new thread and runs the prompt in
/// it. Returns the new thread id to watch.
async fn handle_root_message(
    client: &DiscordClient,
    gateway: &Arc<Gateway<DiscordClient>>,
    channel_id: &str,
    message: &Message,
    names: &mut HashMap<String, String>,
) -> Option<String> {
    if let Some(command) = parse_command(&message.content) {
        // Outside a thread only `!status` means anything; it reports on the
        // gateway as a whole.
        let reply = match command {
            commands::AdminCommand::Status => gateway.overview_report(),
            _ => "Commands work inside a session thread.".to_string(),
        };
        if let Err(err) = client.send(channel_id, &reply).await {
            warn!("command reply failed: {:#}", err);
        }
        return None;
    }

    // A thread may already exist when the starter was replied to before.
    let thread_id = match &message.thread {
        Some(thread) => thread.id.clone(),
        None => {
            let name = thread_name(&message.content);
            match client.create_thread(channel_id, &message.id, &name).await {
                Ok(id) => {
                    names.insert(id.clone(), name);
                    id
                }
                Err(err) => {
                    warn!("thread creation failed: {:#}", err);
                    return None;
                }
            }
        }
    };

    dispatch_prompt(client, gateway, &thread_id, channel_id, message, names).await;
    Some(thread_id)
}

async fn handle_thread_message(
    client: &DiscordClient,
    gateway: &Arc<Gateway<DiscordClient>>,
    thread_id: &str,
    message: &Message,
    names: &HashMap<String, String>,
) {
    if let Some(command) = parse_command(&message.content) {
        let reply = gateway.handle_command(thread_id, command);
        if let Err(err) = client.send(thread_id, &reply).await {
            warn!("command reply failed: {:#}", err);
        }
        return;
    }

    dispatch_prompt(client, gateway, thread_id, thread_id, message, names).await;
}

/// Acknowledges the prompt and runs it on its own task so one slow worker
/// never stalls polling of the other threads.
async fn dispatch_prompt(
    client: &DiscordClient,
    gateway: &Arc<Gateway<DiscordClient>>,
    thread_id: &str,
    react_channel_id: &str,
    message: &Message,
    names: &HashMap<String, String>,
) {
    if let Err(err) = client.react(react_channel_id, &message.id, ACK_EMOJI).await {
        warn!("ack reaction failed: {:#}", err);
    }
    let _ = client.trigger_typing(thread_id).await;

    let gateway = Arc::clone(gateway);
    let thread_id = thread_id.to_string();
    let thread_name = names.get(&thread_id).cloned().unwrap_or_default();
    let prompt = message.content.clone();
    tokio::spawn(async move {
        let outcome = gateway.handle_prompt(&thread_id, &thread_name, &prompt).await;
        info!(%thread_id, ?outcome, "run finished");
    });
}

/// Derives a thread title from the prompt's first line.
fn thread_name(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("session").trim();
    let mut name: String = first_line.chars().take(60).collect();
    if name.is_empty() {
        name = "session".to_string();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_name_uses_first_line() {
        assert_eq!(thread_name("fix the login bug\ndetails follow"), "fix the login bug");
    }

    #[test]
    fn thread_name_truncates_long_prompts() {
        let name = thread_name(&"x".repeat(200));
        assert_eq!(name.chars().count(), 60);
    }

    #[test]
    fn thread_name_never_empty() {
        assert_eq!(thread_name("   \n"), "session");
    }
}
