//! Discord REST client and the outbound delivery seam.
//!
//! Inbound uses plain REST polling of the watched channel and known
//! threads; the realtime websocket gateway is deliberately out of scope.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;

mod types;

pub use types::{Channel, Message, User};

const API_BASE: &str = "https://discord.com/api/v10";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Mail-incoming reaction used to acknowledge accepted prompts.
pub const ACK_EMOJI: &str = "\u{1F4E8}";

/// Outbound capabilities the gateway needs from the chat platform.
///
/// Implemented by [`DiscordClient`]; tests substitute a recorder. Failures
/// are the platform rejecting a delivery; callers log them and keep their
/// own lifecycle consistent.
pub trait Delivery: Send + Sync + 'static {
    /// Sends a message to a thread; returns the new message's id.
    fn send(
        &self,
        thread_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Replaces the content of a previously sent message.
    fn edit(
        &self,
        thread_id: &str,
        message_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Reacts to a user message (receipt acknowledgment).
    fn react(
        &self,
        thread_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Validated connection settings.
pub struct DiscordSettings {
    pub bot_token: String,
    pub channel_id: u64,
    pub admin_user_id: u64,
}

impl DiscordSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .discord
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var("DGATE_DISCORD_TOKEN")
                    .ok()
                    .map(|token| token.trim().to_string())
                    .filter(|token| !token.is_empty())
            })
            .unwrap_or_default();
        if token.is_empty() {
            bail!("discord.bot_token or DGATE_DISCORD_TOKEN is required");
        }

        if config.discord.admin_user_id == 0 {
            bail!("discord.admin_user_id is required");
        }
        if config.discord.channel_id == 0 {
            bail!("discord.channel_id is required");
        }

        Ok(Self {
            bot_token: token,
            channel_id: config.discord.channel_id,
            admin_user_id: config.discord.admin_user_id,
        })
    }
}

#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscordClient {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: API_BASE.to_string(),
            token,
        }
    }

    /// Fetches messages in a channel/thread strictly after a message id,
    /// oldest first. `after = None` fetches only the single latest message,
    /// used to establish the polling cursor without replaying history.
    pub async fn messages_after(
        &self,
        channel_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<Message>> {
        let url = match after {
            Some(after) => format!(
                "{}/channels/{}/messages?after={}&limit=100",
                self.base_url, channel_id, after
            ),
            None => format!("{}/channels/{}/messages?limit=1", self.base_url, channel_id),
        };

        let mut messages: Vec<Message> = self.get(&url).await?;
        // Discord returns newest first.
        messages.reverse();
        Ok(messages)
    }

    /// Starts a thread from a channel message; returns the thread id.
    pub async fn create_thread(&self, channel_id: &str, message_id: &str, name: &str) -> Result<String> {
        let url = format!(
            "{}/channels/{}/messages/{}/threads",
            self.base_url, channel_id, message_id
        );
        let channel: Channel = self
            .post(&url, &CreateThreadRequest { name })
            .await?;
        Ok(channel.id)
    }

    /// Signals "typing…" in a channel; purely cosmetic, errors ignored by
    /// callers.
    pub async fn trigger_typing(&self, channel_id: &str) -> Result<()> {
        let url = format!("{}/channels/{}/typing", self.base_url, channel_id);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|_| anyhow!("Discord request failed"))?;
        ensure_success(&response)?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|_| anyhow!("Discord request failed"))?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|_| anyhow!("Discord request failed"))?;
        decode(response).await
    }
}

impl Delivery for DiscordClient {
    async fn send(&self, thread_id: &str, text: &str) -> Result<String> {
        let url = format!("{}/channels/{}/messages", self.base_url, thread_id);
        let message: Message = self.post(&url, &SendMessageRequest { content: text }).await?;
        Ok(message.id)
    }

    async fn edit(&self, thread_id: &str, message_id: &str, text: &str) -> Result<()> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, thread_id, message_id
        );
        let response = self
            .http
            .patch(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&SendMessageRequest { content: text })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|_| anyhow!("Discord request failed"))?;
        ensure_success(&response)?;
        Ok(())
    }

    async fn react(&self, thread_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let encoded: String = emoji
            .bytes()
            .map(|b| format!("%{b:02X}"))
            .collect();
        let url = format!(
            "{}/channels/{}/messages/{}/reactions/{}/@me",
            self.base_url, thread_id, message_id, encoded
        );
        let response = self
            .http
            .put(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .header("Content-Length", "0")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|_| anyhow!("Discord request failed"))?;
        ensure_success(&response)?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    ensure_success(&response)?;
    response
        .json()
        .await
        .map_err(|_| anyhow!("Failed to decode Discord response"))
}

fn ensure_success(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        bail!("Discord API error: HTTP {}", status)
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateThreadRequest<'a> {
    name: &'a str,
}
