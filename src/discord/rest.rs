//! Discord REST wrapper (spec.md §6 "Discord REST"): a single endpoint,
//! posting a chat message, matching `original_source/Discord/api.py`'s
//! `simple_message_create`. No rate-limit handling beyond the surface
//! retry `reqwest` already gives us is required of the core.

use crate::error::Result;
use serde::Serialize;

const API_BASE: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = "DiscordBot (hotline-bridge, 1.0)";

#[derive(Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
}

/// Thin `reqwest`-backed client for the one REST call this system makes.
pub struct DiscordRest {
    http: reqwest::Client,
    token: String,
}

impl DiscordRest {
    pub fn new(token: impl Into<String>) -> DiscordRest {
        DiscordRest {
            http: reqwest::Client::new(),
            token: token.into(),
        }
    }

    pub async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
        self.http
            .post(format!("{API_BASE}/channels/{channel_id}/messages"))
            .header("Authorization", format!("Bot {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(&CreateMessage { content })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
