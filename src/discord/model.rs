//! Wire shapes for both Discord gateway connections (spec C6/C7):
//! the shared envelope and the specific payloads this bridge actually
//! sends or reads. `d` stays a `serde_json::Value` at the envelope
//! level since its shape is opcode-dependent, matching the untyped
//! `Any` field of `original_source/Discord/gateway_connection.py`'s
//! `GatewayMessage`; callers deserialize the nested shape they expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guild gateway op codes (spec.md §4.6).
pub mod guild_op {
    pub const EVENT_DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Guild gateway non-resumable close codes (spec.md §4.6).
pub const NON_RESUMABLE_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

/// Voice gateway op codes (spec.md §4.7).
pub mod voice_op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
}

/// Only `DISCONNECTED` is not reconnectable on the voice gateway
/// (spec.md §4.7 "Reconnect policy").
pub const VOICE_NON_RECONNECTABLE_CLOSE_CODE: u16 = 4014;

/// The envelope every gateway frame is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new(op: u8, d: impl Serialize) -> Self {
        GatewayMessage {
            op,
            d: serde_json::to_value(d).ok(),
            s: None,
            t: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: &'static str,
    pub browser: &'static str,
    pub device: &'static str,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        IdentifyProperties {
            os: "Linux",
            browser: "hotline-bridge",
            device: "hotline-bridge",
        }
    }
}

/// Guild gateway IDENTIFY intents: `(1<<0) | (1<<7) | (1<<9)`
/// (spec.md §4.6): GUILDS, GUILD_VOICE_STATES, GUILD_MESSAGES.
pub const GUILD_INTENTS: u32 = (1 << 0) | (1 << 7) | (1 << 9);

#[derive(Debug, Clone, Serialize)]
pub struct GuildIdentify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildResume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyEvent {
    pub user: ReadyUser,
    pub session_id: String,
    pub resume_gateway_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdateEvent {
    pub user_id: String,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdateEvent {
    pub token: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreateEvent {
    pub id: String,
    pub channel_id: String,
    pub author: MessageAuthor,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<MessageAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    pub bot: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateUpdateCommand {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceIdentify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceResume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
    pub seq_ack: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocol {
    pub protocol: &'static str,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReadyEvent {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptionEvent {
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceHeartbeat {
    pub t: u64,
    pub seq_ack: Option<u64>,
}

/// `updateSpeaking(mode=MICROPHONE_PRIORITY=5, delay=0, ssrc)`, spec.md §4.7-5.
pub const SPEAKING_MICROPHONE_PRIORITY: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Speaking {
    pub speaking: u32,
    pub delay: u32,
    pub ssrc: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_message_omits_absent_sequence_and_type() {
        let msg = GatewayMessage::new(guild_op::HEARTBEAT, serde_json::json!(42));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("\"s\""));
        assert!(!text.contains("\"t\""));
    }

    #[test]
    fn ready_event_parses_nested_user_id() {
        let raw = serde_json::json!({
            "user": {"id": "1234"},
            "session_id": "sess-1",
            "resume_gateway_url": "wss://resume.example/"
        });
        let ready: ReadyEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ready.user.id, "1234");
        assert_eq!(ready.session_id, "sess-1");
    }
}
