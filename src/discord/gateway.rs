//! Guild gateway client (spec C6): the bot-identity WebSocket control
//! plane, grounded on `original_source/Discord/gateway.py` and its
//! shared base `gateway_connection.py`, reworked onto `tokio`/
//! `tokio-tungstenite` the way this crate's RTP endpoint (`rtp::mod`)
//! and transaction engine (`sip::transaction`) already use
//! cancellation tokens and `mpsc` channels instead of bare `asyncio`
//! tasks.

use crate::discord::model::*;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const DEFAULT_ENDPOINT: &str = "wss://gateway.discord.gg/";
const GATEWAY_PARAMS: &str = "&encoding=json";

#[derive(Default)]
struct GatewayState {
    user_id: Option<String>,
    session_id: Option<String>,
    resume_url: String,
    last_sequence: Option<u64>,
    /// `userID -> (guildID, channelID)`, spec.md §3 "Guild gateway".
    voice_state: HashMap<String, (Option<String>, Option<String>)>,
}

/// Guild gateway connection (spec.md §3 "Guild gateway" / §4.6).
pub struct GuildGateway {
    token: String,
    events: Arc<EventBus>,
    state: Mutex<GatewayState>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    attempts: AtomicU32,
    /// Fan-out for VOICE_SERVER_UPDATE, consumed by whoever drives the
    /// voice gateway lifecycle (main wiring, per `Client.on_voice_server_update`).
    voice_server_updates: mpsc::UnboundedSender<(String, String)>,
}

impl GuildGateway {
    pub fn new(token: impl Into<String>, events: Arc<EventBus>) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, String)>) {
        let (voice_server_updates, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(GuildGateway {
            token: token.into(),
            events,
            state: Mutex::new(GatewayState {
                resume_url: DEFAULT_ENDPOINT.to_string(),
                ..Default::default()
            }),
            send_tx: Mutex::new(None),
            attempts: AtomicU32::new(0),
            voice_server_updates,
        });
        (gateway, rx)
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn voice_state(&self, user_id: &str) -> (Option<String>, Option<String>) {
        self.state.lock().unwrap().voice_state.get(user_id).cloned().unwrap_or((None, None))
    }

    /// Drive the reconnect loop forever (spec.md §4.6 "Reconnection
    /// loop"): a clean close or a resumable close code re-enters HELLO;
    /// a non-resumable close code exits.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(()) => {
                    debug!("guild gateway session ended cleanly, reconnecting");
                }
                Err(Error::CloseCodeFatal(code)) => {
                    warn!(code, "guild gateway closed with non-resumable code, giving up");
                    return Err(Error::CloseCodeFatal(code));
                }
                Err(e) => {
                    warn!(error = %e, "guild gateway connection error, reconnecting");
                }
            }
        }
    }

    async fn run_once(self: &Arc<Self>) -> Result<()> {
        let endpoint = { self.state.lock().unwrap().resume_url.clone() };
        let url = format!("{endpoint}?v=10{GATEWAY_PARAMS}");
        let (ws, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        *self.send_tx.lock().unwrap() = Some(send_tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut heartbeat_interval = Duration::from_secs(1);
        let mut heartbeat_task: Option<tokio::task::JoinHandle<()>> = None;
        let result = loop {
            let next = read.next().await;
            match next {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayMessage>(&text) {
                    Ok(msg) => {
                        if let Some(seq) = msg.s {
                            self.state.lock().unwrap().last_sequence = Some(seq);
                        }
                        if msg.op == guild_op::HELLO {
                            if let Some(d) = msg.d.clone() {
                                if let Ok(hello) = serde_json::from_value::<HelloData>(d) {
                                    heartbeat_interval = Duration::from_millis(hello.heartbeat_interval);
                                    let hb_self = self.clone();
                                    let hb_interval = heartbeat_interval;
                                    heartbeat_task = Some(tokio::spawn(async move {
                                        hb_self.heartbeat_loop(hb_interval).await;
                                    }));
                                }
                            }
                            self.send_identify_or_resume().await;
                        } else if let Err(e) = self.handle(msg).await {
                            if let Error::CloseCodeFatal(_) = e {
                                break Err(e);
                            }
                            warn!(error = %e, "guild gateway message handling error");
                        }
                    }
                    Err(e) => debug!(error = %e, "malformed guild gateway frame, dropping"),
                },
                Some(Ok(Message::Close(frame))) => break Ok(self.close_outcome(frame)?),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(Error::WebSocket(e)),
                None => break Ok(()),
            }
        };

        if let Some(hb) = heartbeat_task {
            hb.abort();
        }
        writer.abort();
        *self.send_tx.lock().unwrap() = None;
        result
    }

    /// Translate a close frame into the reconnect decision spec.md §4.6
    /// describes: non-resumable codes become `CloseCodeFatal`; anything
    /// else is treated as a clean, resumable close.
    fn close_outcome(&self, frame: Option<CloseFrame<'static>>) -> Result<()> {
        let Some(frame) = frame else { return Ok(()) };
        let code: u16 = frame.code.into();
        if NON_RESUMABLE_CLOSE_CODES.contains(&code) {
            return Err(Error::CloseCodeFatal(code));
        }
        Ok(())
    }

    async fn heartbeat_loop(&self, interval: Duration) {
        loop {
            let seq = self.state.lock().unwrap().last_sequence;
            self.send(GatewayMessage::new(guild_op::HEARTBEAT, seq));
            tokio::time::sleep(interval).await;
        }
    }

    async fn send_identify_or_resume(&self) {
        let (session_id, token) = {
            let state = self.state.lock().unwrap();
            (state.session_id.clone(), self.token.clone())
        };
        if let Some(session_id) = session_id {
            let seq = self.state.lock().unwrap().last_sequence;
            self.send(GatewayMessage::new(
                guild_op::RESUME,
                GuildResume { token, session_id, seq },
            ));
        } else {
            self.send(GatewayMessage::new(
                guild_op::IDENTIFY,
                GuildIdentify {
                    token,
                    properties: IdentifyProperties::default(),
                    intents: GUILD_INTENTS,
                },
            ));
        }
    }

    async fn handle(self: &Arc<Self>, msg: GatewayMessage) -> Result<()> {
        match msg.op {
            guild_op::EVENT_DISPATCH => self.handle_dispatch(msg).await,
            guild_op::HEARTBEAT => {
                let seq = self.state.lock().unwrap().last_sequence;
                self.send(GatewayMessage::new(guild_op::HEARTBEAT, seq));
                Ok(())
            }
            guild_op::RECONNECT => Err(Error::Protocol("gateway requested reconnect".into())),
            guild_op::INVALID_SESSION => {
                let resumable = msg.d.as_ref().and_then(|d| d.as_bool()).unwrap_or(false);
                if !resumable {
                    self.reset();
                }
                Err(Error::Protocol("invalid session".into()))
            }
            guild_op::HEARTBEAT_ACK => Ok(()),
            other => {
                debug!(op = other, "unsupported guild gateway opcode, dropping");
                Ok(())
            }
        }
    }

    async fn handle_dispatch(self: &Arc<Self>, msg: GatewayMessage) -> Result<()> {
        let Some(event_type) = msg.t.as_deref() else { return Ok(()) };
        let Some(d) = msg.d else { return Ok(()) };

        match event_type {
            "READY" => {
                let ready: ReadyEvent = serde_json::from_value(d)?;
                let mut state = self.state.lock().unwrap();
                state.user_id = Some(ready.user.id);
                state.session_id = Some(ready.session_id);
                state.resume_url = ready.resume_gateway_url;
                self.attempts.store(0, Ordering::SeqCst);
            }
            "RESUMED" => {
                self.attempts.store(0, Ordering::SeqCst);
            }
            "MESSAGE_CREATE" => {
                let message: MessageCreateEvent = serde_json::from_value(d)?;
                let user_id = self.user_id();
                if message.author.bot != Some(true) {
                    if let Some(me) = user_id.filter(|me| message.mentions.iter().any(|m| &m.id == me)) {
                        self.events.dispatch(Event::BotMention {
                            user_id: me,
                            channel_id: message.channel_id,
                        });
                    }
                }
            }
            "VOICE_STATE_UPDATE" => {
                let update: VoiceStateUpdateEvent = serde_json::from_value(d)?;
                let mut state = self.state.lock().unwrap();
                state
                    .voice_state
                    .insert(update.user_id.clone(), (update.guild_id.clone(), update.channel_id.clone()));
                if Some(&update.user_id) == state.user_id.as_ref() {
                    state.session_id = Some(update.session_id);
                }
            }
            "VOICE_SERVER_UPDATE" => {
                let update: VoiceServerUpdateEvent = serde_json::from_value(d)?;
                self.voice_server_updates
                    .send((update.token, format!("wss://{}", update.endpoint)))
                    .ok();
            }
            "GUILD_CREATE" => {
                if let Some(guild_id) = d.get("id").and_then(|v| v.as_str()) {
                    self.events.dispatch(Event::GuildJoin { guild_id: guild_id.to_string() });
                }
            }
            other => debug!(event = other, "unhandled guild gateway dispatch"),
        }
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.session_id = None;
        state.last_sequence = None;
        state.resume_url = DEFAULT_ENDPOINT.to_string();
    }

    fn send(&self, msg: GatewayMessage) {
        let Ok(text) = serde_json::to_string(&msg) else { return };
        if let Some(tx) = self.send_tx.lock().unwrap().as_ref() {
            if tx.send(Message::Text(text)).is_err() {
                warn!("guild gateway send queue closed, dropping frame");
            }
        }
    }

    /// Join (`channel_id: Some`) or leave (`channel_id: None`) a voice
    /// channel: spec.md §4.6 "Outbound `VOICE_STATE_UPDATE`".
    pub fn update_voice_channel(&self, guild_id: &str, channel_id: Option<&str>) {
        self.send(GatewayMessage::new(
            guild_op::VOICE_STATE_UPDATE,
            VoiceStateUpdateCommand {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.map(str::to_string),
                self_mute: false,
                self_deaf: false,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_outcome_flags_non_resumable_codes() {
        let (gw, _rx) = GuildGateway::new("tok", Arc::new(EventBus::new()));
        let frame = CloseFrame {
            code: 4004u16.into(),
            reason: "".into(),
        };
        assert!(matches!(gw.close_outcome(Some(frame)), Err(Error::CloseCodeFatal(4004))));
    }

    #[test]
    fn close_outcome_treats_resumable_codes_as_clean() {
        let (gw, _rx) = GuildGateway::new("tok", Arc::new(EventBus::new()));
        let frame = CloseFrame {
            code: 1006u16.into(),
            reason: "".into(),
        };
        assert!(gw.close_outcome(Some(frame)).is_ok());
    }

    #[test]
    fn reset_restores_default_endpoint_and_clears_session() {
        let (gw, _rx) = GuildGateway::new("tok", Arc::new(EventBus::new()));
        gw.state.lock().unwrap().session_id = Some("abc".into());
        gw.reset();
        let state = gw.state.lock().unwrap();
        assert!(state.session_id.is_none());
        assert_eq!(state.resume_url, DEFAULT_ENDPOINT);
    }
}
