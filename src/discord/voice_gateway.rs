//! Voice gateway client (spec C7): the per-call WebSocket that
//! negotiates the encrypted RTP session, grounded on
//! `original_source/Discord/voice_gateway.py`. IP discovery itself is
//! handled by `rtp::RtpEndpoint` (spec.md §4.7-2/§4.8), which is a
//! deliberate improvement over the original's hardcoded source
//! address/port — see `SPEC_FULL.md` §B.

use crate::discord::model::*;
use crate::error::{Error, Result};
use crate::rtp::RtpEndpoint;
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Local bind port for the Discord-side RTP socket (spec.md §4.7-3).
pub const DISCORD_RTP_PORT: u16 = 5003;
const ENCRYPTION_MODE: &str = "aead_xchacha20_poly1305_rtpsize";
const MAX_RESUME_ATTEMPTS: u32 = 2;

struct VoiceState {
    endpoint: Option<String>,
    token: String,
    session_id: String,
    ssrc: Option<u32>,
    /// Last `s` sequence number seen on this connection, sent back as
    /// `seq_ack` on resume (spec.md §4.7 RESUME payload).
    last_seq: Option<u64>,
}

/// Voice gateway connection for a single call (spec.md §4.7).
pub struct VoiceGateway {
    guild_id: String,
    user_id: String,
    state: Mutex<VoiceState>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pub rtp: Mutex<Option<Arc<RtpEndpoint>>>,
    attempts: AtomicU32,
    /// Notified once `SESSION_DESCRIPTION` has installed the secret
    /// key and the RTP endpoint is ready to carry media.
    ready: Notify,
}

impl VoiceGateway {
    pub fn new(guild_id: impl Into<String>, user_id: impl Into<String>, token: String, endpoint: String, session_id: String) -> Arc<Self> {
        Arc::new(VoiceGateway {
            guild_id: guild_id.into(),
            user_id: user_id.into(),
            state: Mutex::new(VoiceState {
                endpoint: Some(endpoint),
                token,
                session_id,
                ssrc: None,
                last_seq: None,
            }),
            send_tx: Mutex::new(None),
            rtp: Mutex::new(None),
            attempts: AtomicU32::new(0),
            ready: Notify::new(),
        })
    }

    pub fn rtp_endpoint(&self) -> Option<Arc<RtpEndpoint>> {
        self.rtp.lock().unwrap().clone()
    }

    /// Wait until the secret key has been installed and media can flow.
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }

    /// Reconnect loop (spec.md §4.7 "Reconnect policy"): `DISCONNECTED`
    /// (4014) is fatal, everything else resumes up to
    /// `MAX_RESUME_ATTEMPTS` before giving up and requiring a fresh
    /// `VOICE_STATE_UPDATE`/`VOICE_SERVER_UPDATE` round trip.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(Error::CloseCodeFatal(VOICE_NON_RECONNECTABLE_CLOSE_CODE)) => {
                    return Err(Error::CloseCodeFatal(VOICE_NON_RECONNECTABLE_CLOSE_CODE));
                }
                Err(e) => {
                    let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts > MAX_RESUME_ATTEMPTS {
                        warn!(error = %e, attempts, "voice gateway exhausted resume attempts, giving up");
                        return Err(e);
                    }
                    warn!(error = %e, attempts, "voice gateway connection error, resuming");
                }
            }
        }
    }

    pub fn disconnect(&self) {
        if let Some(rtp) = self.rtp_endpoint() {
            rtp.stop();
        }
    }

    async fn run_once(self: &Arc<Self>) -> Result<()> {
        let endpoint = { self.state.lock().unwrap().endpoint.clone() }
            .ok_or_else(|| Error::Protocol("voice gateway has no endpoint".into()))?;
        let url = format!("{endpoint}?v=8");
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

        let mut heartbeat_task: Option<tokio::task::JoinHandle<()>> = None;
        let result = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayMessage>(&text) {
                    Ok(msg) => {
                        if let Some(seq) = msg.s {
                            self.state.lock().unwrap().last_seq = Some(seq);
                        }
                        if msg.op == voice_op::HELLO {
                            if let Some(d) = msg.d.clone() {
                                if let Ok(hello) = serde_json::from_value::<HelloData>(d) {
                                    let interval = Duration::from_millis(hello.heartbeat_interval);
                                    let hb_self = self.clone();
                                    heartbeat_task = Some(tokio::spawn(async move {
                                        hb_self.heartbeat_loop(interval).await;
                                    }));
                                }
                            }
                            if self.attempts.load(Ordering::SeqCst) > 0 {
                                self.send_resume();
                            } else {
                                self.send_identify();
                            }
                        } else if let Err(e) = self.handle(msg).await {
                            if let Error::CloseCodeFatal(_) = e {
                                break Err(e);
                            }
                            warn!(error = %e, "voice gateway message handling error");
                        }
                    }
                    Err(e) => debug!(error = %e, "malformed voice gateway frame, dropping"),
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

    fn close_outcome(&self, frame: Option<CloseFrame<'static>>) -> Result<()> {
        let Some(frame) = frame else { return Ok(()) };
        let code: u16 = frame.code.into();
        if code == VOICE_NON_RECONNECTABLE_CLOSE_CODE {
            return Err(Error::CloseCodeFatal(code));
        }
        Ok(())
    }

    async fn heartbeat_loop(&self, interval: Duration) {
        loop {
            let nonce = self.nonce();
            let seq_ack = self.state.lock().unwrap().last_seq;
            self.send(GatewayMessage::new(voice_op::HEARTBEAT, VoiceHeartbeat { t: nonce, seq_ack }));
            tokio::time::sleep(interval).await;
        }
    }

    fn nonce(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
    }

    fn send_identify(&self) {
        let (token, session_id) = {
            let state = self.state.lock().unwrap();
            (state.token.clone(), state.session_id.clone())
        };
        self.send(GatewayMessage::new(
            voice_op::IDENTIFY,
            VoiceIdentify {
                server_id: self.guild_id.clone(),
                user_id: self.user_id.clone(),
                session_id,
                token,
            },
        ));
    }

    /// Resume path for reconnect attempts (spec.md §4.7 "resume
    /// (clean=false)"): reuses the existing session rather than
    /// IDENTIFY-ing fresh, so `handle_ready` is never re-entered and the
    /// armed `RtpEndpoint` keeps carrying media uninterrupted.
    fn send_resume(&self) {
        let (token, session_id, seq_ack) = {
            let state = self.state.lock().unwrap();
            (state.token.clone(), state.session_id.clone(), state.last_seq)
        };
        self.send(GatewayMessage::new(
            voice_op::RESUME,
            VoiceResume {
                server_id: self.guild_id.clone(),
                session_id,
                token,
                seq_ack,
            },
        ));
    }

    async fn handle(self: &Arc<Self>, msg: GatewayMessage) -> Result<()> {
        match msg.op {
            voice_op::READY => self.handle_ready(msg).await,
            voice_op::SESSION_DESCRIPTION => self.handle_session_description(msg),
            voice_op::HEARTBEAT_ACK | voice_op::RESUMED => Ok(()),
            other => {
                debug!(op = other, "unsupported voice gateway opcode, dropping");
                Ok(())
            }
        }
    }

    /// `READY` (spec.md §4.7-3): bind the local RTP socket, point it at
    /// Discord's UDP endpoint, wait for our own public address/port via
    /// IP discovery, then `SELECT_PROTOCOL`.
    async fn handle_ready(self: &Arc<Self>, msg: GatewayMessage) -> Result<()> {
        let d = msg.d.ok_or_else(|| Error::Protocol("voice READY missing data".into()))?;
        let ready: VoiceReadyEvent = serde_json::from_value(d)?;
        self.state.lock().unwrap().ssrc = Some(ready.ssrc);

        let remote_ip: IpAddr = ready
            .ip
            .parse()
            .map_err(|_| Error::Protocol(format!("voice READY returned unparsable ip {:?}", ready.ip)))?;
        let local_addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, DISCORD_RTP_PORT).into();
        let endpoint = RtpEndpoint::bind(local_addr, Some(ready.ssrc), true).await?;
        endpoint.set_remote_addr(SocketAddr::new(remote_ip, ready.port));
        if let Some(old) = self.rtp.lock().unwrap().replace(endpoint.clone()) {
            old.stop();
        }
        tokio::spawn(endpoint.clone().run());

        endpoint.wait_for_public_ip().await;
        let (my_ip, my_port) = {
            let ip = endpoint.public_ip().unwrap_or_default();
            (ip, DISCORD_RTP_PORT)
        };

        self.send(GatewayMessage::new(
            voice_op::SELECT_PROTOCOL,
            SelectProtocol {
                protocol: "udp",
                data: SelectProtocolData {
                    address: my_ip,
                    port: my_port,
                    mode: ENCRYPTION_MODE,
                },
            },
        ));
        Ok(())
    }

    /// `SESSION_DESCRIPTION` (spec.md §4.7-4): install the secret key
    /// and announce speaking state.
    fn handle_session_description(&self, msg: GatewayMessage) -> Result<()> {
        let d = msg.d.ok_or_else(|| Error::Protocol("voice SESSION_DESCRIPTION missing data".into()))?;
        let desc: SessionDescriptionEvent = serde_json::from_value(d)?;
        let mut key = [0u8; 32];
        let n = desc.secret_key.len().min(32);
        key[..n].copy_from_slice(&desc.secret_key[..n]);

        let (rtp, ssrc) = {
            let rtp = self.rtp.lock().unwrap().clone();
            let ssrc = self.state.lock().unwrap().ssrc;
            (rtp, ssrc)
        };
        let Some(rtp) = rtp else { return Ok(()) };
        rtp.set_secret_key(key);

        if let Some(ssrc) = ssrc {
            self.send(GatewayMessage::new(
                voice_op::SPEAKING,
                Speaking {
                    speaking: SPEAKING_MICROPHONE_PRIORITY,
                    delay: 0,
                    ssrc,
                },
            ));
        }
        self.ready.notify_waiters();
        Ok(())
    }

    fn send(&self, msg: GatewayMessage) {
        let Ok(text) = serde_json::to_string(&msg) else { return };
        if let Some(tx) = self.send_tx.lock().unwrap().as_ref() {
            tx.send(Message::Text(text)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Arc<VoiceGateway> {
        VoiceGateway::new("guild", "user", "tok".into(), "wss://example.invalid".into(), "sess".into())
    }

    #[test]
    fn close_outcome_flags_disconnected_code() {
        let gw = gateway();
        let frame = CloseFrame {
            code: VOICE_NON_RECONNECTABLE_CLOSE_CODE.into(),
            reason: "".into(),
        };
        assert!(matches!(gw.close_outcome(Some(frame)), Err(Error::CloseCodeFatal(4014))));
    }

    #[test]
    fn close_outcome_treats_other_codes_as_resumable() {
        let gw = gateway();
        let frame = CloseFrame { code: 4006u16.into(), reason: "".into() };
        assert!(gw.close_outcome(Some(frame)).is_ok());
    }
}
