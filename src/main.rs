//! Entry point: loads configuration, brings up the SIP transport and
//! the two Discord gateway connections, and wires them together
//! through the event bus (spec.md §4.9/§5).

mod admission;
mod allowlist;
mod config;
mod discord;
mod error;
mod events;
mod rtp;
mod session;
mod sip;

use crate::admission::{check_outbound_call, CallLog, DoNotDisturb};
use crate::allowlist::ResolvingAllowList;
use crate::config::Config;
use crate::discord::{DiscordRest, GuildGateway, VoiceGateway};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::rtp::RtpEndpoint;
use crate::session::SessionManager;
use crate::sip::dialog::DialogTable;
use crate::sip::sdp;
use crate::sip::transaction::TransactionTable;
use crate::sip::transport::SipTransport;
use crate::sip::user_agent::UserAgent;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Default local SIP listening port, per spec.md §4.2.
const DEFAULT_SIP_PORT: u16 = 5060;
const LOCAL_SIP_USER: &str = "IPCall";

#[derive(Parser)]
#[command(name = "hotline-bridge", about = "SIP-to-Discord voice bridge")]
struct Args {
    /// Path to the INI configuration file.
    #[arg(short, long, default_value = "hotline-bridge.ini")]
    config: std::path::PathBuf,
}

/// Everything an event-bus listener needs, bundled so closures only
/// capture one `Arc`.
struct App {
    config: Config,
    session: Arc<SessionManager>,
    ua: Arc<UserAgent>,
    guild_gateway: Arc<GuildGateway>,
    rest: DiscordRest,
    call_log: Mutex<CallLog>,
    dnd: DoNotDisturb,
    voice_gateway: Mutex<Option<Arc<VoiceGateway>>>,
}

impl App {
    /// Bridge SIP-side and Discord-side RTP once both the dialog and
    /// the voice gateway are ready (spec.md §1 "bridges media once both
    /// sides complete signaling"). A no-op if either side isn't ready
    /// yet; the event that completes last performs the bridge.
    async fn try_bridge(&self) {
        let Some(dialog) = self.session.active_dialog() else {
            return;
        };
        let Some(voice_gateway) = self.voice_gateway.lock().unwrap().clone() else {
            return;
        };
        let Some(discord_rtp) = voice_gateway.rtp_endpoint() else {
            return;
        };
        let Some(rtp_port) = dialog.rtp_port else {
            warn!("SIP dialog has no negotiated RTP port, cannot bridge");
            return;
        };
        let remote_ip = match dialog.remote_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "cannot bridge: unparsable dialog remote URI");
                return;
            }
        };
        let remote_addr: SocketAddr = match format!("{remote_ip}:{rtp_port}").parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(%remote_ip, rtp_port, "cannot bridge: unparsable SIP RTP remote address");
                return;
            }
        };

        let local_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, sdp::SIP_RTP_PORT).into();
        let sip_rtp = match RtpEndpoint::bind(local_addr, None, false).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(error = %e, "failed to bind SIP-side RTP endpoint");
                return;
            }
        };
        sip_rtp.set_remote_addr(remote_addr);
        match dialog.rtcp_addr() {
            Ok(Some(ctrl_addr)) => sip_rtp.set_remote_ctrl_addr(ctrl_addr),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cannot derive SIP-side RTCP address, RTCP will go to the RTP port"),
        }
        tokio::spawn(sip_rtp.clone().run());

        RtpEndpoint::proxy(&sip_rtp, &discord_rtp, None, None);
        self.session.set_rtp_endpoints(sip_rtp, discord_rtp);
        info!("media bridge established");
    }

    async fn handle_inbound_call(self: Arc<Self>) {
        let channel_id = self.config.discord_home_text_channel_id.clone();
        if let Err(e) = self.rest.post_message(&channel_id, &self.config.incoming_call_message).await {
            warn!(error = %e, "failed to announce inbound call in text channel");
        }
        self.guild_gateway
            .update_voice_channel(&self.config.discord_home_guild_id, Some(&self.config.discord_home_voice_channel_id));
        // No human operator sits on this line: every allow-listed,
        // non-busy inbound call is accepted automatically.
        self.session.answer_incoming_call();
    }

    async fn handle_bot_mention(self: Arc<Self>, user_id: String) {
        let bot_id = self.guild_gateway.user_id().unwrap_or_default();
        let mentioned_in_voice = self.guild_gateway.voice_state(&user_id).1.is_some();
        let bot_in_voice = self.guild_gateway.voice_state(&bot_id).1.is_some();

        let decision = {
            let call_log = self.call_log.lock().unwrap();
            check_outbound_call(mentioned_in_voice, &self.dnd, &call_log, bot_in_voice)
        };
        if let Err(denied) = decision {
            info!(?denied, "outbound call denied by admission policy");
            return;
        }
        if self.session.busy() {
            info!("outbound call denied: session already busy");
            return;
        }
        self.call_log.lock().unwrap().record();

        let remote_addr = match parse_remote_with_default_port(&self.config.voip_address) {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "VoIP.Address is not a usable SIP target");
                return;
            }
        };

        self.guild_gateway
            .update_voice_channel(&self.config.discord_home_guild_id, Some(&self.config.discord_home_voice_channel_id));
        let invite = self.ua.invite(remote_addr, sdp::SIP_RTP_PORT);
        let app = self.clone();
        tokio::spawn(async move {
            match invite.await_final().await {
                Ok(Some(response)) if (200..300).contains(&response.status_code) => {
                    info!("outbound call answered");
                }
                Ok(Some(response)) => {
                    warn!(code = response.status_code, "outbound call rejected");
                    app.abandon_failed_call("the call was rejected.").await;
                }
                Ok(None) => {
                    warn!("outbound call produced no final response");
                    app.abandon_failed_call("the call timed out.").await;
                }
                Err(e) => {
                    warn!(error = %e, "outbound call failed");
                    app.abandon_failed_call("the call failed.").await;
                }
            }
        });
    }

    /// Leave the voice channel and tell the text channel why, per
    /// spec.md §7's requirement that a non-established `InviteError`
    /// be surfaced at the application call site rather than left silent.
    async fn abandon_failed_call(&self, reason: &str) {
        self.guild_gateway
            .update_voice_channel(&self.config.discord_home_guild_id, None);
        let message = format!("Couldn't place the call: {reason}");
        if let Err(e) = self
            .rest
            .post_message(&self.config.discord_home_text_channel_id, &message)
            .await
        {
            warn!(error = %e, "failed to post call failure message");
        }
    }

    async fn handle_guild_join(&self, guild_id: String) {
        if guild_id != self.config.discord_home_guild_id {
            return;
        }
        if let Err(e) = self
            .rest
            .post_message(&self.config.discord_home_text_channel_id, &self.config.welcome_message)
            .await
        {
            warn!(error = %e, "failed to post welcome message");
        }
    }
}

fn parse_remote_with_default_port(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    format!("{address}:{DEFAULT_SIP_PORT}")
        .parse()
        .map_err(|_| Error::Config(format!("VoIP.Address is not a valid host[:port]: {address}")))
}

fn register_listeners(app: Arc<App>, events: &EventBus) {
    let a = app.clone();
    events.on_async("inbound_call", move |_event| {
        let a = a.clone();
        async move { a.handle_inbound_call().await }
    });

    let a = app.clone();
    events.on_sync("inbound_call_ended", move |_event| {
        a.session.cleanup();
    });

    let a = app.clone();
    events.on_async("bot_mention", move |event| {
        let a = a.clone();
        async move {
            if let Event::BotMention { user_id, .. } = event {
                a.handle_bot_mention(user_id).await;
            }
        }
    });

    let a = app.clone();
    events.on_async("voice_connection_finalized", move |_event| {
        let a = a.clone();
        async move { a.try_bridge().await }
    });

    let a = app.clone();
    events.on_async("inbound_call_accepted", move |_event| {
        let a = a.clone();
        async move { a.try_bridge().await }
    });

    let a = app.clone();
    events.on_async("guild_join", move |event| {
        let a = a.clone();
        async move {
            if let Event::GuildJoin { guild_id } = event {
                a.handle_guild_join(guild_id).await;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;

    let allowlist = ResolvingAllowList::new(config.voip_allow_list.clone());
    allowlist.clone().spawn_refresh();

    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, DEFAULT_SIP_PORT).into();
    let transport = SipTransport::bind(bind_addr)
        .await
        .map_err(|e| Error::Io { addr: bind_addr, source: e })?;
    let table = TransactionTable::new();
    let dialogs = DialogTable::new();
    let session = Arc::new(SessionManager::new());
    let events = Arc::new(EventBus::new());

    // The socket binds on every interface, but Via/Contact/From headers and
    // SDP c=/o= lines must carry the address the SIP peer can actually reach
    // (config.public_ip), not 0.0.0.0.
    let public_addr = SocketAddr::new(config.public_ip, DEFAULT_SIP_PORT);
    let ua = UserAgent::new(
        public_addr,
        LOCAL_SIP_USER,
        transport.clone(),
        table.clone(),
        dialogs,
        session.clone(),
        events.clone(),
        allowlist,
    );

    let (unmatched_tx, mut unmatched_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(transport.clone().run(table, unmatched_tx));
    let ua_router = ua.clone();
    tokio::spawn(async move {
        while let Some((request, peer)) = unmatched_rx.recv().await {
            ua_router.create_transaction(request, peer);
        }
    });

    let (guild_gateway, mut voice_server_updates) = GuildGateway::new(config.discord_bot_token.clone(), events.clone());
    let rest = DiscordRest::new(config.discord_bot_token.clone());

    let app = Arc::new(App {
        call_log: Mutex::new(CallLog::new(config.hourly_call_limit)),
        dnd: DoNotDisturb::new(config.do_not_disturb.clone(), config.utc_offset_hours),
        config,
        session,
        ua,
        guild_gateway: guild_gateway.clone(),
        rest,
        voice_gateway: Mutex::new(None),
    });

    register_listeners(app.clone(), &events);

    let voice_server_app = app.clone();
    tokio::spawn(async move {
        while let Some((token, endpoint)) = voice_server_updates.recv().await {
            let guild_id = voice_server_app.config.discord_home_guild_id.clone();
            let user_id = voice_server_app.guild_gateway.user_id().unwrap_or_default();
            let session_id = voice_server_app.guild_gateway.session_id().unwrap_or_default();
            let voice_gateway = VoiceGateway::new(guild_id, user_id, token, endpoint, session_id);
            *voice_server_app.voice_gateway.lock().unwrap() = Some(voice_gateway.clone());

            let bridge_app = voice_server_app.clone();
            let ready_gateway = voice_gateway.clone();
            tokio::spawn(async move {
                ready_gateway.wait_ready().await;
                bridge_app.try_bridge().await;
            });

            let reconnect_app = voice_server_app.clone();
            tokio::spawn(async move {
                if let Err(e) = voice_gateway.connect().await {
                    warn!(error = %e, "voice gateway connection terminated, re-issuing VOICE_STATE_UPDATE");
                    // spec.md §4.7: once resumes are exhausted (or the close
                    // code was non-reconnectable), go through the guild
                    // gateway again to bootstrap a fresh voice session for
                    // the same channel.
                    reconnect_app.guild_gateway.update_voice_channel(
                        &reconnect_app.config.discord_home_guild_id,
                        Some(&reconnect_app.config.discord_home_voice_channel_id),
                    );
                }
            });
        }
    });

    if let Err(e) = guild_gateway.connect().await {
        error!(error = %e, "guild gateway connection terminated, exiting");
        return Err(e);
    }
    Ok(())
}
